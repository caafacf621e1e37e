//! Deleting records
//!
//! One forget runs in a single lease: the cascade closure is collected,
//! large-object references of every doomed row are dropped, inbound links
//! are cleared (or the forget refused), and the rows are deleted. Orphaned
//! blobs are journaled before the commit and erased after it. Only then are
//! the cached representatives marked forgotten and cached referrers updated.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, warn};

use super::record::{ids_of, Record};
use crate::database::Shared;
use crate::error::SchemaError;
use crate::lob::LobId;
use crate::schema::table::quote;
use crate::schema::{Referrer, SchemaColumn, SchemaTable};
use crate::storage::Lease;
use crate::value::Value;
use crate::{Error, Result};

struct Target {
    table: Arc<SchemaTable>,
    id: i64,
}

/// Cached referrer fields to null once the forget commits.
struct Detached {
    table: String,
    slot: usize,
    ids: Vec<i64>,
}

pub(crate) fn forget(db: &Arc<Shared>, record: &Record) -> Result<()> {
    let (tables, inbound) = {
        let registry = db.registry.read();
        let tables: HashMap<String, Arc<SchemaTable>> = registry
            .tables()
            .map(|t| (t.name().to_string(), Arc::clone(t)))
            .collect();
        let inbound: HashMap<String, Vec<Referrer>> = tables
            .keys()
            .map(|name| (name.clone(), registry.referrers(name)))
            .collect();
        (tables, inbound)
    };
    let related = |col: &SchemaColumn| -> Result<Arc<SchemaTable>> {
        let name = col.related.as_deref().unwrap_or_default();
        tables
            .get(name)
            .cloned()
            .ok_or_else(|| SchemaError::NotRegistered(name.to_string()).into())
    };

    let mut lease = db.pool.poll()?;
    let targets = cascade_closure(&mut lease, record, &related)?;
    let doomed: HashSet<(&str, i64)> = targets.iter().map(|t| (t.table.name(), t.id)).collect();

    let mut orphans: Vec<LobId> = Vec::new();
    for target in &targets {
        for col in target.table.stream_columns() {
            let Some(lob) = lease.query_i64(&column_sql(&target.table, col), &[Value::Long(target.id)])? else {
                continue;
            };
            let lob = LobId::from_i64(lob);
            if db.lobs.del_ref(&mut lease, lob, target.table.name(), target.id)? && !orphans.contains(&lob) {
                orphans.push(lob);
            }
        }
    }

    let mut detached = Vec::new();
    for target in &targets {
        for referrer in inbound.get(target.table.name()).into_iter().flatten() {
            let holder_table = &referrer.table;
            let col = holder_table.column(&referrer.column)?;
            let stmts = holder_table.link_statements(&col.name)?;
            let holders: Vec<i64> = ids_of(lease.query(&stmts.select_ids, &[Value::Long(target.id)])?)
                .into_iter()
                .filter(|id| !doomed.contains(&(holder_table.name(), *id)))
                .collect();
            if holders.is_empty() {
                continue;
            }
            if !col.nullable {
                return Err(Error::StillReferenced {
                    table: target.table.name().to_string(),
                    id: target.id,
                    referrer: holder_table.name().to_string(),
                    column: col.name.clone(),
                });
            }
            lease.execute(&stmts.remove, &[Value::Long(target.id)])?;
            if let Some(slot) = col.slot {
                detached.push(Detached {
                    table: holder_table.name().to_string(),
                    slot,
                    ids: holders,
                });
            }
        }
    }

    for (index, target) in targets.iter().enumerate() {
        let deleted = lease.execute(&target.table.statements().delete_by_id, &[Value::Long(target.id)])?;
        if index == 0 && deleted != 1 {
            return Err(Error::NotFound {
                table: target.table.name().to_string(),
                id: target.id,
            });
        }
    }

    let mut pending = Vec::with_capacity(orphans.len());
    for lob in orphans {
        match db.lobs.begin_deletion(lob) {
            Ok(p) => pending.push(p),
            Err(e) => {
                abandon(db, pending);
                return Err(e);
            }
        }
    }
    if let Err(e) = lease.release() {
        abandon(db, pending);
        return Err(e);
    }
    for p in pending {
        if let Err(e) = db.lobs.complete_deletion(p) {
            warn!("deferred erase of large object {}: {}", p.id, e);
        }
    }

    for target in &targets {
        if let Some(cached) = db.cache(target.table.name()).evict(target.id) {
            cached.mark_forgotten();
        }
    }
    record.mark_forgotten();
    for d in detached {
        let cache = db.cache(&d.table);
        for id in d.ids {
            if let Some(holder) = cache.peek(id) {
                holder.apply(d.slot, Value::Null);
            }
        }
    }
    debug!("forgot {} ({} rows)", record, targets.len());
    Ok(())
}

/// The record plus everything its cascade links reach, root first.
fn cascade_closure<F>(lease: &mut Lease<'_>, record: &Record, related: &F) -> Result<Vec<Target>>
where
    F: Fn(&SchemaColumn) -> Result<Arc<SchemaTable>>,
{
    let mut targets = vec![Target {
        table: Arc::clone(record.table()),
        id: record.id(),
    }];
    let mut seen: HashSet<(String, i64)> = HashSet::new();
    seen.insert((record.table_name().to_string(), record.id()));

    let mut next = 0;
    while next < targets.len() {
        let table = Arc::clone(&targets[next].table);
        let id = targets[next].id;
        next += 1;

        for col in table.columns().iter().filter(|c| c.cascade) {
            let child_table = related(col)?;
            let children = if col.is_forward_link() {
                lease
                    .query_i64(&column_sql(&table, col), &[Value::Long(id)])?
                    .into_iter()
                    .collect()
            } else {
                let mapped_by = col.mapped_by.as_deref().unwrap_or_default();
                let stmts = child_table.link_statements(mapped_by)?;
                ids_of(lease.query(&stmts.select_ids, &[Value::Long(id)])?)
            };
            for child in children {
                if seen.insert((child_table.name().to_string(), child)) {
                    targets.push(Target {
                        table: Arc::clone(&child_table),
                        id: child,
                    });
                }
            }
        }
    }
    Ok(targets)
}

fn column_sql(table: &SchemaTable, col: &SchemaColumn) -> String {
    format!(
        "SELECT {} FROM {} WHERE {} = ?",
        quote(&col.name),
        quote(table.name()),
        quote(&table.id_column().name)
    )
}

fn abandon(db: &Shared, pending: Vec<crate::lob::PendingDeletion>) {
    for p in pending {
        if let Err(e) = db.lobs.abandon_deletion(p) {
            warn!("could not clear journaled deletion of {}: {}", p.id, e);
        }
    }
}
