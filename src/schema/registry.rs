//! Registered record types and storage reconciliation
//!
//! Registering a descriptor derives it and every related descriptor it reaches
//! that isn't registered yet, validates the links between them, then brings
//! the stored tables in line: missing tables are created, missing columns
//! added, and stored columns the descriptor no longer declares dropped when
//! the configuration allows it.

use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rusqlite::types::Value as SqlValue;
use tracing::{debug, info, warn};

use super::descriptor::{ColumnKind, TableDef};
use super::table::{SchemaColumn, SchemaTable};
use crate::error::SchemaError;
use crate::storage::Lease;
use crate::value::Value;
use crate::Result;

/// What reconciliation changed for one table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub table: String,
    pub created: bool,
    pub added: Vec<String>,
    pub dropped: Vec<String>,
    /// Stored columns not declared by the descriptor and left in place
    pub ignored: Vec<String>,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        !self.created && self.added.is_empty() && self.dropped.is_empty()
    }
}

/// A forward link in some registered table pointing at another table.
#[derive(Debug, Clone)]
pub struct Referrer {
    pub table: Arc<SchemaTable>,
    pub column: String,
}

/// The set of registered record types.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    tables: HashMap<String, Arc<SchemaTable>>,
    order: Vec<String>,
    /// Names registered by a direct call rather than reached through a link
    explicit: HashSet<String>,
    by_type: HashMap<TypeId, String>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Result<Arc<SchemaTable>, SchemaError> {
        self.tables
            .get(name)
            .cloned()
            .ok_or_else(|| SchemaError::NotRegistered(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn by_type(&self, type_id: TypeId) -> Option<Arc<SchemaTable>> {
        self.by_type.get(&type_id).and_then(|name| self.tables.get(name)).cloned()
    }

    /// Associate a Rust type with an already registered table.
    pub fn bind_type(&mut self, type_id: TypeId, name: &str) {
        self.by_type.insert(type_id, name.to_string());
    }

    /// Registered tables in registration order
    pub fn tables(&self) -> impl Iterator<Item = &Arc<SchemaTable>> {
        self.order.iter().filter_map(|name| self.tables.get(name))
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn clear(&mut self) {
        self.tables.clear();
        self.order.clear();
        self.explicit.clear();
        self.by_type.clear();
    }

    /// Every forward link in a registered table that points at `name`.
    pub fn referrers(&self, name: &str) -> Vec<Referrer> {
        self.tables()
            .flat_map(|table| {
                table
                    .forward_links()
                    .filter(|c| c.related.as_deref() == Some(name))
                    .map(|c| Referrer {
                        table: Arc::clone(table),
                        column: c.name.clone(),
                    })
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Derive `def` and every unregistered descriptor reachable from it.
    /// Tables are returned in discovery order, `def` first.
    pub fn plan(&self, def: &'static TableDef) -> Result<Vec<SchemaTable>, SchemaError> {
        if let Some(existing) = self.tables.get(def.name) {
            return Err(if std::ptr::eq(existing.descriptor(), def) {
                SchemaError::AlreadyRegistered(def.name.to_string())
            } else {
                SchemaError::ConflictingDescriptor(def.name.to_string())
            });
        }

        let mut seen: HashMap<&'static str, &'static TableDef> = HashMap::new();
        let mut pending = Vec::new();
        let mut stack = vec![def];

        while let Some(next) = stack.pop() {
            if let Some(existing) = self.tables.get(next.name) {
                if !std::ptr::eq(existing.descriptor(), next) {
                    return Err(SchemaError::ConflictingDescriptor(next.name.to_string()));
                }
                continue;
            }
            if let Some(&other) = seen.get(next.name) {
                if !std::ptr::eq(other, next) {
                    return Err(SchemaError::ConflictingDescriptor(next.name.to_string()));
                }
                continue;
            }
            seen.insert(next.name, next);
            pending.push(SchemaTable::derive(next)?);
            // Reverse so related types are discovered in declaration order.
            for col in next.columns.iter().rev() {
                if let Some(related) = col.related {
                    stack.push(related);
                }
            }
        }

        for table in &pending {
            self.check_links(table, &pending)?;
        }
        Ok(pending)
    }

    fn resolve<'a>(&'a self, name: &str, pending: &'a [SchemaTable]) -> Option<&'a SchemaTable> {
        pending
            .iter()
            .find(|t| t.name() == name)
            .or_else(|| self.tables.get(name).map(|t| t.as_ref()))
    }

    fn check_links(&self, table: &SchemaTable, pending: &[SchemaTable]) -> Result<(), SchemaError> {
        for col in table.columns().iter().filter(|c| c.kind.is_link()) {
            let invalid = |reason: String| SchemaError::InvalidLink {
                table: table.name().to_string(),
                column: col.name.clone(),
                reason,
            };
            let related_name = col.related.as_deref().unwrap_or_default();
            let related = self
                .resolve(related_name, pending)
                .ok_or_else(|| invalid(format!("related type {} is not known", related_name)))?;

            let Some(mapped_by) = col.mapped_by.as_deref() else {
                continue;
            };
            let back = related.column(mapped_by).map_err(|_| {
                invalid(format!("{} has no column {}", related.name(), mapped_by))
            })?;
            if !back.is_forward_link() || back.related.as_deref() != Some(table.name()) {
                return Err(invalid(format!(
                    "{}.{} is not a forward link to {}",
                    related.name(),
                    mapped_by,
                    table.name()
                )));
            }
            let expected = match col.kind {
                ColumnKind::LinkOneToOne => ColumnKind::LinkOneToOne,
                _ => ColumnKind::LinkManyToOne,
            };
            if back.kind != expected {
                return Err(invalid(format!(
                    "{}.{} is {}, expected {}",
                    related.name(),
                    mapped_by,
                    back.kind,
                    expected
                )));
            }
        }
        Ok(())
    }

    /// Plan, reconcile storage and commit the result into the registry. The
    /// registry is only changed once every table has been reconciled.
    pub fn register(
        &mut self,
        def: &'static TableDef,
        lease: &mut Lease<'_>,
        drop_unknown_columns: bool,
    ) -> Result<(Arc<SchemaTable>, Vec<ReconcileReport>)> {
        // A type reached earlier through a link is already reconciled.
        if let Some(existing) = self.tables.get(def.name).cloned() {
            if !std::ptr::eq(existing.descriptor(), def) {
                return Err(SchemaError::ConflictingDescriptor(def.name.to_string()).into());
            }
            if !self.explicit.insert(def.name.to_string()) {
                return Err(SchemaError::AlreadyRegistered(def.name.to_string()).into());
            }
            return Ok((existing, Vec::new()));
        }

        let pending = self.plan(def)?;
        let mut reports = Vec::with_capacity(pending.len());
        for table in &pending {
            let report = reconcile(lease, table, drop_unknown_columns)?;
            if !report.is_noop() {
                info!(
                    "reconciled {}: created={}, added={:?}, dropped={:?}",
                    report.table, report.created, report.added, report.dropped
                );
            }
            reports.push(report);
        }
        lease.commit()?;

        let mut root = None;
        for table in pending {
            let name = table.name().to_string();
            let table = Arc::new(table);
            if root.is_none() {
                root = Some(Arc::clone(&table));
            }
            debug!("registered record type {}", name);
            self.order.push(name.clone());
            self.tables.insert(name, table);
        }
        let root = root.ok_or_else(|| SchemaError::NotRegistered(def.name.to_string()))?;
        self.explicit.insert(def.name.to_string());
        Ok((root, reports))
    }
}

/// Stored column names and whether each is part of the primary key.
fn stored_columns(lease: &mut Lease<'_>, table: &str) -> Result<Vec<(String, bool)>> {
    let rows = lease.query(
        "SELECT name, pk FROM pragma_table_info(?)",
        &[Value::Text(table.to_string())],
    )?;
    Ok(rows
        .into_iter()
        .filter_map(|row| {
            let mut it = row.into_iter();
            match (it.next(), it.next()) {
                (Some(SqlValue::Text(name)), Some(SqlValue::Integer(pk))) => Some((name, pk > 0)),
                _ => None,
            }
        })
        .collect())
}

pub(crate) fn table_exists(lease: &mut Lease<'_>, table: &str) -> Result<bool> {
    Ok(lease
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?",
            &[Value::Text(table.to_string())],
        )?
        .is_some())
}

/// Bring the stored table in line with its derived shape.
pub fn reconcile(
    lease: &mut Lease<'_>,
    table: &SchemaTable,
    drop_unknown_columns: bool,
) -> Result<ReconcileReport> {
    let mut report = ReconcileReport {
        table: table.name().to_string(),
        ..Default::default()
    };

    if !table_exists(lease, table.name())? {
        lease.execute_batch(&table.create_table_sql())?;
        report.created = true;
    } else {
        let stored = stored_columns(lease, table.name())?;
        let stored_names: HashSet<String> =
            stored.iter().map(|(n, _)| n.to_ascii_lowercase()).collect();

        let missing: Vec<&SchemaColumn> = table
            .selectable()
            .filter(|c| !stored_names.contains(&c.name.to_ascii_lowercase()))
            .collect();
        for col in missing {
            if col.kind == ColumnKind::Id {
                warn!("table {} exists without id column {}", table.name(), col.name);
                continue;
            }
            lease.execute_batch(&table.add_column_sql(col))?;
            report.added.push(col.name.clone());
        }

        let declared: HashSet<String> = table
            .selectable()
            .map(|c| c.name.to_ascii_lowercase())
            .collect();
        for (name, primary_key) in stored {
            if declared.contains(&name.to_ascii_lowercase()) {
                continue;
            }
            if primary_key || !drop_unknown_columns {
                debug!("leaving undeclared column {}.{}", table.name(), name);
                report.ignored.push(name);
                continue;
            }
            for stmt in table.drop_index_sql(&name) {
                lease.execute_batch(&stmt)?;
            }
            lease.execute_batch(&table.drop_column_sql(&name))?;
            report.dropped.push(name);
        }
    }

    for stmt in table.index_sql() {
        lease.execute_batch(&stmt)?;
    }
    Ok(report)
}
