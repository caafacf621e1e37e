//! Expression compilation
//!
//! Walks a filter once, emitting SQL text and the ordered list of parameter
//! slots. Every distinct navigation path in a query scope gets one join alias;
//! a path seen again in the same scope reuses it. Sub-selects open a nested
//! scope whose root is aliased `s<n>`; `outer(..)` paths resolve against the
//! enclosing scope.

use std::collections::HashMap;
use std::sync::Arc;

use super::expr::{Direction, Expr, Select};
use crate::error::SchemaError;
use crate::schema::table::quote;
use crate::schema::SchemaTable;
use crate::value::Value;
use crate::{Error, Result};

/// Registered tables by name, snapshotted for one compilation.
pub type Catalog = HashMap<String, Arc<SchemaTable>>;

/// A value bound at execution time.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamSlot {
    Literal(Value),
    Named(String),
}

/// Statements for one query. `select_sql` and `ids_sql` end in
/// `LIMIT ? OFFSET ?`.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    pub count_sql: String,
    pub select_sql: String,
    pub ids_sql: String,
    pub params: Vec<ParamSlot>,
    /// Whether a to-many join forced grouping by the root id
    pub grouped: bool,
}

impl CompiledQuery {
    /// Parameter values in statement order.
    pub fn bind(&self, bindings: &HashMap<String, Value>) -> Result<Vec<Value>> {
        self.params
            .iter()
            .map(|slot| match slot {
                ParamSlot::Literal(v) => Ok(v.clone()),
                ParamSlot::Named(name) => bindings
                    .get(name)
                    .cloned()
                    .ok_or_else(|| Error::InvalidQuery(format!("parameter {:?} is not bound", name))),
            })
            .collect()
    }

    /// Placeholder names, in first-use order.
    pub fn param_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for slot in &self.params {
            if let ParamSlot::Named(name) = slot {
                if !names.contains(&name.as_str()) {
                    names.push(name);
                }
            }
        }
        names
    }
}

struct Scope {
    alias: String,
    table: Arc<SchemaTable>,
    joins: Vec<String>,
    /// Dotted path prefix -> (alias, table)
    paths: HashMap<String, (String, Arc<SchemaTable>)>,
    to_many: bool,
}

impl Scope {
    fn new(alias: String, table: Arc<SchemaTable>) -> Self {
        Self {
            alias,
            table,
            joins: Vec::new(),
            paths: HashMap::new(),
            to_many: false,
        }
    }

    fn from_clause(&self) -> String {
        let mut sql = format!("{} {}", quote(self.table.name()), self.alias);
        for join in &self.joins {
            sql.push(' ');
            sql.push_str(join);
        }
        sql
    }
}

struct Compiler<'a> {
    catalog: &'a Catalog,
    scopes: Vec<Scope>,
    next_join: usize,
    next_sub: usize,
    params: Vec<ParamSlot>,
}

/// Compile a query over `root`.
pub fn compile(
    catalog: &Catalog,
    root: &Arc<SchemaTable>,
    filter: Option<&Expr>,
    order: &[(String, Direction)],
    descending: bool,
) -> Result<CompiledQuery> {
    let mut c = Compiler {
        catalog,
        scopes: vec![Scope::new("t0".to_string(), Arc::clone(root))],
        next_join: 1,
        next_sub: 1,
        params: Vec::new(),
    };

    let where_sql = match filter {
        Some(expr) => Some(c.expr(expr)?),
        None => None,
    };
    let mut keys = Vec::with_capacity(order.len());
    for (path, direction) in order {
        keys.push((c.path(c.scopes.len() - 1, path)?, *direction));
    }

    let scope = c.scopes.pop().ok_or_else(|| Error::InvalidQuery("no query scope".to_string()))?;
    let id = format!("t0.{}", quote(&root.id_column().name));
    let mut body = format!("FROM {}", scope.from_clause());
    if let Some(w) = &where_sql {
        body.push_str(" WHERE ");
        body.push_str(w);
    }

    let count_sql = format!("SELECT COUNT(DISTINCT {}) {}", id, body);

    let mut tail = String::new();
    if scope.to_many {
        tail.push_str(&format!(" GROUP BY {}", id));
    }
    let mut order_terms: Vec<String> = keys
        .into_iter()
        .map(|(key, direction)| {
            let key = match (scope.to_many, direction) {
                (true, Direction::Asc) => format!("MIN({})", key),
                (true, Direction::Desc) => format!("MAX({})", key),
                (false, _) => key,
            };
            format!("{} {}", key, direction.sql())
        })
        .collect();
    let id_direction = if descending { Direction::Desc } else { Direction::Asc };
    order_terms.push(format!("{} {}", id, id_direction.sql()));
    tail.push_str(&format!(" ORDER BY {} LIMIT ? OFFSET ?", order_terms.join(", ")));

    Ok(CompiledQuery {
        count_sql,
        select_sql: format!("SELECT {} {}{}", root.select_list(Some("t0")), body, tail),
        ids_sql: format!("SELECT {} {}{}", id, body, tail),
        params: c.params,
        grouped: scope.to_many,
    })
}

impl Compiler<'_> {
    fn table(&self, name: &str) -> Result<Arc<SchemaTable>> {
        self.catalog
            .get(name)
            .cloned()
            .ok_or_else(|| SchemaError::NotRegistered(name.to_string()).into())
    }

    /// Resolve a dotted path in scope `level`, adding joins as needed.
    fn path(&mut self, level: usize, path: &str) -> Result<String> {
        let segments: Vec<&str> = path.split('.').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(Error::InvalidQuery(format!("malformed field path {:?}", path)));
        }

        let mut alias = self.scopes[level].alias.clone();
        let mut table = Arc::clone(&self.scopes[level].table);
        let mut prefix = String::new();

        for (i, segment) in segments.iter().enumerate() {
            let col = table.column(segment)?.clone();
            let last = i + 1 == segments.len();
            if last && col.is_persisted() {
                return Ok(format!("{}.{}", alias, quote(&col.name)));
            }
            if !col.kind.is_link() {
                return Err(Error::InvalidQuery(format!(
                    "{} in {:?} is not a link column",
                    segment, path
                )));
            }

            if !prefix.is_empty() {
                prefix.push('.');
            }
            prefix.push_str(segment);
            let (joined, related) = match self.scopes[level].paths.get(&prefix) {
                Some((a, t)) => (a.clone(), Arc::clone(t)),
                None => {
                    let related = self.table(col.related.as_deref().unwrap_or_default())?;
                    let joined = format!("t{}", self.next_join);
                    self.next_join += 1;
                    let on = match col.mapped_by.as_deref() {
                        Some(mapped_by) if col.is_mapped_link() => format!(
                            "{}.{} = {}.{}",
                            joined,
                            quote(mapped_by),
                            alias,
                            quote(&table.id_column().name)
                        ),
                        _ => format!(
                            "{}.{} = {}.{}",
                            joined,
                            quote(&related.id_column().name),
                            alias,
                            quote(&col.name)
                        ),
                    };
                    let scope = &mut self.scopes[level];
                    scope
                        .joins
                        .push(format!("LEFT JOIN {} {} ON {}", quote(related.name()), joined, on));
                    if col.is_mapped_link() {
                        scope.to_many = true;
                    }
                    scope.paths.insert(prefix.clone(), (joined.clone(), Arc::clone(&related)));
                    (joined, related)
                }
            };

            if last {
                // A path ending on a mapped link names the related row's id.
                return Ok(format!("{}.{}", joined, quote(&related.id_column().name)));
            }
            alias = joined;
            table = related;
        }
        Err(Error::InvalidQuery(format!("empty field path {:?}", path)))
    }

    fn operand(&mut self, expr: &Expr) -> Result<String> {
        let sql = self.expr(expr)?;
        Ok(if expr.is_atomic() { sql } else { format!("({})", sql) })
    }

    fn expr(&mut self, expr: &Expr) -> Result<String> {
        let current = self.scopes.len() - 1;
        Ok(match expr {
            Expr::Field(path) => self.path(current, path)?,
            Expr::Outer(path) => {
                if current == 0 {
                    return Err(Error::InvalidQuery(format!(
                        "outer({:?}) used outside a sub-select",
                        path
                    )));
                }
                self.path(current - 1, path)?
            }
            Expr::Literal(Value::Null) => "NULL".to_string(),
            Expr::Literal(value) => {
                self.params.push(ParamSlot::Literal(value.clone()));
                "?".to_string()
            }
            Expr::Param(name) => {
                self.params.push(ParamSlot::Named(name.clone()));
                "?".to_string()
            }
            Expr::Compare { op, left, right } => {
                let l = self.operand(left)?;
                let r = self.operand(right)?;
                format!("{} {} {}", l, op.sql(), r)
            }
            Expr::IsNull(inner) => format!("{} IS NULL", self.operand(inner)?),
            Expr::IsNotNull(inner) => format!("{} IS NOT NULL", self.operand(inner)?),
            Expr::InList(_, items) if items.is_empty() => "0".to_string(),
            Expr::InList(inner, items) => {
                let target = self.operand(inner)?;
                let items = items
                    .iter()
                    .map(|item| self.operand(item))
                    .collect::<Result<Vec<_>>>()?;
                format!("{} IN ({})", target, items.join(", "))
            }
            Expr::And(items) if items.is_empty() => "1".to_string(),
            Expr::And(items) => {
                let parts = items
                    .iter()
                    .map(|item| match item {
                        Expr::Or(_) => Ok(format!("({})", self.expr(item)?)),
                        _ => self.expr(item),
                    })
                    .collect::<Result<Vec<_>>>()?;
                parts.join(" AND ")
            }
            Expr::Or(items) if items.is_empty() => "0".to_string(),
            Expr::Or(items) => items
                .iter()
                .map(|item| self.expr(item))
                .collect::<Result<Vec<_>>>()?
                .join(" OR "),
            Expr::Not(inner) => format!("NOT ({})", self.expr(inner)?),
            Expr::Group(inner) => format!("({})", self.expr(inner)?),
            Expr::Exists(select) => format!("EXISTS ({})", self.subselect(select)?),
            Expr::NotExists(select) => format!("NOT EXISTS ({})", self.subselect(select)?),
        })
    }

    fn subselect(&mut self, select: &Select) -> Result<String> {
        let table = self.table(&select.table)?;
        let alias = format!("s{}", self.next_sub);
        self.next_sub += 1;
        self.scopes.push(Scope::new(alias, table));

        let filter = match &select.filter {
            Some(expr) => self.expr(expr),
            None => Ok(String::new()),
        };
        let scope = self
            .scopes
            .pop()
            .ok_or_else(|| Error::InvalidQuery("unbalanced sub-select".to_string()))?;
        let filter = filter?;

        let mut sql = format!("SELECT 1 FROM {}", scope.from_clause());
        if !filter.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&filter);
        }
        Ok(sql)
    }
}
