//! Derived table shapes
//!
//! A [`SchemaTable`] is built once from a [`TableDef`]: it fixes the column
//! order, the persisted subsets, and the text of every statement the engine
//! issues for the type. Nothing here changes after registration.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

use super::descriptor::{ColumnDef, ColumnKind, TableDef};
use crate::error::SchemaError;
use crate::value::{FieldType, ScalarType};

/// Quote an identifier that has already passed [`validate_name`].
pub(crate) fn quote(ident: &str) -> String {
    format!("\"{}\"", ident)
}

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap_or_else(|_| unreachable!("static pattern"))
    })
}

/// Table and column names must be plain identifiers; they are spliced into
/// statement text.
pub fn validate_name(name: &str) -> Result<(), SchemaError> {
    if identifier_pattern().is_match(name) && !name.to_ascii_lowercase().starts_with("sqlite_") {
        Ok(())
    } else {
        Err(SchemaError::InvalidName(name.to_string()))
    }
}

/// One persisted (or navigable) field of a registered type.
#[derive(Debug, Clone)]
pub struct SchemaColumn {
    pub name: String,
    pub kind: ColumnKind,
    pub ty: FieldType,
    pub nullable: bool,
    pub unique: bool,
    pub cascade: bool,
    pub related: Option<String>,
    pub mapped_by: Option<String>,
    pub max_length: Option<u32>,
    /// Position in the selectable column list; `None` for columns without
    /// storage (one-to-many and mapped one-to-one)
    pub slot: Option<usize>,
}

impl SchemaColumn {
    pub fn is_persisted(&self) -> bool {
        self.slot.is_some()
    }

    /// Link whose foreign key is stored in this table
    pub fn is_forward_link(&self) -> bool {
        match self.kind {
            ColumnKind::LinkManyToOne => true,
            ColumnKind::LinkOneToOne => self.mapped_by.is_none(),
            _ => false,
        }
    }

    /// Link resolved through a foreign key in the related table
    pub fn is_mapped_link(&self) -> bool {
        match self.kind {
            ColumnKind::LinkOneToMany => true,
            ColumnKind::LinkOneToOne => self.mapped_by.is_some(),
            _ => false,
        }
    }

    /// SQL type of the stored value (integers for ids, links and streams)
    pub fn storage_type(&self) -> FieldType {
        match self.kind {
            ColumnKind::Leaf => self.ty,
            _ => FieldType::LONG,
        }
    }

    fn definition_sql(&self, related_id: Option<&str>) -> String {
        let name = quote(&self.name);
        match self.kind {
            ColumnKind::Id => format!("{} INTEGER PRIMARY KEY AUTOINCREMENT", name),
            ColumnKind::Leaf => {
                let mut def = format!("{} {}", name, self.ty.sql_type(self.max_length));
                if !self.nullable {
                    def.push_str(" NOT NULL DEFAULT ");
                    def.push_str(self.ty.zero_default());
                }
                def
            }
            ColumnKind::Stream => format!("{} INTEGER", name),
            _ => match (&self.related, related_id) {
                (Some(related), Some(id)) => {
                    format!("{} INTEGER REFERENCES {}({})", name, quote(related), quote(id))
                }
                _ => format!("{} INTEGER", name),
            },
        }
    }
}

/// Statements keyed to one forward link column, used for navigation from the
/// other side of the link.
#[derive(Debug, Clone)]
pub struct LinkStatements {
    /// Full rows whose foreign key matches, ordered by id; ends in `LIMIT ? OFFSET ?`
    pub select_window: String,
    pub count: String,
    pub contains: String,
    pub select_ids: String,
    /// Null the foreign key of every row pointing at an id
    pub remove: String,
    /// Point a JSON list of ids at one owner
    pub attach: String,
}

/// Per-table statement text.
#[derive(Debug, Clone)]
pub struct TableStatements {
    pub select_by_id: String,
    pub insert_bare: String,
    pub insert: String,
    pub update: HashMap<String, String>,
    pub delete_by_id: String,
    pub count: String,
    pub exists: String,
}

/// The derived, immutable shape of one registered record type.
#[derive(Debug)]
pub struct SchemaTable {
    name: String,
    def: &'static TableDef,
    columns: Vec<SchemaColumn>,
    id: usize,
    selectable: Vec<usize>,
    statements: TableStatements,
    links: HashMap<String, LinkStatements>,
}

impl SchemaTable {
    /// Derive the table shape, checking everything that can be checked
    /// without looking at other types.
    pub fn derive(def: &'static TableDef) -> Result<Self, SchemaError> {
        validate_name(def.name)?;
        let table = def.name.to_string();

        let mut columns = Vec::with_capacity(def.columns.len());
        let mut id: Option<usize> = None;
        let mut seen: HashMap<String, ()> = HashMap::new();
        let mut next_slot = 0;

        for (index, col) in def.columns.iter().enumerate() {
            validate_name(col.name)?;
            if seen.insert(col.name.to_ascii_lowercase(), ()).is_some() {
                return Err(SchemaError::DuplicateColumn {
                    table,
                    column: col.name.to_string(),
                });
            }
            check_column_flags(&table, col)?;

            if col.kind == ColumnKind::Id {
                if let Some(first) = id {
                    return Err(SchemaError::DuplicateId {
                        table,
                        first: def.columns[first].name.to_string(),
                        second: col.name.to_string(),
                    });
                }
                id = Some(index);
            }

            let persisted = match col.kind {
                ColumnKind::LinkOneToMany => false,
                ColumnKind::LinkOneToOne => col.mapped_by.is_none(),
                _ => true,
            };
            let slot = if persisted {
                next_slot += 1;
                Some(next_slot - 1)
            } else {
                None
            };

            columns.push(SchemaColumn {
                name: col.name.to_string(),
                kind: col.kind,
                ty: col.ty,
                nullable: col.nullable,
                unique: col.unique,
                cascade: col.cascade,
                related: col.related.map(|r| r.name.to_string()),
                mapped_by: col.mapped_by.map(str::to_string),
                max_length: col.max_length,
                slot,
            });
        }

        let id = id.ok_or_else(|| SchemaError::MissingId(table.clone()))?;
        let selectable: Vec<usize> = columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_persisted())
            .map(|(i, _)| i)
            .collect();

        let mut shape = Self {
            name: table,
            def,
            columns,
            id,
            selectable,
            statements: TableStatements {
                select_by_id: String::new(),
                insert_bare: String::new(),
                insert: String::new(),
                update: HashMap::new(),
                delete_by_id: String::new(),
                count: String::new(),
                exists: String::new(),
            },
            links: HashMap::new(),
        };
        shape.statements = shape.build_statements();
        shape.links = shape.build_link_statements();
        Ok(shape)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn descriptor(&self) -> &'static TableDef {
        self.def
    }

    pub fn columns(&self) -> &[SchemaColumn] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Result<&SchemaColumn, SchemaError> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| SchemaError::UnknownColumn {
                table: self.name.clone(),
                column: name.to_string(),
            })
    }

    pub fn id_column(&self) -> &SchemaColumn {
        &self.columns[self.id]
    }

    /// Columns read by select-by-id, in slot order
    pub fn selectable(&self) -> impl Iterator<Item = &SchemaColumn> {
        self.selectable.iter().map(move |&i| &self.columns[i])
    }

    pub fn selectable_len(&self) -> usize {
        self.selectable.len()
    }

    pub fn insertable(&self) -> impl Iterator<Item = &SchemaColumn> {
        self.selectable().filter(|c| c.kind != ColumnKind::Id)
    }

    pub fn updatable(&self) -> impl Iterator<Item = &SchemaColumn> {
        self.insertable()
    }

    pub fn stream_columns(&self) -> impl Iterator<Item = &SchemaColumn> {
        self.columns.iter().filter(|c| c.kind == ColumnKind::Stream)
    }

    pub fn forward_links(&self) -> impl Iterator<Item = &SchemaColumn> {
        self.columns.iter().filter(|c| c.is_forward_link())
    }

    pub fn statements(&self) -> &TableStatements {
        &self.statements
    }

    /// Navigation statements for a forward link column of this table
    pub fn link_statements(&self, column: &str) -> Result<&LinkStatements, SchemaError> {
        self.links.get(column).ok_or_else(|| SchemaError::InvalidLink {
            table: self.name.clone(),
            column: column.to_string(),
            reason: "not a forward link".to_string(),
        })
    }

    /// Comma-separated quoted selectable columns, optionally alias-qualified
    pub fn select_list(&self, alias: Option<&str>) -> String {
        self.selectable()
            .map(|c| match alias {
                Some(a) => format!("{}.{}", a, quote(&c.name)),
                None => quote(&c.name),
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn build_statements(&self) -> TableStatements {
        let table = quote(&self.name);
        let id = quote(&self.id_column().name);
        let insertable: Vec<String> = self.insertable().map(|c| quote(&c.name)).collect();

        let insert = if insertable.is_empty() {
            format!("INSERT INTO {} DEFAULT VALUES", table)
        } else {
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                table,
                insertable.join(", "),
                vec!["?"; insertable.len()].join(", ")
            )
        };

        let update = self
            .updatable()
            .map(|c| {
                (
                    c.name.clone(),
                    format!("UPDATE {} SET {} = ? WHERE {} = ?", table, quote(&c.name), id),
                )
            })
            .collect();

        TableStatements {
            select_by_id: format!("SELECT {} FROM {} WHERE {} = ?", self.select_list(None), table, id),
            insert_bare: format!("INSERT INTO {} DEFAULT VALUES", table),
            insert,
            update,
            delete_by_id: format!("DELETE FROM {} WHERE {} = ?", table, id),
            count: format!("SELECT COUNT(*) FROM {}", table),
            exists: format!("SELECT 1 FROM {} WHERE {} = ?", table, id),
        }
    }

    fn build_link_statements(&self) -> HashMap<String, LinkStatements> {
        let table = quote(&self.name);
        let id = quote(&self.id_column().name);
        self.forward_links()
            .map(|c| {
                let fk = quote(&c.name);
                let stmts = LinkStatements {
                    select_window: format!(
                        "SELECT {} FROM {} WHERE {} = ? ORDER BY {} LIMIT ? OFFSET ?",
                        self.select_list(None),
                        table,
                        fk,
                        id
                    ),
                    count: format!("SELECT COUNT(*) FROM {} WHERE {} = ?", table, fk),
                    contains: format!("SELECT 1 FROM {} WHERE {} = ? AND {} = ?", table, fk, id),
                    select_ids: format!("SELECT {} FROM {} WHERE {} = ? ORDER BY {}", id, table, fk, id),
                    remove: format!("UPDATE {} SET {} = NULL WHERE {} = ?", table, fk, fk),
                    attach: format!(
                        "UPDATE {} SET {} = ? WHERE {} IN (SELECT value FROM json_each(?))",
                        table, fk, id
                    ),
                };
                (c.name.clone(), stmts)
            })
            .collect()
    }

    fn related_id_name(&self, col: &SchemaColumn) -> Option<&'static str> {
        let related = self.def.columns.iter().find(|d| d.name == col.name)?.related?;
        related
            .columns
            .iter()
            .find(|d| d.kind == ColumnKind::Id)
            .map(|d| d.name)
    }

    /// `CREATE TABLE` statement for a table that does not exist yet
    pub fn create_table_sql(&self) -> String {
        let defs: Vec<String> = self
            .selectable()
            .map(|c| c.definition_sql(self.related_id_name(c)))
            .collect();
        format!("CREATE TABLE IF NOT EXISTS {} ({})", quote(&self.name), defs.join(", "))
    }

    /// `ALTER TABLE ... ADD COLUMN` for a column missing from storage
    pub fn add_column_sql(&self, column: &SchemaColumn) -> String {
        format!(
            "ALTER TABLE {} ADD COLUMN {}",
            quote(&self.name),
            column.definition_sql(self.related_id_name(column))
        )
    }

    pub fn drop_column_sql(&self, column: &str) -> String {
        format!("ALTER TABLE {} DROP COLUMN {}", quote(&self.name), quote(column))
    }

    pub fn unique_index_name(&self, column: &str) -> String {
        format!("ux_{}_{}", self.name, column)
    }

    pub fn link_index_name(&self, column: &str) -> String {
        format!("ix_{}_{}", self.name, column)
    }

    /// Index statements: unique columns and foreign keys
    pub fn index_sql(&self) -> Vec<String> {
        let table = quote(&self.name);
        let mut stmts = Vec::new();
        for col in self.selectable() {
            if col.unique {
                stmts.push(format!(
                    "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {}({})",
                    quote(&self.unique_index_name(&col.name)),
                    table,
                    quote(&col.name)
                ));
            }
            if col.is_forward_link() {
                stmts.push(format!(
                    "CREATE INDEX IF NOT EXISTS {} ON {}({})",
                    quote(&self.link_index_name(&col.name)),
                    table,
                    quote(&col.name)
                ));
            }
        }
        stmts
    }

    /// Statements dropping every index this engine might have created for a column
    pub fn drop_index_sql(&self, column: &str) -> Vec<String> {
        vec![
            format!("DROP INDEX IF EXISTS {}", quote(&self.unique_index_name(column))),
            format!("DROP INDEX IF EXISTS {}", quote(&self.link_index_name(column))),
        ]
    }
}

fn check_column_flags(table: &str, col: &ColumnDef) -> Result<(), SchemaError> {
    let invalid = |reason: &str| SchemaError::InvalidColumn {
        table: table.to_string(),
        column: col.name.to_string(),
        reason: reason.to_string(),
    };

    match col.kind {
        ColumnKind::Id => {
            if col.ty != FieldType::LONG {
                return Err(SchemaError::UnsupportedType {
                    table: table.to_string(),
                    column: col.name.to_string(),
                    ty: col.ty,
                });
            }
            if col.unique || col.cascade || col.max_length.is_some() {
                return Err(invalid("id columns take no modifiers"));
            }
        }
        ColumnKind::Leaf => {
            if !col.ty.is_supported() {
                return Err(SchemaError::UnsupportedType {
                    table: table.to_string(),
                    column: col.name.to_string(),
                    ty: col.ty,
                });
            }
            if col.max_length.is_some() && col.ty != FieldType::Scalar(ScalarType::Text) {
                return Err(invalid("max_length applies to text columns only"));
            }
            if col.cascade {
                return Err(invalid("cascade applies to links only"));
            }
        }
        ColumnKind::Stream => {
            if !col.nullable || col.unique || col.cascade || col.max_length.is_some() {
                return Err(invalid("stream columns take no modifiers"));
            }
        }
        ColumnKind::LinkManyToOne | ColumnKind::LinkOneToOne | ColumnKind::LinkOneToMany => {
            // Required links are enforced by the engine; the stored column
            // stays nullable so bare inserts succeed.
            if !col.nullable && col.mapped_by.is_some() {
                return Err(invalid("only forward links may be required"));
            }
            if !col.nullable && col.kind == ColumnKind::LinkOneToMany {
                return Err(invalid("only forward links may be required"));
            }
            if col.max_length.is_some() {
                return Err(invalid("max_length applies to text columns only"));
            }
            if col.related.is_none() {
                return Err(SchemaError::InvalidLink {
                    table: table.to_string(),
                    column: col.name.to_string(),
                    reason: "no related type".to_string(),
                });
            }
            if col.kind == ColumnKind::LinkOneToMany && col.mapped_by.is_none() {
                return Err(SchemaError::InvalidLink {
                    table: table.to_string(),
                    column: col.name.to_string(),
                    reason: "one-to-many links need a mapped_by column".to_string(),
                });
            }
            if col.unique && col.kind != ColumnKind::LinkOneToOne {
                return Err(invalid("only forward one-to-one links may be unique"));
            }
            if col.cascade && col.kind == ColumnKind::LinkManyToOne {
                return Err(invalid("cascade applies to one-to-one and one-to-many links"));
            }
        }
    }

    if col.unique && !col.nullable {
        return Err(invalid("unique columns must be nullable so bare inserts do not collide"));
    }
    Ok(())
}
