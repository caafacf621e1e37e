//! Static schema descriptors
//!
//! A record type is described once, at compile time, by a [`TableDef`] holding
//! an array of [`ColumnDef`]s. Link columns point at the related descriptor so
//! a descriptor is self-describing: registering it reaches every related type.
//!
//! ```
//! use holdfast::{ColumnDef, FieldType, TableDef};
//!
//! static OWNER: TableDef = TableDef::new("Owner", &[
//!     ColumnDef::id("id"),
//!     ColumnDef::leaf("name", FieldType::TEXT).max_length(64),
//!     ColumnDef::one_to_many("widgets", &WIDGET, "owner"),
//! ]);
//!
//! static WIDGET: TableDef = TableDef::new("Widget", &[
//!     ColumnDef::id("id"),
//!     ColumnDef::leaf("weight", FieldType::INT).not_null(),
//!     ColumnDef::many_to_one("owner", &OWNER),
//! ]);
//! # assert_eq!(WIDGET.columns.len(), 3);
//! ```

use crate::value::FieldType;

/// Kind of a persisted field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnKind {
    /// Engine-assigned numeric primary key
    Id,
    /// Scalar or array value
    Leaf,
    /// Large binary object held in the blob store
    Stream,
    /// Single related record; forward side stores the foreign key, mapped
    /// side is resolved through the related table's foreign key
    LinkOneToOne,
    /// Single related record through a stored foreign key
    LinkManyToOne,
    /// Collection of related records holding a foreign key back to this one
    LinkOneToMany,
}

impl ColumnKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnKind::Id => "id",
            ColumnKind::Leaf => "leaf",
            ColumnKind::Stream => "stream",
            ColumnKind::LinkOneToOne => "one-to-one",
            ColumnKind::LinkManyToOne => "many-to-one",
            ColumnKind::LinkOneToMany => "one-to-many",
        }
    }

    pub fn is_link(&self) -> bool {
        matches!(
            self,
            ColumnKind::LinkOneToOne | ColumnKind::LinkManyToOne | ColumnKind::LinkOneToMany
        )
    }
}

impl std::fmt::Display for ColumnKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Declarative description of one record type.
#[derive(Debug)]
pub struct TableDef {
    pub name: &'static str,
    pub columns: &'static [ColumnDef],
}

impl TableDef {
    pub const fn new(name: &'static str, columns: &'static [ColumnDef]) -> Self {
        Self { name, columns }
    }
}

/// Declarative description of one field.
#[derive(Clone, Copy)]
pub struct ColumnDef {
    pub name: &'static str,
    pub kind: ColumnKind,
    /// Value type for leaf columns; ids, links and streams store integers
    pub ty: FieldType,
    pub nullable: bool,
    pub unique: bool,
    /// Forgetting the owner also forgets the linked record(s)
    pub cascade: bool,
    pub related: Option<&'static TableDef>,
    /// Foreign-key column on the related table (one-to-many and mapped one-to-one)
    pub mapped_by: Option<&'static str>,
    pub max_length: Option<u32>,
}

// Related descriptors may form cycles, so only their names are printed.
impl std::fmt::Debug for ColumnDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColumnDef")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("ty", &self.ty)
            .field("nullable", &self.nullable)
            .field("unique", &self.unique)
            .field("cascade", &self.cascade)
            .field("related", &self.related.map(|r| r.name))
            .field("mapped_by", &self.mapped_by)
            .field("max_length", &self.max_length)
            .finish()
    }
}

impl ColumnDef {
    const fn base(name: &'static str, kind: ColumnKind, ty: FieldType) -> Self {
        Self {
            name,
            kind,
            ty,
            nullable: true,
            unique: false,
            cascade: false,
            related: None,
            mapped_by: None,
            max_length: None,
        }
    }

    pub const fn id(name: &'static str) -> Self {
        Self {
            nullable: false,
            ..Self::base(name, ColumnKind::Id, FieldType::LONG)
        }
    }

    pub const fn leaf(name: &'static str, ty: FieldType) -> Self {
        Self::base(name, ColumnKind::Leaf, ty)
    }

    pub const fn stream(name: &'static str) -> Self {
        Self::base(name, ColumnKind::Stream, FieldType::LONG)
    }

    pub const fn many_to_one(name: &'static str, related: &'static TableDef) -> Self {
        Self {
            related: Some(related),
            ..Self::base(name, ColumnKind::LinkManyToOne, FieldType::LONG)
        }
    }

    /// One-to-one link whose foreign key lives in this table.
    pub const fn one_to_one(name: &'static str, related: &'static TableDef) -> Self {
        Self {
            related: Some(related),
            ..Self::base(name, ColumnKind::LinkOneToOne, FieldType::LONG)
        }
    }

    /// One-to-one link whose foreign key `mapped_by` lives in the related table.
    pub const fn mapped_one_to_one(
        name: &'static str,
        related: &'static TableDef,
        mapped_by: &'static str,
    ) -> Self {
        Self {
            related: Some(related),
            mapped_by: Some(mapped_by),
            ..Self::base(name, ColumnKind::LinkOneToOne, FieldType::LONG)
        }
    }

    pub const fn one_to_many(
        name: &'static str,
        related: &'static TableDef,
        mapped_by: &'static str,
    ) -> Self {
        Self {
            related: Some(related),
            mapped_by: Some(mapped_by),
            ..Self::base(name, ColumnKind::LinkOneToMany, FieldType::LONG)
        }
    }

    pub const fn not_null(self) -> Self {
        Self {
            nullable: false,
            ..self
        }
    }

    pub const fn unique(self) -> Self {
        Self {
            unique: true,
            ..self
        }
    }

    pub const fn cascade(self) -> Self {
        Self {
            cascade: true,
            ..self
        }
    }

    pub const fn max_length(self, max: u32) -> Self {
        Self {
            max_length: Some(max),
            ..self
        }
    }
}
