//! Filter expressions
//!
//! Expressions are plain owned trees built with the free functions below and
//! the combinator methods on [`Expr`]:
//!
//! ```
//! use holdfast::{exists, field, lit, param, Select};
//!
//! let heavy = field("weight").gt(lit(10))
//!     .and(field("owner.name").like(param("owner")))
//!     .or(field("name").is_null().group());
//! let has_parts = exists(Select::from("Part").filter(holdfast::outer("id").eq(field("widget"))));
//! # let _ = (heavy, has_parts);
//! ```
//!
//! Field paths are column names joined by dots; every hop but the last must
//! be a link column.

use crate::schema::TableDef;
use crate::value::Value;

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Like,
}

impl CompareOp {
    pub fn sql(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Like => "LIKE",
        }
    }
}

/// Sort direction of an order key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

impl Direction {
    pub fn sql(&self) -> &'static str {
        match self {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        }
    }
}

/// A filter expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Column path relative to the current query
    Field(String),
    /// Column path relative to the enclosing query (inside a sub-select)
    Outer(String),
    Literal(Value),
    /// Named placeholder bound on the result
    Param(String),
    Compare {
        op: CompareOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    IsNull(Box<Expr>),
    IsNotNull(Box<Expr>),
    InList(Box<Expr>, Vec<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    /// Explicit parentheses
    Group(Box<Expr>),
    Exists(Box<Select>),
    NotExists(Box<Select>),
}

impl Expr {
    fn compare(self, op: CompareOp, right: Expr) -> Expr {
        Expr::Compare {
            op,
            left: Box::new(self),
            right: Box::new(right),
        }
    }

    pub fn eq(self, right: impl Into<Expr>) -> Expr {
        self.compare(CompareOp::Eq, right.into())
    }

    pub fn ne(self, right: impl Into<Expr>) -> Expr {
        self.compare(CompareOp::Ne, right.into())
    }

    pub fn lt(self, right: impl Into<Expr>) -> Expr {
        self.compare(CompareOp::Lt, right.into())
    }

    pub fn le(self, right: impl Into<Expr>) -> Expr {
        self.compare(CompareOp::Le, right.into())
    }

    pub fn gt(self, right: impl Into<Expr>) -> Expr {
        self.compare(CompareOp::Gt, right.into())
    }

    pub fn ge(self, right: impl Into<Expr>) -> Expr {
        self.compare(CompareOp::Ge, right.into())
    }

    pub fn like(self, pattern: impl Into<Expr>) -> Expr {
        self.compare(CompareOp::Like, pattern.into())
    }

    pub fn is_null(self) -> Expr {
        Expr::IsNull(Box::new(self))
    }

    pub fn is_not_null(self) -> Expr {
        Expr::IsNotNull(Box::new(self))
    }

    pub fn in_list<I>(self, items: I) -> Expr
    where
        I: IntoIterator,
        I::Item: Into<Expr>,
    {
        Expr::InList(Box::new(self), items.into_iter().map(Into::into).collect())
    }

    /// Conjunction; nested conjunctions are flattened.
    pub fn and(self, other: Expr) -> Expr {
        match (self, other) {
            (Expr::And(mut a), Expr::And(b)) => {
                a.extend(b);
                Expr::And(a)
            }
            (Expr::And(mut a), b) => {
                a.push(b);
                Expr::And(a)
            }
            (a, b) => Expr::And(vec![a, b]),
        }
    }

    /// Disjunction; nested disjunctions are flattened.
    pub fn or(self, other: Expr) -> Expr {
        match (self, other) {
            (Expr::Or(mut a), Expr::Or(b)) => {
                a.extend(b);
                Expr::Or(a)
            }
            (Expr::Or(mut a), b) => {
                a.push(b);
                Expr::Or(a)
            }
            (a, b) => Expr::Or(vec![a, b]),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Expr {
        Expr::Not(Box::new(self))
    }

    pub fn group(self) -> Expr {
        Expr::Group(Box::new(self))
    }

    /// Leaves compile to a single term and never need parentheses.
    pub(crate) fn is_atomic(&self) -> bool {
        matches!(
            self,
            Expr::Field(_) | Expr::Outer(_) | Expr::Literal(_) | Expr::Param(_) | Expr::Group(_)
        )
    }
}

impl From<Value> for Expr {
    fn from(value: Value) -> Self {
        Expr::Literal(value)
    }
}

pub fn field(path: impl Into<String>) -> Expr {
    Expr::Field(path.into())
}

pub fn outer(path: impl Into<String>) -> Expr {
    Expr::Outer(path.into())
}

pub fn lit(value: impl Into<Value>) -> Expr {
    Expr::Literal(value.into())
}

pub fn param(name: impl Into<String>) -> Expr {
    Expr::Param(name.into())
}

pub fn exists(select: Select) -> Expr {
    Expr::Exists(Box::new(select))
}

pub fn not_exists(select: Select) -> Expr {
    Expr::NotExists(Box::new(select))
}

/// A correlated sub-select, usable only under [`exists`]/[`not_exists`].
#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub(crate) table: String,
    pub(crate) filter: Option<Expr>,
}

impl Select {
    pub fn filter(mut self, expr: Expr) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => existing.and(expr),
            None => expr,
        });
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

impl From<&str> for Select {
    fn from(table: &str) -> Self {
        Select {
            table: table.to_string(),
            filter: None,
        }
    }
}

impl From<&TableDef> for Select {
    fn from(def: &TableDef) -> Self {
        Select::from(def.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_and_or_flatten() {
        let e = field("a").eq(lit(1)).and(field("b").eq(lit(2))).and(field("c").is_null());
        match e {
            Expr::And(items) => assert_eq!(items.len(), 3),
            other => panic!("unexpected {:?}", other),
        }
        let o = field("a").is_null().or(field("b").is_null()).or(field("c").is_null());
        assert!(matches!(o, Expr::Or(ref items) if items.len() == 3));
    }

    #[test]
    fn test_group_stops_flattening() {
        let inner = field("a").is_null().and(field("b").is_null()).group();
        let e = inner.and(field("c").is_null());
        assert!(matches!(e, Expr::And(ref items) if items.len() == 2));
    }

    #[test]
    fn test_select_filters_accumulate() {
        let s = Select::from("Part").filter(field("a").is_null()).filter(field("b").is_null());
        assert_eq!(s.table(), "Part");
        assert!(matches!(s.filter, Some(Expr::And(ref items)) if items.len() == 2));
    }
}
