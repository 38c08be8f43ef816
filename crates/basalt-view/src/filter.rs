//! View filter predicates.
//!
//! A view filter is a conjunction of simple terms. `IS NOT NULL` terms guard
//! key columns; comparison terms restrict which base rows appear in the view.

use std::cmp::Ordering;
use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    Eq,
    Lt,
    Lte,
    Gt,
    Gte,
    IsNot,
}

impl Display for FilterOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FilterOp::Eq => "=",
            FilterOp::Lt => "<",
            FilterOp::Lte => "<=",
            FilterOp::Gt => ">",
            FilterOp::Gte => ">=",
            FilterOp::IsNot => "IS NOT",
        };
        f.write_str(s)
    }
}

/// Right-hand side of a filter term.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operand {
    Literal(Value),
    Null,
    /// A bound-parameter placeholder (`?` or `:name`).
    Bind(Option<String>),
}

impl Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Literal(v) => write!(f, "{v}"),
            Operand::Null => f.write_str("NULL"),
            Operand::Bind(Some(name)) => write!(f, ":{name}"),
            Operand::Bind(None) => f.write_str("?"),
        }
    }
}

/// One `column op operand` term of a view's WHERE clause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterTerm {
    pub column: String,
    pub op: FilterOp,
    pub operand: Operand,
}

impl FilterTerm {
    pub fn new(column: impl Into<String>, op: FilterOp, operand: Operand) -> Self {
        Self {
            column: column.into(),
            op,
            operand,
        }
    }

    pub fn is_not_null(column: impl Into<String>) -> Self {
        Self::new(column, FilterOp::IsNot, Operand::Null)
    }

    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(column, FilterOp::Eq, Operand::Literal(value.into()))
    }

    pub fn compare(column: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        Self::new(column, op, Operand::Literal(value.into()))
    }

    /// Returns true for the `col IS NOT NULL` form.
    pub fn is_not_null_guard(&self) -> bool {
        self.op == FilterOp::IsNot && self.operand == Operand::Null
    }

    pub fn has_bind_marker(&self) -> bool {
        matches!(self.operand, Operand::Bind(_))
    }

    /// Evaluates the term against the column's current value (`None` when the
    /// column is null or its cell is not live).
    ///
    /// Terms rejected at projection time (bind markers, `IS NOT <value>`,
    /// comparisons with NULL) never match.
    pub fn matches(&self, value: Option<&Value>) -> bool {
        match (&self.op, &self.operand) {
            (FilterOp::IsNot, Operand::Null) => value.is_some(),
            (op, Operand::Literal(literal)) => {
                let Some(value) = value else {
                    return false;
                };
                let Some(ordering) = value.compare(literal) else {
                    return false;
                };
                match op {
                    FilterOp::Eq => ordering == Ordering::Equal,
                    FilterOp::Lt => ordering == Ordering::Less,
                    FilterOp::Lte => ordering != Ordering::Greater,
                    FilterOp::Gt => ordering == Ordering::Greater,
                    FilterOp::Gte => ordering != Ordering::Less,
                    FilterOp::IsNot => false,
                }
            }
            _ => false,
        }
    }
}

impl Display for FilterTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.column, self.op, self.operand)
    }
}
