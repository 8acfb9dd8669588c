//! The structured `WHERE`-expression AST (spec.md §3 "Where-expression").
//! There is deliberately no SQL string parser here — callers build this
//! tree directly, and the dependency analyzer walks it structurally.

use crate::value::Value;

/// A column reference, optionally qualified by table/alias. Used both in
/// `SELECT` lists and inside `Where` expressions (join predicates reference
/// columns of other in-scope tables this way).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnRef {
    Unqualified(String),
    Qualified(String, String),
}

impl ColumnRef {
    pub fn name(&self) -> &str {
        match self {
            ColumnRef::Unqualified(c) => c,
            ColumnRef::Qualified(_, c) => c,
        }
    }

    pub fn qualifier(&self) -> Option<&str> {
        match self {
            ColumnRef::Unqualified(_) => None,
            ColumnRef::Qualified(q, _) => Some(q),
        }
    }
}

impl From<&str> for ColumnRef {
    /// `"table.column"` becomes qualified; anything without a `.` is
    /// unqualified.
    fn from(s: &str) -> Self {
        match s.split_once('.') {
            Some((table, column)) => ColumnRef::Qualified(table.to_owned(), column.to_owned()),
            None => ColumnRef::Unqualified(s.to_owned()),
        }
    }
}

impl From<String> for ColumnRef {
    fn from(s: String) -> Self {
        ColumnRef::from(s.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    pub fn sql(self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }
}

/// The right-hand side of a comparison: either a bound value or a
/// reference to another column (used for join predicates like
/// `orders.customer_id = customers.id`).
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Value(Value),
    Column(ColumnRef),
}

#[derive(Debug, Clone, PartialEq)]
pub enum InList {
    Values(Vec<Value>),
    SubQuery(Box<crate::query::builder::Query>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Where {
    Compare {
        column: ColumnRef,
        op: CompareOp,
        value: Operand,
    },
    IsNull(ColumnRef),
    IsNotNull(ColumnRef),
    In {
        column: ColumnRef,
        list: InList,
    },
    Between {
        column: ColumnRef,
        low: Value,
        high: Value,
    },
    Like {
        column: ColumnRef,
        pattern: String,
    },
    Not(Box<Where>),
    And(Vec<Where>),
    Or(Vec<Where>),
    /// Escape hatch for conditions the structured AST cannot express.
    /// Contributes no column dependency (spec.md §3 "raw SQL escape hatches").
    Raw(String),
}

impl Where {
    pub fn eq(column: impl Into<ColumnRef>, value: impl Into<Value>) -> Self {
        Where::Compare {
            column: column.into(),
            op: CompareOp::Eq,
            value: Operand::Value(value.into()),
        }
    }

    pub fn eq_column(left: impl Into<ColumnRef>, right: impl Into<ColumnRef>) -> Self {
        Where::Compare {
            column: left.into(),
            op: CompareOp::Eq,
            value: Operand::Column(right.into()),
        }
    }

    pub fn and(clauses: impl IntoIterator<Item = Where>) -> Self {
        Where::And(clauses.into_iter().collect())
    }

    pub fn or(clauses: impl IntoIterator<Item = Where>) -> Self {
        Where::Or(clauses.into_iter().collect())
    }
}
