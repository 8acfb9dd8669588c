//! Structured representation of a `SELECT` (spec.md §3 "Query"). Built up
//! with a fluent API; never parsed from or rendered to a bare SQL string
//! that the caller hands us (spec.md §1 non-goal: "not SQL strings").

use super::expr::{ColumnRef, Where};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
    Right,
    Full,
    Cross,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FromSource {
    Table { name: String, alias: Option<String> },
    View { name: String, alias: Option<String> },
    SubQuery { query: Box<Query>, alias: String },
}

impl FromSource {
    pub fn effective_alias(&self) -> &str {
        match self {
            FromSource::Table { name, alias } | FromSource::View { name, alias } => {
                alias.as_deref().unwrap_or(name)
            }
            FromSource::SubQuery { alias, .. } => alias,
        }
    }

    pub fn table_name(&self) -> Option<&str> {
        match self {
            FromSource::Table { name, .. } | FromSource::View { name, .. } => Some(name),
            FromSource::SubQuery { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub kind: JoinKind,
    pub source: FromSource,
    /// `Structured` ON clause, or a raw-SQL escape hatch.
    pub on: JoinOn,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JoinOn {
    Where(Where),
    Raw(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectItem {
    Column(ColumnRef),
    Aliased(ColumnRef, String),
    Wildcard,
    TableWildcard(String),
    SubQuery { query: Box<Query>, alias: String },
    Raw { expr: String, alias: Option<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub column: ColumnRef,
    pub direction: OrderDirection,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub from: Option<FromSource>,
    pub select: Vec<SelectItem>,
    pub joins: Vec<Join>,
    pub where_clause: Option<Where>,
    pub group_by: Vec<ColumnRef>,
    pub having: Option<Where>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    /// Authorizes CRUD on the result set against `targetTable`
    /// (spec.md §4.7 "forUpdate").
    pub for_update: Option<String>,
}

impl Query {
    pub fn from_table(name: impl Into<String>) -> Self {
        Query {
            from: Some(FromSource::Table {
                name: name.into(),
                alias: None,
            }),
            ..Default::default()
        }
    }

    pub fn from_view(name: impl Into<String>) -> Self {
        Query {
            from: Some(FromSource::View {
                name: name.into(),
                alias: None,
            }),
            ..Default::default()
        }
    }

    pub fn from_subquery(query: Query, alias: impl Into<String>) -> Self {
        Query {
            from: Some(FromSource::SubQuery {
                query: Box::new(query),
                alias: alias.into(),
            }),
            ..Default::default()
        }
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        let alias = alias.into();
        match &mut self.from {
            Some(FromSource::Table { alias: a, .. }) | Some(FromSource::View { alias: a, .. }) => {
                *a = Some(alias);
            }
            _ => {}
        }
        self
    }

    pub fn select(mut self, item: SelectItem) -> Self {
        self.select.push(item);
        self
    }

    pub fn select_column(self, column: impl Into<ColumnRef>) -> Self {
        self.select(SelectItem::Column(column.into()))
    }

    pub fn select_all(self) -> Self {
        self.select(SelectItem::Wildcard)
    }

    pub fn select_table_all(self, table: impl Into<String>) -> Self {
        self.select(SelectItem::TableWildcard(table.into()))
    }

    pub fn join(mut self, join: Join) -> Self {
        self.joins.push(join);
        self
    }

    pub fn inner_join(self, source: FromSource, on: Where) -> Self {
        self.join(Join {
            kind: JoinKind::Inner,
            source,
            on: JoinOn::Where(on),
        })
    }

    pub fn left_join(self, source: FromSource, on: Where) -> Self {
        self.join(Join {
            kind: JoinKind::Left,
            source,
            on: JoinOn::Where(on),
        })
    }

    pub fn where_clause(mut self, condition: Where) -> Self {
        self.where_clause = Some(condition);
        self
    }

    pub fn group_by(mut self, columns: impl IntoIterator<Item = impl Into<ColumnRef>>) -> Self {
        self.group_by = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn having(mut self, condition: Where) -> Self {
        self.having = Some(condition);
        self
    }

    pub fn order_by(mut self, column: impl Into<ColumnRef>, direction: OrderDirection) -> Self {
        self.order_by.push(OrderBy {
            column: column.into(),
            direction,
        });
        self
    }

    pub fn limit(mut self, n: i64) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn offset(mut self, n: i64) -> Self {
        self.offset = Some(n);
        self
    }

    pub fn for_update(mut self, target_table: impl Into<String>) -> Self {
        self.for_update = Some(target_table.into());
        self
    }

    /// `true` if any select item is `*` or `table.*` anywhere in this query.
    pub fn uses_wildcard(&self) -> bool {
        self.select
            .iter()
            .any(|item| matches!(item, SelectItem::Wildcard | SelectItem::TableWildcard(_)))
    }
}
