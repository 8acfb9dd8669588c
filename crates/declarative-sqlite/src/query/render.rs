//! Renders a structured [`Query`]/[`Where`] AST to a parameterized SQL
//! string (spec.md §1 non-goal: callers never hand us SQL text, but we still
//! have to hand SQLite some). Kept separate from `dependency.rs`: that module
//! walks the same AST for *analysis*, this one walks it for *execution*.

use super::builder::{FromSource, Join, JoinKind, JoinOn, OrderDirection, Query, SelectItem};
use super::expr::{ColumnRef, InList, Operand, Where};
use crate::value::Value;

struct Renderer {
    sql: String,
    params: Vec<Value>,
}

impl Renderer {
    fn new() -> Self {
        Renderer {
            sql: String::new(),
            params: Vec::new(),
        }
    }

    fn text(&mut self, s: &str) {
        self.sql.push_str(s);
    }

    fn param(&mut self, v: Value) {
        self.params.push(v);
        self.sql.push('?');
    }
}

/// Renders `query` to a `(sql, params)` pair ready for
/// `rusqlite::Statement::query_map`.
pub fn render(query: &Query) -> (String, Vec<Value>) {
    let mut r = Renderer::new();
    render_query(&mut r, query);
    (r.sql, r.params)
}

fn render_query(r: &mut Renderer, query: &Query) {
    r.text("SELECT ");
    if query.select.is_empty() {
        r.text("*");
    } else {
        for (i, item) in query.select.iter().enumerate() {
            if i > 0 {
                r.text(", ");
            }
            render_select_item(r, item);
        }
    }

    if let Some(from) = &query.from {
        r.text(" FROM ");
        render_from(r, from);
    }

    for join in &query.joins {
        render_join(r, join);
    }

    if let Some(w) = &query.where_clause {
        r.text(" WHERE ");
        render_where(r, w);
    }

    if !query.group_by.is_empty() {
        r.text(" GROUP BY ");
        for (i, c) in query.group_by.iter().enumerate() {
            if i > 0 {
                r.text(", ");
            }
            render_column(r, c);
        }
    }

    if let Some(h) = &query.having {
        r.text(" HAVING ");
        render_where(r, h);
    }

    if !query.order_by.is_empty() {
        r.text(" ORDER BY ");
        for (i, ob) in query.order_by.iter().enumerate() {
            if i > 0 {
                r.text(", ");
            }
            render_column(r, &ob.column);
            r.text(match ob.direction {
                OrderDirection::Asc => " ASC",
                OrderDirection::Desc => " DESC",
            });
        }
    }

    if let Some(limit) = query.limit {
        r.text(&format!(" LIMIT {limit}"));
    }
    if let Some(offset) = query.offset {
        r.text(&format!(" OFFSET {offset}"));
    }
}

fn render_select_item(r: &mut Renderer, item: &SelectItem) {
    match item {
        SelectItem::Column(c) => render_column(r, c),
        SelectItem::Aliased(c, alias) => {
            render_column(r, c);
            r.text(" AS ");
            r.text(&quote_ident(alias));
        }
        SelectItem::Wildcard => r.text("*"),
        SelectItem::TableWildcard(table) => {
            r.text(&quote_ident(table));
            r.text(".*");
        }
        SelectItem::SubQuery { query, alias } => {
            r.text("(");
            render_query(r, query);
            r.text(") AS ");
            r.text(&quote_ident(alias));
        }
        SelectItem::Raw { expr, alias } => {
            r.text(expr);
            if let Some(alias) = alias {
                r.text(" AS ");
                r.text(&quote_ident(alias));
            }
        }
    }
}

fn render_from(r: &mut Renderer, from: &FromSource) {
    match from {
        FromSource::Table { name, alias } | FromSource::View { name, alias } => {
            r.text(&quote_ident(name));
            if let Some(alias) = alias {
                r.text(" AS ");
                r.text(&quote_ident(alias));
            }
        }
        FromSource::SubQuery { query, alias } => {
            r.text("(");
            render_query(r, query);
            r.text(") AS ");
            r.text(&quote_ident(alias));
        }
    }
}

fn render_join(r: &mut Renderer, join: &Join) {
    r.text(match join.kind {
        JoinKind::Inner => " INNER JOIN ",
        JoinKind::Left => " LEFT JOIN ",
        JoinKind::Right => " RIGHT JOIN ",
        JoinKind::Full => " FULL JOIN ",
        JoinKind::Cross => " CROSS JOIN ",
    });
    render_from(r, &join.source);
    match &join.on {
        JoinOn::Where(w) => {
            r.text(" ON ");
            render_where(r, w);
        }
        JoinOn::Raw(raw) => {
            r.text(" ON ");
            r.text(raw);
        }
    }
}

fn render_column(r: &mut Renderer, column: &ColumnRef) {
    match column {
        ColumnRef::Unqualified(c) => r.text(&quote_ident(c)),
        ColumnRef::Qualified(table, c) => {
            r.text(&quote_ident(table));
            r.text(".");
            r.text(&quote_ident(c));
        }
    }
}

fn render_operand(r: &mut Renderer, operand: &Operand) {
    match operand {
        Operand::Value(v) => r.param(v.clone()),
        Operand::Column(c) => render_column(r, c),
    }
}

fn render_where(r: &mut Renderer, w: &Where) {
    match w {
        Where::Compare { column, op, value } => {
            render_column(r, column);
            r.text(" ");
            r.text(op.sql());
            r.text(" ");
            render_operand(r, value);
        }
        Where::IsNull(c) => {
            render_column(r, c);
            r.text(" IS NULL");
        }
        Where::IsNotNull(c) => {
            render_column(r, c);
            r.text(" IS NOT NULL");
        }
        Where::In { column, list } => {
            render_column(r, column);
            r.text(" IN (");
            match list {
                InList::Values(values) => {
                    for (i, v) in values.iter().enumerate() {
                        if i > 0 {
                            r.text(", ");
                        }
                        r.param(v.clone());
                    }
                }
                InList::SubQuery(query) => render_query(r, query),
            }
            r.text(")");
        }
        Where::Between { column, low, high } => {
            render_column(r, column);
            r.text(" BETWEEN ");
            r.param(low.clone());
            r.text(" AND ");
            r.param(high.clone());
        }
        Where::Like { column, pattern } => {
            render_column(r, column);
            r.text(" LIKE ");
            r.param(Value::Text(pattern.clone()));
        }
        Where::Not(inner) => {
            r.text("NOT (");
            render_where(r, inner);
            r.text(")");
        }
        Where::And(clauses) => render_nary(r, clauses, " AND "),
        Where::Or(clauses) => render_nary(r, clauses, " OR "),
        Where::Raw(raw) => r.text(raw),
    }
}

fn render_nary(r: &mut Renderer, clauses: &[Where], sep: &str) {
    if clauses.is_empty() {
        r.text("1");
        return;
    }
    r.text("(");
    for (i, clause) in clauses.iter().enumerate() {
        if i > 0 {
            r.text(sep);
        }
        render_where(r, clause);
    }
    r.text(")");
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
