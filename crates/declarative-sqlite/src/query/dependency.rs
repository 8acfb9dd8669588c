//! Structural dependency analysis (spec.md §4.3): given a [`Query`], work
//! out which tables and columns a stream watching it must re-run on,
//! without ever touching SQL text. The registry (`stream.rs`) uses this to
//! decide whether a write invalidates a live stream.

use std::collections::HashSet;

use super::builder::{FromSource, JoinOn, Query, SelectItem};
use super::expr::{ColumnRef, InList, Operand, Where};
use crate::schema::{is_system_column, Schema};

/// The structural read-set of a query: every table it touches (transitively
/// through views) and every `(table, column)` pair it references.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dependencies {
    /// Tables and views read, expanded transitively through view
    /// definitions (spec.md §4.3: "computed transitively through views").
    pub tables: HashSet<String>,
    /// `(table, column)` pairs referenced anywhere in the query, with view
    /// column references expanded back to the underlying table column when
    /// the schema can resolve the mapping.
    pub columns: HashSet<(String, String)>,
    /// `true` if a bare `*` is selected anywhere — every column of every
    /// table in scope is a dependency.
    pub uses_wildcard: bool,
    /// Tables for which a `table.*` was selected, independent of
    /// `uses_wildcard` (spec.md §4.6: "the stream uses a wildcard on that
    /// table").
    pub wildcard_tables: HashSet<String>,
}

impl Dependencies {
    /// Whether a change to `table` should be treated as touching every
    /// column of that table for this dependency set.
    pub fn is_wildcard_on(&self, table: &str) -> bool {
        self.uses_wildcard || self.wildcard_tables.contains(table)
    }

    /// Whether a write to `(table, column)` should invalidate a stream with
    /// this dependency set.
    pub fn touches(&self, table: &str, column: &str) -> bool {
        if !self.tables.contains(table) {
            return false;
        }
        self.is_wildcard_on(table) || self.columns.contains(&(table.to_owned(), column.to_owned()))
    }
}

/// One level of alias scope: the `FROM`/`JOIN` sources visible at a given
/// query nesting level, in declaration order.
struct ScopeEntry {
    alias: String,
    /// `None` for sub-query sources — their projected columns aren't a
    /// schema table/view, so unqualified references through their alias
    /// can't be resolved to a physical column.
    table: Option<String>,
}

type Scope = Vec<ScopeEntry>;

/// Computes the structural dependency set of `query` against `schema`.
pub fn analyze(query: &Query, schema: &Schema) -> Dependencies {
    let mut deps = Dependencies::default();
    let mut scopes: Vec<Scope> = Vec::new();
    walk_query(query, schema, &mut scopes, &mut deps);
    deps
}

fn walk_query(query: &Query, schema: &Schema, scopes: &mut Vec<Scope>, deps: &mut Dependencies) {
    let mut frame: Scope = Vec::new();

    if let Some(from) = &query.from {
        resolve_source(from, schema, scopes, deps, &mut frame);
    }
    for join in &query.joins {
        resolve_source(&join.source, schema, scopes, deps, &mut frame);
    }

    scopes.push(frame);

    for item in &query.select {
        match item {
            SelectItem::Column(c) | SelectItem::Aliased(c, _) => record_column(c, scopes, schema, deps),
            SelectItem::Wildcard => {
                deps.uses_wildcard = true;
                for entry in scopes.last().unwrap() {
                    if let Some(t) = &entry.table {
                        expand_table(t, schema, &mut deps.wildcard_tables);
                    }
                }
            }
            SelectItem::TableWildcard(alias) => {
                if let Some(t) = resolve_alias(alias, scopes).map(str::to_owned) {
                    expand_table(&t, schema, &mut deps.wildcard_tables);
                }
            }
            SelectItem::SubQuery { query: sub, .. } => walk_query(sub, schema, scopes, deps),
            SelectItem::Raw { .. } => {}
        }
    }

    for join in &query.joins {
        if let JoinOn::Where(w) = &join.on {
            record_where(w, scopes, schema, deps);
        }
    }
    if let Some(w) = &query.where_clause {
        record_where(w, scopes, schema, deps);
    }
    for c in &query.group_by {
        record_column(c, scopes, schema, deps);
    }
    if let Some(h) = &query.having {
        record_where(h, scopes, schema, deps);
    }
    for ob in &query.order_by {
        record_column(&ob.column, scopes, schema, deps);
    }

    scopes.pop();
}

fn resolve_source(
    source: &FromSource,
    schema: &Schema,
    scopes: &mut Vec<Scope>,
    deps: &mut Dependencies,
    frame: &mut Scope,
) {
    match source {
        FromSource::Table { name, alias } | FromSource::View { name, alias } => {
            expand_table(name, schema, &mut deps.tables);
            frame.push(ScopeEntry {
                alias: alias.clone().unwrap_or_else(|| name.clone()),
                table: Some(name.clone()),
            });
        }
        FromSource::SubQuery { query, alias } => {
            walk_query(query, schema, scopes, deps);
            frame.push(ScopeEntry {
                alias: alias.clone(),
                table: None,
            });
        }
    }
}

/// Adds `table` to `out`, then recurses into its view definition's
/// `source_tables` if it names a view (spec.md §4.3 "transitively through
/// views"). Guards against cyclic view definitions via the `out` set itself.
fn expand_table(table: &str, schema: &Schema, out: &mut HashSet<String>) {
    if !out.insert(table.to_owned()) {
        return;
    }
    if let Some(view) = schema.find_view(table) {
        for src in &view.source_tables {
            expand_table(src, schema, out);
        }
    }
}

fn resolve_alias<'a>(alias: &str, scopes: &'a [Scope]) -> Option<&'a str> {
    for scope in scopes.iter().rev() {
        for entry in scope.iter().rev() {
            if entry.alias == alias {
                return entry.table.as_deref();
            }
        }
    }
    None
}

/// Resolves an unqualified column name against the in-scope tables,
/// innermost scope first ("closest-wins"). Within the matching scope we
/// prefer a table that actually declares the column; if none (or several
/// ambiguously) do, we fall back to the first in-scope table (spec.md
/// §4.3: "falls back to the first in-scope table").
fn resolve_unqualified<'a>(column: &str, scopes: &'a [Scope], schema: &Schema) -> Option<&'a str> {
    let flat: Vec<&ScopeEntry> = scopes.iter().rev().flat_map(|s| s.iter()).collect();
    if flat.is_empty() {
        return None;
    }
    for entry in &flat {
        if let Some(table) = &entry.table {
            if column_in_table_or_view(table, column, schema) {
                return Some(table.as_str());
            }
        }
    }
    flat.first().and_then(|e| e.table.as_deref())
}

fn column_in_table_or_view(table_or_view: &str, column: &str, schema: &Schema) -> bool {
    if is_system_column(column) {
        return true;
    }
    if let Some(table) = schema.find_table(table_or_view) {
        return table.find_column(column).is_some();
    }
    if let Some(view) = schema.find_view(table_or_view) {
        return view.columns.iter().any(|c| c == column);
    }
    false
}

fn record_column(column: &ColumnRef, scopes: &[Scope], schema: &Schema, deps: &mut Dependencies) {
    let resolved = match column.qualifier() {
        Some(alias) => resolve_alias(alias, scopes).map(str::to_owned),
        None => resolve_unqualified(column.name(), scopes, schema).map(str::to_owned),
    };
    let Some(table_or_view) = resolved else {
        // Unknown/unresolvable columns never invalidate streams (spec.md §4.3).
        return;
    };
    record_resolved_column(&table_or_view, column.name(), schema, deps);
}

/// Records `(table_or_view, column)`, and if `table_or_view` names a view,
/// additionally records the same column name against every source table
/// (recursively through nested views) that actually declares it — the only
/// way to map a view column back to the physical column that changed,
/// given views carry a flat column name list rather than a per-column
/// source mapping (spec.md §3 "View").
fn record_resolved_column(table_or_view: &str, column: &str, schema: &Schema, deps: &mut Dependencies) {
    deps.columns.insert((table_or_view.to_owned(), column.to_owned()));
    if let Some(view) = schema.find_view(table_or_view) {
        for src in view.source_tables.clone() {
            if schema.find_view(&src).is_some() {
                record_resolved_column(&src, column, schema, deps);
            } else if column_in_table_or_view(&src, column, schema) {
                deps.columns.insert((src, column.to_owned()));
            }
        }
    }
}

fn record_where(expr: &Where, scopes: &[Scope], schema: &Schema, deps: &mut Dependencies) {
    match expr {
        Where::Compare { column, value, .. } => {
            record_column(column, scopes, schema, deps);
            if let Operand::Column(c) = value {
                record_column(c, scopes, schema, deps);
            }
        }
        Where::IsNull(c) | Where::IsNotNull(c) | Where::Like { column: c, .. } => {
            record_column(c, scopes, schema, deps)
        }
        Where::In { column, list } => {
            record_column(column, scopes, schema, deps);
            if let InList::SubQuery(sub) = list {
                // Sub-queries in an `IN (...)` see the outer scope for
                // correlation, same as a `SubQuery` select item.
                let mut nested = scopes.to_vec_scopes();
                walk_query(sub, schema, &mut nested, deps);
            }
        }
        Where::Between { column, .. } => record_column(column, scopes, schema, deps),
        Where::Not(inner) => record_where(inner, scopes, schema, deps),
        Where::And(items) | Where::Or(items) => {
            for item in items {
                record_where(item, scopes, schema, deps);
            }
        }
        Where::Raw(_) => {}
    }
}

/// Scope frames borrow no schema state, so a shallow alias-preserving clone
/// is all `walk_query`'s `&mut Vec<Scope>` parameter needs here.
trait ScopesExt {
    fn to_vec_scopes(&self) -> Vec<Scope>;
}

impl ScopesExt for [Scope] {
    fn to_vec_scopes(&self) -> Vec<Scope> {
        self.iter()
            .map(|scope| {
                scope
                    .iter()
                    .map(|e| ScopeEntry {
                        alias: e.alias.clone(),
                        table: e.table.clone(),
                    })
                    .collect()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::builder::{Join, JoinKind, OrderDirection};
    use crate::schema::{Column, StorageType, Table};

    fn schema_with_orders_and_customers() -> Schema {
        Schema::new()
            .table(
                Table::new("customers")
                    .column(Column::new("name", StorageType::Text))
                    .column(Column::new("region", StorageType::Text)),
            )
            .table(
                Table::new("orders")
                    .column(Column::new("customer_id", StorageType::Integer))
                    .column(Column::new("total", StorageType::Real)),
            )
    }

    #[test]
    fn simple_query_depends_on_its_table_and_selected_columns() {
        let schema = schema_with_orders_and_customers();
        let query = Query::from_table("orders")
            .select_column("total")
            .where_clause(Where::eq("customer_id", 1i64));

        let deps = analyze(&query, &schema);
        assert!(deps.tables.contains("orders"));
        assert!(deps.columns.contains(&("orders".to_owned(), "total".to_owned())));
        assert!(deps.columns.contains(&("orders".to_owned(), "customer_id".to_owned())));
        assert!(!deps.uses_wildcard);
    }

    #[test]
    fn join_resolves_qualified_and_unqualified_columns() {
        let schema = schema_with_orders_and_customers();
        let query = Query::from_table("orders")
            .alias("o")
            .select_column("o.total")
            .select_column("region")
            .join(Join {
                kind: JoinKind::Inner,
                source: FromSource::Table {
                    name: "customers".into(),
                    alias: Some("c".into()),
                },
                on: JoinOn::Where(Where::eq_column("o.customer_id", "c.id")),
            });

        let deps = analyze(&query, &schema);
        assert!(deps.tables.contains("orders"));
        assert!(deps.tables.contains("customers"));
        assert!(deps.columns.contains(&("orders".to_owned(), "total".to_owned())));
        // `region` only exists on `customers`, so it resolves there even
        // though `orders` is the first in-scope table.
        assert!(deps.columns.contains(&("customers".to_owned(), "region".to_owned())));
    }

    #[test]
    fn ambiguous_unqualified_column_falls_back_to_first_in_scope_table() {
        let schema = Schema::new()
            .table(Table::new("a").column(Column::new("shared", StorageType::Text)))
            .table(Table::new("b").column(Column::new("shared", StorageType::Text)));
        let query = Query::from_table("a")
            .select_column("shared")
            .join(Join {
                kind: JoinKind::Inner,
                source: FromSource::Table {
                    name: "b".into(),
                    alias: None,
                },
                on: JoinOn::Raw("1=1".into()),
            });

        let deps = analyze(&query, &schema);
        assert!(deps.columns.contains(&("a".to_owned(), "shared".to_owned())));
    }

    #[test]
    fn unresolvable_column_is_excluded() {
        let schema = schema_with_orders_and_customers();
        let query = Query::from_table("orders").select_column("ghost.nope");
        let deps = analyze(&query, &schema);
        assert!(deps.columns.is_empty());
    }

    #[test]
    fn view_expands_tables_and_maps_columns_back_to_source() {
        let schema = Schema::new()
            .table(Table::new("orders").column(Column::new("total", StorageType::Real)))
            .view(crate::schema::View::new("order_totals", "SELECT total FROM orders")
                .columns(["total"])
                .reads(["orders"]));

        let query = Query::from_view("order_totals").select_column("total");
        let deps = analyze(&query, &schema);
        assert!(deps.tables.contains("order_totals"));
        assert!(deps.tables.contains("orders"));
        assert!(deps.columns.contains(&("order_totals".to_owned(), "total".to_owned())));
        assert!(deps.columns.contains(&("orders".to_owned(), "total".to_owned())));
    }

    #[test]
    fn bare_wildcard_marks_every_in_scope_table() {
        let schema = schema_with_orders_and_customers();
        let query = Query::from_table("orders").select_all().join(Join {
            kind: JoinKind::Inner,
            source: FromSource::Table {
                name: "customers".into(),
                alias: None,
            },
            on: JoinOn::Raw("1=1".into()),
        });

        let deps = analyze(&query, &schema);
        assert!(deps.uses_wildcard);
        assert!(deps.is_wildcard_on("orders"));
        assert!(deps.is_wildcard_on("customers"));
    }

    #[test]
    fn table_wildcard_only_marks_that_table() {
        let schema = schema_with_orders_and_customers();
        let query = Query::from_table("orders")
            .alias("o")
            .select_table_all("o")
            .join(Join {
                kind: JoinKind::Inner,
                source: FromSource::Table {
                    name: "customers".into(),
                    alias: None,
                },
                on: JoinOn::Raw("1=1".into()),
            });

        let deps = analyze(&query, &schema);
        assert!(!deps.uses_wildcard);
        assert!(deps.is_wildcard_on("orders"));
        assert!(!deps.is_wildcard_on("customers"));
    }

    #[test]
    fn order_by_and_group_by_columns_are_tracked() {
        let schema = schema_with_orders_and_customers();
        let query = Query::from_table("orders")
            .select_column("customer_id")
            .group_by(["customer_id"])
            .order_by("total", OrderDirection::Desc);

        let deps = analyze(&query, &schema);
        assert!(deps.columns.contains(&("orders".to_owned(), "customer_id".to_owned())));
        assert!(deps.columns.contains(&("orders".to_owned(), "total".to_owned())));
    }
}
