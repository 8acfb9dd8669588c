//! Schema differ and migration planner/executor (spec.md §4.2).
//!
//! `plan()` is pure (no I/O); `apply()` runs the resulting steps inside a
//! single transaction, rolling the whole plan back on any failure.

use crate::error::{Error, Result};
use crate::introspect::{LiveSchema, LiveTable};
use crate::schema::{CascadePolicy, Column, DefaultValue, Schema, Table, View};
use crate::value::Value;
use rusqlite::Connection;

#[derive(Debug, Clone)]
pub enum MigrationStep {
    CreateTable(Table),
    CreateView(View),
    AddColumn { table: String, column: Column },
    RecreateTable {
        table: String,
        new_table: Table,
        preserved_columns: Vec<String>,
    },
    DropView(String),
    DropTable(String),
}

/// Diffs `declared` against `live` and produces an ordered plan:
/// create tables, create views, alter surviving tables, drop views, drop
/// tables (spec.md §4.2).
pub fn plan(declared: &Schema, live: &LiveSchema) -> Result<Vec<MigrationStep>> {
    let mut steps = Vec::new();

    for table in &declared.tables {
        if live.find_table(&table.name).is_none() {
            steps.push(MigrationStep::CreateTable(table.clone()));
        }
    }

    for view in &declared.views {
        if live.find_view(&view.name).is_none() {
            steps.push(MigrationStep::CreateView(view.clone()));
        }
    }

    for table in &declared.tables {
        let Some(live_table) = live.find_table(&table.name) else {
            continue; // handled by CreateTable above
        };
        plan_table_changes(table, live_table, &mut steps)?;
    }

    for view in &live.views {
        if declared.find_view(&view.name).is_none() {
            steps.push(MigrationStep::DropView(view.name.clone()));
        }
    }

    for table in &live.tables {
        if declared.find_table(&table.name).is_none() && !is_reserved_internal_table(&table.name) {
            steps.push(MigrationStep::DropTable(table.name.clone()));
        }
    }

    Ok(steps)
}

/// Tables `Database::open` creates itself after the migration plan runs
/// (journal, sync cursors, fileset registry). A caller's declared schema
/// never names them, so without this guard every second `open()` of a
/// persisted database would plan their deletion (spec.md §4.2 "Idempotence").
fn is_reserved_internal_table(name: &str) -> bool {
    matches!(
        name,
        crate::journal::TABLE_NAME | crate::sync::TABLE_NAME | crate::fileset::REGISTRY_TABLE
    )
}

fn plan_table_changes(table: &Table, live_table: &LiveTable, steps: &mut Vec<MigrationStep>) -> Result<()> {
    let desired = table.all_columns();

    let has_dropped_columns = live_table
        .columns
        .iter()
        .any(|c| !desired.iter().any(|d| d.name == c.name));
    let has_changed_columns = desired.iter().any(|d| match live_table.find_column(&d.name) {
        Some(live_col) => !column_matches(table, d, live_col),
        None => false,
    });

    if has_dropped_columns || has_changed_columns {
        let preserved_columns: Vec<String> = desired
            .iter()
            .filter(|d| live_table.find_column(&d.name).is_some())
            .map(|d| d.name.clone())
            .collect();
        steps.push(MigrationStep::RecreateTable {
            table: table.name.clone(),
            new_table: table.clone(),
            preserved_columns,
        });
        return Ok(());
    }

    for column in &desired {
        if live_table.find_column(&column.name).is_none() {
            if !column.nullable && !matches!(column.default, Some(DefaultValue::Static(_))) {
                return Err(Error::schema(format!(
                    "cannot add NOT NULL column `{}` to `{}` without a static default to backfill existing rows",
                    column.name, table.name
                )));
            }
            steps.push(MigrationStep::AddColumn {
                table: table.name.clone(),
                column: column.clone(),
            });
        }
    }

    Ok(())
}

fn column_matches(table: &Table, desired: &Column, live: &crate::introspect::LiveColumn) -> bool {
    let type_matches = desired
        .storage_type
        .sql_type_name()
        .eq_ignore_ascii_case(live.decl_type.trim());
    let nullability_matches = (!desired.nullable) == live.not_null;
    let is_declared_pk = table.keys.primary.iter().any(|c| c == &desired.name);
    let pk_matches = is_declared_pk == live.primary_key;
    type_matches && nullability_matches && pk_matches
}

/// Applies `steps` inside a single transaction; any failure rolls the whole
/// plan back (spec.md §4.2 "Atomicity").
pub fn apply(conn: &mut Connection, steps: &[MigrationStep]) -> Result<()> {
    let tx = conn.transaction()?;
    for step in steps {
        apply_step(&tx, step).map_err(|e| Error::Transaction(Box::new(e)))?;
    }
    tx.commit()?;
    Ok(())
}

fn apply_step(tx: &rusqlite::Transaction<'_>, step: &MigrationStep) -> Result<()> {
    match step {
        MigrationStep::CreateTable(table) => {
            tracing::info!(table = %table.name, "creating table");
            tx.execute_batch(&create_table_sql(table))?;
            for stmt in index_statements(table) {
                tx.execute_batch(&stmt)?;
            }
        }
        MigrationStep::CreateView(view) => {
            tracing::info!(view = %view.name, "creating view");
            tx.execute_batch(&format!(
                "CREATE VIEW {} AS {}",
                quote_ident(&view.name),
                view.sql
            ))?;
        }
        MigrationStep::AddColumn { table, column } => {
            tracing::info!(table = %table, column = %column.name, "adding column");
            tx.execute_batch(&format!(
                "ALTER TABLE {} ADD COLUMN {}",
                quote_ident(table),
                column_ddl(column)
            ))?;
        }
        MigrationStep::RecreateTable {
            table,
            new_table,
            preserved_columns,
        } => {
            tracing::info!(table = %table, "recreating table (rename-recreate-copy-drop)");
            recreate_table(tx, table, new_table, preserved_columns)?;
        }
        MigrationStep::DropView(name) => {
            tracing::info!(view = %name, "dropping view");
            tx.execute_batch(&format!("DROP VIEW {}", quote_ident(name)))?;
        }
        MigrationStep::DropTable(name) => {
            tracing::info!(table = %name, "dropping table");
            tx.execute_batch(&format!("DROP TABLE {}", quote_ident(name)))?;
        }
    }
    Ok(())
}

fn recreate_table(
    tx: &rusqlite::Transaction<'_>,
    old_name: &str,
    new_table: &Table,
    preserved_columns: &[String],
) -> Result<()> {
    let tmp_name = format!("{}__migrate_new", new_table.name);
    let mut tmp_table = new_table.clone();
    tmp_table.name = tmp_name.clone();

    tx.execute_batch(&create_table_sql(&tmp_table))?;

    if !preserved_columns.is_empty() {
        let cols = preserved_columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        tx.execute(
            &format!(
                "INSERT INTO {} ({}) SELECT {} FROM {}",
                quote_ident(&tmp_name),
                cols,
                cols,
                quote_ident(old_name)
            ),
            [],
        )?;
    }

    tx.execute_batch(&format!("DROP TABLE {}", quote_ident(old_name)))?;
    tx.execute_batch(&format!(
        "ALTER TABLE {} RENAME TO {}",
        quote_ident(&tmp_name),
        quote_ident(&new_table.name)
    ))?;

    for stmt in index_statements(new_table) {
        tx.execute_batch(&stmt)?;
    }

    Ok(())
}

fn create_table_sql(table: &Table) -> String {
    let mut parts: Vec<String> = table.all_columns().iter().map(column_ddl).collect();

    if !table.keys.primary.is_empty() {
        parts.push(format!(
            "PRIMARY KEY ({})",
            table
                .keys
                .primary
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", ")
        ));
    }

    for unique in &table.keys.unique {
        parts.push(format!(
            "UNIQUE ({})",
            unique.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ")
        ));
    }

    if !table.is_system {
        parts.push(format!("UNIQUE ({})", quote_ident(crate::schema::SYSTEM_ID)));
    }

    for reference in &table.references {
        let cascade = match reference.on_delete {
            CascadePolicy::Cascade => "CASCADE",
            CascadePolicy::Restrict => "RESTRICT",
        };
        parts.push(format!(
            "FOREIGN KEY ({}) REFERENCES {} ({}) ON DELETE {}",
            quote_ident(&reference.column),
            quote_ident(&reference.referenced_table),
            quote_ident(&reference.referenced_column),
            cascade
        ));
    }

    format!(
        "CREATE TABLE {} (\n  {}\n)",
        quote_ident(&table.name),
        parts.join(",\n  ")
    )
}

fn index_statements(table: &Table) -> Vec<String> {
    table
        .keys
        .indexed
        .iter()
        .enumerate()
        .map(|(i, cols)| {
            format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                quote_ident(&format!("idx_{}_{}", table.name, i)),
                quote_ident(&table.name),
                cols.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ")
            )
        })
        .collect()
}

fn column_ddl(col: &Column) -> String {
    let mut sql = format!("{} {}", quote_ident(&col.name), col.storage_type.sql_type_name());
    if !col.nullable {
        sql.push_str(" NOT NULL");
    }
    if let Some(DefaultValue::Static(v)) = &col.default {
        sql.push_str(&format!(" DEFAULT {}", sql_literal(v)));
    }
    sql
}

fn sql_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Real(r) => r.to_string(),
        Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
        Value::Blob(b) => format!("X'{}'", hex::encode(b)),
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Minimal hex encoding so we don't need an extra crate for SQLite BLOB
/// default literals (the only place a byte-to-hex conversion is needed).
mod hex {
    pub fn encode(bytes: &[u8]) -> String {
        let mut s = String::with_capacity(bytes.len() * 2);
        for b in bytes {
            s.push_str(&format!("{:02X}", b));
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::introspect::introspect;
    use crate::schema::{StorageType, SYSTEM_ID};

    fn products_schema() -> Schema {
        Schema::new().table(
            Table::new("products")
                .column(Column::new("name", StorageType::Text).lww().not_null())
                .column(Column::new("stock", StorageType::Integer)),
        )
    }

    #[test]
    fn creates_missing_table_with_system_and_lww_columns() {
        let conn = Connection::open_in_memory().unwrap();
        let mut conn = conn;
        let declared = products_schema();
        let live = introspect(&conn).unwrap();
        let steps = plan(&declared, &live).unwrap();
        assert_eq!(steps.len(), 1);
        apply(&mut conn, &steps).unwrap();

        let live_after = introspect(&conn).unwrap();
        let table = live_after.find_table("products").unwrap();
        assert!(table.find_column(SYSTEM_ID).is_some());
        assert!(table.find_column("name__hlc").is_some());
    }

    #[test]
    fn plan_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        let mut conn = conn;
        let declared = products_schema();

        let live = introspect(&conn).unwrap();
        let steps = plan(&declared, &live).unwrap();
        apply(&mut conn, &steps).unwrap();

        let live_after = introspect(&conn).unwrap();
        let second_plan = plan(&declared, &live_after).unwrap();
        assert!(second_plan.is_empty());
    }

    #[test]
    fn adding_column_preserves_existing_rows() {
        let conn = Connection::open_in_memory().unwrap();
        let mut conn = conn;
        let v1 = Schema::new().table(
            Table::new("users")
                .column(Column::new("id", StorageType::Integer))
                .column(Column::new("name", StorageType::Text)),
        );
        let live = introspect(&conn).unwrap();
        apply(&mut conn, &plan(&v1, &live).unwrap()).unwrap();
        conn.execute(
            "INSERT INTO users (id, name, system_id, system_created_at, system_version, system_is_local_origin) VALUES (1, 'Ada', 'sid-1', 't1', 't1', 1)",
            [],
        )
        .unwrap();

        let v2 = Schema::new().table(
            Table::new("users")
                .column(Column::new("id", StorageType::Integer))
                .column(Column::new("name", StorageType::Text))
                .column(Column::new("age", StorageType::Integer)),
        );
        let live2 = introspect(&conn).unwrap();
        apply(&mut conn, &plan(&v2, &live2).unwrap()).unwrap();

        let age: Option<i64> = conn
            .query_row("SELECT age FROM users WHERE id = 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(age, None);
        let name: String = conn
            .query_row("SELECT name FROM users WHERE id = 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(name, "Ada");
    }

    #[test]
    fn not_null_column_without_default_fails_the_plan() {
        let conn = Connection::open_in_memory().unwrap();
        let mut conn = conn;
        let v1 = Schema::new().table(Table::new("users").column(Column::new("id", StorageType::Integer)));
        let live = introspect(&conn).unwrap();
        apply(&mut conn, &plan(&v1, &live).unwrap()).unwrap();

        let v2 = Schema::new().table(
            Table::new("users")
                .column(Column::new("id", StorageType::Integer))
                .column(Column::new("age", StorageType::Integer).not_null()),
        );
        let live2 = introspect(&conn).unwrap();
        let result = plan(&v2, &live2);
        assert!(matches!(result, Err(Error::Schema { .. })));
    }

    #[test]
    fn dropping_a_column_uses_recreate_and_preserves_data() {
        let conn = Connection::open_in_memory().unwrap();
        let mut conn = conn;
        let v1 = Schema::new().table(
            Table::new("users")
                .column(Column::new("id", StorageType::Integer))
                .column(Column::new("name", StorageType::Text))
                .column(Column::new("legacy", StorageType::Text)),
        );
        let live = introspect(&conn).unwrap();
        apply(&mut conn, &plan(&v1, &live).unwrap()).unwrap();
        conn.execute(
            "INSERT INTO users (id, name, legacy, system_id, system_created_at, system_version, system_is_local_origin) VALUES (1, 'Ada', 'x', 'sid-1', 't1', 't1', 1)",
            [],
        )
        .unwrap();

        let v2 = Schema::new().table(
            Table::new("users")
                .column(Column::new("id", StorageType::Integer))
                .column(Column::new("name", StorageType::Text)),
        );
        let live2 = introspect(&conn).unwrap();
        let steps = plan(&v2, &live2).unwrap();
        assert!(matches!(steps[0], MigrationStep::RecreateTable { .. }));
        apply(&mut conn, &steps).unwrap();

        let live3 = introspect(&conn).unwrap();
        let table = live3.find_table("users").unwrap();
        assert!(table.find_column("legacy").is_none());
        let name: String = conn
            .query_row("SELECT name FROM users WHERE id = 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(name, "Ada");
    }

    #[test]
    fn reopening_a_database_never_plans_to_drop_its_own_internal_tables() {
        // A second `plan()` call (as happens on every reopen) sees the
        // journal/sync/fileset tables `Database::open` created after the
        // first plan ran. None of them are ever in a caller's declared
        // schema, so they must not be treated as dropped user tables.
        let conn = Connection::open_in_memory().unwrap();
        crate::journal::create_table(&conn).unwrap();
        crate::sync::create_table(&conn).unwrap();
        crate::fileset::create_registry_table(&conn).unwrap();

        let declared = Schema::new();
        let live = introspect(&conn).unwrap();
        let steps = plan(&declared, &live).unwrap();
        assert!(steps.is_empty(), "expected no steps, got {steps:?}");
    }
}
