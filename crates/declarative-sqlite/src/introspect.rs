//! Reads the live schema out of SQLite's own catalog (spec.md §4.2 "Inputs:
//! declared schema + live schema (introspected)").

use crate::error::Result;
use rusqlite::Connection;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveColumn {
    pub name: String,
    pub decl_type: String,
    pub not_null: bool,
    pub primary_key: bool,
    pub default_value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveForeignKey {
    pub from_column: String,
    pub to_table: String,
    pub to_column: String,
    pub on_delete: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveTable {
    pub name: String,
    pub columns: Vec<LiveColumn>,
    pub foreign_keys: Vec<LiveForeignKey>,
}

impl LiveTable {
    pub fn find_column(&self, name: &str) -> Option<&LiveColumn> {
        self.columns.iter().find(|c| c.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveView {
    pub name: String,
    pub sql: String,
}

#[derive(Debug, Clone, Default)]
pub struct LiveSchema {
    pub tables: Vec<LiveTable>,
    pub views: Vec<LiveView>,
}

impl LiveSchema {
    pub fn find_table(&self, name: &str) -> Option<&LiveTable> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn find_view(&self, name: &str) -> Option<&LiveView> {
        self.views.iter().find(|v| v.name == name)
    }
}

/// Reads every user table/view currently in the database (excluding
/// SQLite's own `sqlite_*` catalog tables).
pub fn introspect(conn: &Connection) -> Result<LiveSchema> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )?;
    let table_names: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<_>>()?;
    drop(stmt);

    let mut tables = Vec::with_capacity(table_names.len());
    for name in table_names {
        tables.push(introspect_table(conn, &name)?);
    }

    let mut stmt = conn.prepare("SELECT name, sql FROM sqlite_master WHERE type = 'view' ORDER BY name")?;
    let views = stmt
        .query_map([], |row| {
            Ok(LiveView {
                name: row.get(0)?,
                sql: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(LiveSchema { tables, views })
}

fn introspect_table(conn: &Connection, name: &str) -> Result<LiveTable> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(name)))?;
    let columns = stmt
        .query_map([], |row| {
            Ok(LiveColumn {
                name: row.get::<_, String>(1)?,
                decl_type: row.get::<_, String>(2)?,
                not_null: row.get::<_, i64>(3)? != 0,
                default_value: row.get::<_, Option<String>>(4)?,
                primary_key: row.get::<_, i64>(5)? != 0,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    drop(stmt);

    let mut stmt = conn.prepare(&format!("PRAGMA foreign_key_list({})", quote_ident(name)))?;
    let foreign_keys = stmt
        .query_map([], |row| {
            Ok(LiveForeignKey {
                from_column: row.get::<_, String>(3)?,
                to_table: row.get::<_, String>(2)?,
                to_column: row.get::<_, String>(4)?,
                on_delete: row.get::<_, String>(6)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(LiveTable {
        name: name.to_owned(),
        columns,
        foreign_keys,
    })
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn introspects_columns_and_views() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
             CREATE VIEW v AS SELECT id FROM t;",
        )
        .unwrap();

        let live = introspect(&conn).unwrap();
        let table = live.find_table("t").unwrap();
        assert_eq!(table.columns.len(), 2);
        assert!(table.find_column("id").unwrap().primary_key);
        assert!(table.find_column("name").unwrap().not_null);
        assert!(live.find_view("v").is_some());
    }
}
