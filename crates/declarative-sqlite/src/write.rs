//! Write path: insert/update/delete/bulkLoad (spec.md §4.4), run under a
//! single connection mutex so the value-prep -> HLC stamp -> engine call ->
//! journal append -> registry notify sequence is atomic per spec.md §5.
//!
//! Grounded on `ah-local-db/src/models.rs`'s `XxxStore::insert`/`update`
//! shape (typed params, `rusqlite::params!`) and on
//! `examples/other_examples/...-oplog.rs.rs`'s `log_insert_fullrow`/
//! `log_update`/`apply_remote_ops` (full-vs-partial journal entries,
//! idempotent remote-op application).

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use rusqlite::{params_from_iter, Connection};

use crate::error::{CreateErrorKind, DeleteErrorKind, Error, Result, UpdateErrorKind};
use crate::hlc::{Hlc, HlcClock};
use crate::journal::{Journal, JournalEntry};
use crate::query::{render, ColumnRef, Query, SelectItem, Where};
use crate::schema::{
    hlc_shadow_column_name, Schema, Table, SYSTEM_CREATED_AT, SYSTEM_ID, SYSTEM_IS_LOCAL_ORIGIN,
    SYSTEM_VERSION,
};
use crate::stream::{ExecutedRow, StreamRegistry, WriteNotification};
use crate::value::{RowValues, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintStrategy {
    ThrowException,
    Skip,
}

impl Default for ConstraintStrategy {
    fn default() -> Self {
        ConstraintStrategy::ThrowException
    }
}

/// Owns the one connection every read and write goes through, plus the
/// journal and the (lazily wired) stream registry. `Database` (`lib.rs`) is a
/// thin public facade over this.
pub struct Writer {
    conn: tokio::sync::Mutex<Connection>,
    schema: Schema,
    clock: Arc<HlcClock>,
    journal: Journal,
    registry: OnceLock<Arc<StreamRegistry>>,
}

impl Writer {
    pub fn new(conn: Connection, schema: Schema, clock: Arc<HlcClock>) -> Self {
        Writer {
            conn: tokio::sync::Mutex::new(conn),
            schema,
            clock,
            journal: Journal::new(),
            registry: OnceLock::new(),
        }
    }

    /// A minimal writer for unit tests that only need `clock()` (e.g.
    /// `record.rs`'s setter tests, which never issue I/O).
    pub fn for_testing() -> Self {
        Writer::new(
            Connection::open_in_memory().expect("in-memory sqlite connection"),
            Schema::new(),
            Arc::new(HlcClock::new("test-node")),
        )
    }

    /// Wires the write path to the stream registry once, after both are
    /// constructed by `Database::open` (the registry itself needs a handle
    /// back to the writer to execute queries, so neither can exist first).
    pub fn set_registry(&self, registry: Arc<StreamRegistry>) {
        let _ = self.registry.set(registry);
    }

    pub fn clock(&self) -> &HlcClock {
        &self.clock
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub(crate) async fn connection(&self) -> tokio::sync::MutexGuard<'_, Connection> {
        self.conn.lock().await
    }

    fn notify(&self, notification: WriteNotification) {
        if let Some(registry) = self.registry.get() {
            registry.notify(notification);
        }
    }

    fn find_table(&self, table_name: &str, kind: TableLookupKind) -> Result<&Table> {
        self.schema.find_table(table_name).ok_or_else(|| match kind {
            TableLookupKind::Create => Error::Create {
                table: table_name.to_owned(),
                column: None,
                kind: CreateErrorKind::InvalidData,
                source: None,
            },
            TableLookupKind::Update => Error::Update {
                table: table_name.to_owned(),
                column: None,
                kind: UpdateErrorKind::NotFound,
                source: None,
            },
            TableLookupKind::Delete => Error::Delete {
                table: table_name.to_owned(),
                kind: DeleteErrorKind::NotFound,
                source: None,
            },
        })
    }

    // ---- insert ----------------------------------------------------------

    /// Inserts a new row (spec.md §4.4 `insert`). Generates `system_id`,
    /// stamps `system_created_at`/`system_version`, marks local origin,
    /// resolves defaults for omitted columns, and stamps an `X__hlc` shadow
    /// for every LWW column present in the final row.
    pub async fn insert(&self, table_name: &str, values: RowValues) -> Result<String> {
        let table = self.find_table(table_name, TableLookupKind::Create)?;
        for key in values.keys() {
            if table.find_column(key).is_none() {
                return Err(Error::Create {
                    table: table_name.to_owned(),
                    column: Some(key.clone()),
                    kind: CreateErrorKind::InvalidData,
                    source: None,
                });
            }
        }

        let mut row = resolve_defaults(table, values)?;
        let system_id = uuid::Uuid::new_v4().to_string();
        let version = self.clock.now();

        row.insert(SYSTEM_ID.to_owned(), Value::Text(system_id.clone()));
        row.insert(SYSTEM_CREATED_AT.to_owned(), Value::Text(version.to_string()));
        row.insert(SYSTEM_VERSION.to_owned(), Value::Text(version.to_string()));
        row.insert(SYSTEM_IS_LOCAL_ORIGIN.to_owned(), Value::Integer(1));
        for lww in table.lww_columns() {
            row.insert(hlc_shadow_column_name(&lww.name), Value::Text(version.to_string()));
        }

        let conn = self.conn.lock().await;
        let tx = conn.unchecked_transaction()?;
        execute_insert(&tx, table_name, &row).map_err(|e| wrap_create_error(table_name, e))?;
        self.journal.add(
            &tx,
            JournalEntry {
                table_name: table_name.to_owned(),
                row_id: system_id.clone(),
                hlc: version,
                is_full_row: true,
                data: Some(row.clone()),
            },
        )?;
        tx.commit()?;
        drop(conn);

        tracing::debug!(table = table_name, row_id = %system_id, "inserted row");
        self.notify(
            WriteNotification::new(table_name)
                .columns(row.keys().cloned())
                .insert_or_delete(),
        );
        Ok(system_id)
    }

    // ---- update ------------------------------------------------------------

    /// Updates every row matching `where_clause` (spec.md §4.4 `update`).
    /// Returns the number of rows affected.
    pub async fn update(&self, table_name: &str, values: RowValues, where_clause: Option<Where>) -> Result<u64> {
        let (affected, _) = self.apply_update(table_name, values, where_clause).await?;
        Ok(affected)
    }

    /// Updates exactly the row identified by `system_id` (spec.md §4.7
    /// `Record::save`). Returns the row's new `system_version`.
    pub async fn update_by_system_id(&self, table_name: &str, system_id: &str, values: RowValues) -> Result<Hlc> {
        let (_, version) = self
            .apply_update(table_name, values, Some(Where::eq(SYSTEM_ID, system_id)))
            .await?;
        version.ok_or_else(|| Error::not_found(table_name))
    }

    async fn apply_update(
        &self,
        table_name: &str,
        values: RowValues,
        where_clause: Option<Where>,
    ) -> Result<(u64, Option<Hlc>)> {
        let table = self.find_table(table_name, TableLookupKind::Update)?;
        for key in values.keys() {
            if table.find_column(key).is_none() {
                return Err(Error::Update {
                    table: table_name.to_owned(),
                    column: Some(key.clone()),
                    kind: UpdateErrorKind::InvalidData,
                    source: None,
                });
            }
        }
        let non_lww_keys: Vec<String> = values
            .keys()
            .filter(|k| table.find_column(k).map(|c| !c.lww).unwrap_or(false))
            .cloned()
            .collect();

        let conn = self.conn.lock().await;
        let matches = select_system_ids(&conn, table_name, where_clause.clone())?;

        if !non_lww_keys.is_empty() {
            if let Some((_, is_local_origin)) = matches.iter().find(|(_, local)| !*local) {
                let _ = is_local_origin;
                return Err(Error::permission_denied(
                    table_name,
                    format!(
                        "non-LWW column(s) {:?} cannot be written on a remote-origin row",
                        non_lww_keys
                    ),
                ));
            }
        }

        let tx = conn.unchecked_transaction()?;
        let mut last_version = None;
        for (system_id, is_local_origin) in &matches {
            let version = self.clock.now();
            let mut write_values = RowValues::new();
            for (key, value) in &values {
                write_values.insert(key.clone(), value.clone());
                if table.find_column(key).map(|c| c.lww).unwrap_or(false) {
                    write_values.insert(hlc_shadow_column_name(key), Value::Text(version.to_string()));
                }
            }
            write_values.insert(SYSTEM_VERSION.to_owned(), Value::Text(version.to_string()));

            execute_update_by_id(&tx, table_name, system_id, &write_values)
                .map_err(|e| wrap_update_error(table_name, e))?;

            let entry_data = if *is_local_origin {
                read_full_row(&tx, table_name, system_id)?
            } else {
                let mut partial = RowValues::new();
                for (key, value) in &values {
                    if table.find_column(key).map(|c| c.lww).unwrap_or(false) {
                        partial.insert(key.clone(), value.clone());
                        partial.insert(hlc_shadow_column_name(key), Value::Text(version.to_string()));
                    }
                }
                partial.insert(SYSTEM_ID.to_owned(), Value::Text(system_id.clone()));
                Some(partial)
            };

            self.journal.add(
                &tx,
                JournalEntry {
                    table_name: table_name.to_owned(),
                    row_id: system_id.clone(),
                    hlc: version.clone(),
                    is_full_row: *is_local_origin,
                    data: entry_data,
                },
            )?;
            last_version = Some(version);
        }
        tx.commit()?;
        let affected = matches.len() as u64;
        drop(conn);

        if affected > 0 {
            tracing::debug!(table = table_name, rows_affected = affected, "updated rows");
            self.notify(WriteNotification::new(table_name).columns(values.keys().cloned()));
        }
        Ok((affected, last_version))
    }

    // ---- delete --------------------------------------------------------

    /// Deletes every row matching `where_clause` (spec.md §4.4 `delete`).
    pub async fn delete(&self, table_name: &str, where_clause: Option<Where>) -> Result<u64> {
        self.find_table(table_name, TableLookupKind::Delete)?;

        let conn = self.conn.lock().await;
        let matches = select_system_ids(&conn, table_name, where_clause)?;

        let tx = conn.unchecked_transaction()?;
        for (system_id, _) in &matches {
            tx.execute(
                &format!("DELETE FROM {} WHERE {} = ?1", quote_ident(table_name), quote_ident(SYSTEM_ID)),
                [system_id.as_str()],
            )?;
            self.journal.add(
                &tx,
                JournalEntry {
                    table_name: table_name.to_owned(),
                    row_id: system_id.clone(),
                    hlc: self.clock.now(),
                    is_full_row: true,
                    data: None,
                },
            )?;
        }
        tx.commit()?;
        let affected = matches.len() as u64;
        drop(conn);

        if affected > 0 {
            tracing::debug!(table = table_name, rows_affected = affected, "deleted rows");
            self.notify(WriteNotification::new(table_name).insert_or_delete());
        }
        Ok(affected)
    }

    pub async fn delete_by_system_id(&self, table_name: &str, system_id: &str) -> Result<()> {
        let affected = self.delete(table_name, Some(Where::eq(SYSTEM_ID, system_id))).await?;
        if affected == 0 {
            return Err(Error::not_found(table_name));
        }
        Ok(())
    }

    // ---- bulk load -------------------------------------------------------

    /// Materializes rows arriving from remote sync (spec.md §4.4 `bulkLoad`).
    /// Never touches the dirty journal and never flips local origin on an
    /// existing row.
    pub async fn bulk_load(
        &self,
        table_name: &str,
        rows: Vec<RowValues>,
        strategy: ConstraintStrategy,
    ) -> Result<()> {
        let table = self.find_table(table_name, TableLookupKind::Create)?;
        let conn = self.conn.lock().await;
        let tx = conn.unchecked_transaction()?;

        let mut touched: HashSet<String> = HashSet::new();
        let mut any_insert = false;

        for row in rows {
            let Some(system_id) = row.get(SYSTEM_ID).and_then(Value::as_text).map(str::to_owned) else {
                return Err(Error::Create {
                    table: table_name.to_owned(),
                    column: Some(SYSTEM_ID.to_owned()),
                    kind: CreateErrorKind::InvalidData,
                    source: None,
                });
            };

            for (key, value) in &row {
                if (key == SYSTEM_CREATED_AT || key == SYSTEM_VERSION || key.ends_with("__hlc")) && !key.is_empty()
                {
                    if let Some(text) = value.as_text() {
                        if let Ok(hlc) = text.parse::<Hlc>() {
                            self.clock.observe(&hlc);
                        }
                    }
                }
            }

            let existing = find_by_system_id(&tx, table_name, &system_id)?;
            match existing {
                None => {
                    let insert_result = bulk_insert_new_row(&tx, table, &row, &system_id, &self.clock.now());
                    match insert_result {
                        Ok(written_columns) => {
                            any_insert = true;
                            touched.extend(written_columns);
                        }
                        Err(e) if is_constraint_violation(&e) && strategy == ConstraintStrategy::Skip => {
                            tracing::warn!(table = table_name, row_id = %system_id, "skipping row on constraint violation");
                            continue;
                        }
                        Err(e) => return Err(wrap_create_error(table_name, e)),
                    }
                }
                Some(existing_row) => {
                    let written_columns = bulk_merge_existing_row(&tx, table, &row, &existing_row, &system_id)
                        .map_err(|e| wrap_update_error(table_name, e))?;
                    touched.extend(written_columns);
                }
            }
        }

        tx.commit()?;
        drop(conn);

        if !touched.is_empty() || any_insert {
            tracing::debug!(table = table_name, "bulk-loaded rows");
            let mut notification = WriteNotification::new(table_name).columns(touched);
            if any_insert {
                notification = notification.insert_or_delete();
            }
            self.notify(notification);
        }
        Ok(())
    }

    // ---- reads ------------------------------------------------------------

    pub async fn read_by_system_id(&self, table_name: &str, system_id: &str) -> Result<RowValues> {
        let conn = self.conn.lock().await;
        find_by_system_id(&conn, table_name, system_id)?.ok_or_else(|| Error::not_found(table_name))
    }

    /// Raw `queryMaps` execution: renders `query` and runs it unmodified,
    /// with no system-column augmentation (spec.md §6 `queryMaps`).
    pub async fn query_maps(&self, query: &Query) -> Result<Vec<RowValues>> {
        self.execute_maps_inner(query).await
    }

    /// Runs `query` augmented with the identity columns a [`Record`] needs
    /// (`system_id`, `system_created_at`, `system_version`,
    /// `system_is_local_origin`), qualified to `table_ref` when given
    /// (the `forUpdate` target) or the query's own `FROM` source otherwise.
    pub(crate) async fn execute_maps_for_record(
        &self,
        query: &Query,
        table_ref: Option<&str>,
    ) -> Result<Vec<RowValues>> {
        let augmented = augment_columns(
            query,
            table_ref,
            &[SYSTEM_ID, SYSTEM_CREATED_AT, SYSTEM_VERSION, SYSTEM_IS_LOCAL_ORIGIN],
        );
        self.execute_maps_inner(&augmented).await
    }

    /// Runs `query` augmented with just `system_id`/`system_version`, for
    /// the reactive stream registry's row cache (spec.md §4.6).
    pub(crate) async fn execute_rows(&self, query: &Query) -> Result<Vec<ExecutedRow>> {
        let augmented = augment_columns(query, None, &[SYSTEM_ID, SYSTEM_VERSION]);
        let maps = self.execute_maps_inner(&augmented).await?;
        let mut out = Vec::with_capacity(maps.len());
        for mut row in maps {
            let system_id = row
                .remove(SYSTEM_ID)
                .and_then(|v| v.as_text().map(str::to_owned))
                .ok_or_else(|| Error::schema("stream query result missing system_id"))?;
            let system_version = row
                .remove(SYSTEM_VERSION)
                .and_then(|v| v.as_text().map(str::to_owned))
                .and_then(|s| s.parse::<Hlc>().ok())
                .ok_or_else(|| Error::schema("stream query result missing system_version"))?;
            out.push(ExecutedRow {
                system_id,
                system_version,
                values: row,
            });
        }
        Ok(out)
    }

    async fn execute_maps_inner(&self, query: &Query) -> Result<Vec<RowValues>> {
        let (sql, params) = render::render(query);
        let conn = self.conn.lock().await;
        run_select(&conn, &sql, &params)
    }

    pub async fn raw_query(&self, sql: &str, params: &[Value]) -> Result<Vec<RowValues>> {
        let conn = self.conn.lock().await;
        run_select(&conn, sql, params)
    }

    pub async fn raw_update(&self, sql: &str, params: &[Value]) -> Result<usize> {
        let conn = self.conn.lock().await;
        Ok(conn.execute(sql, params_from_iter(params.iter()))?)
    }

    pub async fn raw_delete(&self, sql: &str, params: &[Value]) -> Result<usize> {
        let conn = self.conn.lock().await;
        Ok(conn.execute(sql, params_from_iter(params.iter()))?)
    }

    pub async fn raw_insert(&self, sql: &str, params: &[Value]) -> Result<i64> {
        let conn = self.conn.lock().await;
        conn.execute(sql, params_from_iter(params.iter()))?;
        Ok(conn.last_insert_rowid())
    }
}

enum TableLookupKind {
    Create,
    Update,
    Delete,
}

fn resolve_defaults(table: &Table, mut values: RowValues) -> Result<RowValues> {
    for column in &table.columns {
        if values.contains_key(&column.name) {
            continue;
        }
        match &column.default {
            Some(default) => {
                values.insert(column.name.clone(), default.resolve());
            }
            None if column.nullable => {
                values.insert(column.name.clone(), Value::Null);
            }
            None => {
                return Err(Error::Create {
                    table: table.name.clone(),
                    column: Some(column.name.clone()),
                    kind: CreateErrorKind::InvalidData,
                    source: None,
                });
            }
        }
    }
    Ok(values)
}

fn execute_insert(conn: &Connection, table_name: &str, row: &RowValues) -> rusqlite::Result<()> {
    let columns: Vec<&String> = row.keys().collect();
    let placeholders = (1..=columns.len()).map(|i| format!("?{i}")).collect::<Vec<_>>().join(", ");
    let column_list = columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ");
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(table_name),
        column_list,
        placeholders
    );
    let values: Vec<&Value> = columns.iter().map(|c| &row[*c]).collect();
    conn.execute(&sql, params_from_iter(values))?;
    Ok(())
}

fn execute_update_by_id(
    conn: &Connection,
    table_name: &str,
    system_id: &str,
    values: &RowValues,
) -> rusqlite::Result<()> {
    let assignments = values.keys().map(|c| format!("{} = ?", quote_ident(c))).collect::<Vec<_>>().join(", ");
    let sql = format!(
        "UPDATE {} SET {} WHERE {} = ?",
        quote_ident(table_name),
        assignments,
        quote_ident(SYSTEM_ID)
    );
    let mut params: Vec<&Value> = values.values().collect();
    let id_value = Value::Text(system_id.to_owned());
    params.push(&id_value);
    conn.execute(&sql, params_from_iter(params))?;
    Ok(())
}

fn select_system_ids(
    conn: &Connection,
    table_name: &str,
    where_clause: Option<Where>,
) -> Result<Vec<(String, bool)>> {
    let mut query = Query::from_table(table_name)
        .select_column(SYSTEM_ID)
        .select_column(SYSTEM_IS_LOCAL_ORIGIN);
    if let Some(w) = where_clause {
        query = query.where_clause(w);
    }
    let (sql, params) = render::render(&query);
    let rows = run_select(conn, &sql, &params)?;
    Ok(rows
        .into_iter()
        .filter_map(|row| {
            let id = row.get(SYSTEM_ID)?.as_text()?.to_owned();
            let local = matches!(row.get(SYSTEM_IS_LOCAL_ORIGIN), Some(Value::Integer(1)));
            Some((id, local))
        })
        .collect())
}

fn read_full_row(conn: &Connection, table_name: &str, system_id: &str) -> Result<Option<RowValues>> {
    find_by_system_id(conn, table_name, system_id)
}

fn find_by_system_id(conn: &Connection, table_name: &str, system_id: &str) -> Result<Option<RowValues>> {
    let query = Query::from_table(table_name).select_all().where_clause(Where::eq(SYSTEM_ID, system_id));
    let (sql, params) = render::render(&query);
    let mut rows = run_select(conn, &sql, &params)?;
    Ok(if rows.is_empty() { None } else { Some(rows.remove(0)) })
}

fn run_select(conn: &Connection, sql: &str, params: &[Value]) -> Result<Vec<RowValues>> {
    let mut stmt = conn.prepare(sql)?;
    let column_names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
    let rows = stmt.query_map(params_from_iter(params.iter()), |row| {
        let mut map = RowValues::new();
        for (i, name) in column_names.iter().enumerate() {
            let value: Value = row.get(i)?;
            map.insert(name.clone(), value);
        }
        Ok(map)
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Appends `names` (qualified to `table_ref`, or the query's `FROM` source
/// when `table_ref` is `None`) to `query`'s select list, skipping any that
/// are already selected or covered by a wildcard.
fn augment_columns(query: &Query, table_ref: Option<&str>, names: &[&str]) -> Query {
    let mut q = query.clone();
    if q.uses_wildcard() {
        return q;
    }
    let qualifier = table_ref.map(str::to_owned).or_else(|| q.from.as_ref().map(|f| f.effective_alias().to_owned()));
    for name in names {
        let already_selected = q.select.iter().any(|item| matches!(item, SelectItem::Column(c) if c.name() == *name));
        if already_selected {
            continue;
        }
        let column_ref = match &qualifier {
            Some(alias) => ColumnRef::Qualified(alias.clone(), (*name).to_owned()),
            None => ColumnRef::Unqualified((*name).to_owned()),
        };
        q = q.select(SelectItem::Column(column_ref));
    }
    q
}

/// Inserts a row arriving fresh from remote sync: supplied columns are
/// honored as-is, missing user columns fall back to their declared default,
/// `system_is_local_origin` is forced to 0, and any LWW column with no
/// supplied `X__hlc` is stamped with the row's `system_version` (spec.md
/// §4.4 `bulkLoad`, absent-row branch). Returns the set of columns written.
fn bulk_insert_new_row(
    conn: &Connection,
    table: &Table,
    row: &RowValues,
    system_id: &str,
    fallback_hlc: &Hlc,
) -> rusqlite::Result<HashSet<String>> {
    let mut values = row.clone();
    values.insert(SYSTEM_ID.to_owned(), Value::Text(system_id.to_owned()));
    values.insert(SYSTEM_IS_LOCAL_ORIGIN.to_owned(), Value::Integer(0));

    let version = values
        .get(SYSTEM_VERSION)
        .and_then(Value::as_text)
        .map(str::to_owned)
        .unwrap_or_else(|| {
            // A remote row with no supplied version is still a valid insert
            // target; every later read parses `system_version` as an `Hlc`,
            // so the fallback must be a well-formed one, not a bare millis
            // string.
            fallback_hlc.to_string()
        });
    values
        .entry(SYSTEM_CREATED_AT.to_owned())
        .or_insert_with(|| Value::Text(version.clone()));
    values
        .entry(SYSTEM_VERSION.to_owned())
        .or_insert_with(|| Value::Text(version.clone()));

    for column in &table.columns {
        if !values.contains_key(&column.name) {
            if let Some(default) = &column.default {
                values.insert(column.name.clone(), default.resolve());
            } else if column.nullable {
                values.insert(column.name.clone(), Value::Null);
            }
        }
    }
    for lww in table.lww_columns() {
        let shadow = hlc_shadow_column_name(&lww.name);
        if !values.contains_key(&shadow) {
            values.insert(shadow, Value::Text(version.clone()));
        }
    }

    execute_insert(conn, &table.name, &values)?;
    Ok(values.into_keys().collect())
}

/// Merges a row arriving from remote sync into an already-present row
/// (spec.md §4.4 `bulkLoad`, present-row branch): LWW columns are accepted
/// only on a strictly-greater supplied HLC; non-LWW columns overwrite
/// unconditionally; `system_version` advances to the max of supplied and
/// stored. Returns the set of columns actually written.
fn bulk_merge_existing_row(
    conn: &Connection,
    table: &Table,
    row: &RowValues,
    existing: &RowValues,
    system_id: &str,
) -> rusqlite::Result<HashSet<String>> {
    let stored_version = existing
        .get(SYSTEM_VERSION)
        .and_then(Value::as_text)
        .and_then(|s| s.parse::<Hlc>().ok());
    let supplied_version = row.get(SYSTEM_VERSION).and_then(Value::as_text).and_then(|s| s.parse::<Hlc>().ok());
    let new_version = match (&stored_version, &supplied_version) {
        (Some(stored), Some(supplied)) if supplied > stored => supplied.clone(),
        (Some(stored), _) => stored.clone(),
        (None, Some(supplied)) => supplied.clone(),
        (None, None) => Hlc::zero("unknown"),
    };

    let mut write_values = RowValues::new();
    for column in &table.columns {
        let Some(incoming) = row.get(&column.name) else { continue };
        if column.lww {
            let shadow = hlc_shadow_column_name(&column.name);
            let Some(supplied_hlc) = row.get(&shadow).and_then(Value::as_text).and_then(|s| s.parse::<Hlc>().ok())
            else {
                // Missing HLC on a column targeting an existing row can never
                // be proven strictly greater than the stored shadow, so the
                // incoming value is dropped (spec.md §9 open question).
                continue;
            };
            let stored_hlc = existing.get(&shadow).and_then(Value::as_text).and_then(|s| s.parse::<Hlc>().ok());
            let accept = match &stored_hlc {
                Some(stored) => supplied_hlc > *stored,
                None => true,
            };
            if accept {
                write_values.insert(column.name.clone(), incoming.clone());
                write_values.insert(shadow, Value::Text(supplied_hlc.to_string()));
            }
        } else {
            write_values.insert(column.name.clone(), incoming.clone());
        }
    }
    write_values.insert(SYSTEM_VERSION.to_owned(), Value::Text(new_version.to_string()));

    if write_values.len() > 1 {
        execute_update_by_id(conn, &table.name, system_id, &write_values)?;
    }
    Ok(write_values.into_keys().collect())
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn wrap_create_error(table_name: &str, err: rusqlite::Error) -> Error {
    let kind = if is_constraint_violation(&err) {
        CreateErrorKind::ConstraintViolation
    } else {
        CreateErrorKind::Unknown
    };
    Error::Create {
        table: table_name.to_owned(),
        column: None,
        kind,
        source: Some(err),
    }
}

fn wrap_update_error(table_name: &str, err: rusqlite::Error) -> Error {
    let kind = if is_constraint_violation(&err) {
        UpdateErrorKind::ConstraintViolation
    } else {
        UpdateErrorKind::InvalidData
    };
    Error::Update {
        table: table_name.to_owned(),
        column: None,
        kind,
        source: Some(err),
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::{apply, plan};
    use crate::introspect::introspect;
    use crate::schema::{Column, StorageType};

    fn products_schema() -> Schema {
        Schema::new().table(
            Table::new("products")
                .column(Column::new("name", StorageType::Text).lww().not_null())
                .column(Column::new("stock", StorageType::Integer).default_value(0i64)),
        )
    }

    fn writer_with_schema(schema: Schema) -> Writer {
        let mut conn = Connection::open_in_memory().unwrap();
        let live = introspect(&conn).unwrap();
        let steps = plan(&schema, &live).unwrap();
        apply(&mut conn, &steps).unwrap();
        Writer::new(conn, schema, Arc::new(HlcClock::new("node-a")))
    }

    fn row(pairs: &[(&str, Value)]) -> RowValues {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[tokio::test]
    async fn insert_stamps_system_columns_and_resolves_defaults() {
        let writer = writer_with_schema(products_schema());
        let id = writer.insert("products", row(&[("name", Value::Text("Widget".into()))])).await.unwrap();

        let stored = writer.read_by_system_id("products", &id).await.unwrap();
        assert_eq!(stored.get("stock"), Some(&Value::Integer(0)));
        assert_eq!(stored.get(SYSTEM_CREATED_AT), stored.get(SYSTEM_VERSION));
        assert!(stored.get("name__hlc").is_some());
        assert_eq!(stored.get(SYSTEM_IS_LOCAL_ORIGIN), Some(&Value::Integer(1)));
    }

    #[tokio::test]
    async fn insert_without_required_column_fails() {
        let writer = writer_with_schema(products_schema());
        let err = writer.insert("products", RowValues::new()).await.unwrap_err();
        assert!(matches!(err, Error::Create { .. }));
    }

    #[tokio::test]
    async fn update_on_remote_origin_row_rejects_non_lww_column() {
        let writer = writer_with_schema(products_schema());
        writer
            .bulk_load(
                "products",
                vec![row(&[
                    (SYSTEM_ID, Value::Text("r1".into())),
                    ("name", Value::Text("Server".into())),
                    ("stock", Value::Integer(5)),
                ])],
                ConstraintStrategy::ThrowException,
            )
            .await
            .unwrap();

        let err = writer
            .update(
                "products",
                row(&[("stock", Value::Integer(9))]),
                Some(Where::eq(SYSTEM_ID, "r1")),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PermissionDenied { .. }));

        // The LWW column is still writable on the same remote-origin row.
        writer
            .update("products", row(&[("name", Value::Text("Edited".into()))]), Some(Where::eq(SYSTEM_ID, "r1")))
            .await
            .unwrap();
        let stored = writer.read_by_system_id("products", "r1").await.unwrap();
        assert_eq!(stored.get("name"), Some(&Value::Text("Edited".into())));
    }

    #[tokio::test]
    async fn bulk_load_lww_stale_write_is_dropped() {
        // spec.md §8 scenario 1.
        let writer = writer_with_schema(products_schema());
        let id = writer
            .insert("products", row(&[("name", Value::Text("Original".into())), ("stock", Value::Integer(10))]))
            .await
            .unwrap();
        writer
            .update("products", row(&[("name", Value::Text("First".into()))]), Some(Where::eq(SYSTEM_ID, &id)))
            .await
            .unwrap();
        let after_first_update = writer.read_by_system_id("products", &id).await.unwrap();
        let name_hlc_after_first: String = after_first_update.get("name__hlc").unwrap().as_text().unwrap().to_owned();

        writer
            .bulk_load(
                "products",
                vec![row(&[
                    (SYSTEM_ID, Value::Text(id.clone())),
                    ("name", Value::Text("Stale".into())),
                    ("name__hlc", Value::Text(Hlc::zero("other-node").to_string())),
                    ("stock", Value::Integer(30)),
                ])],
                ConstraintStrategy::ThrowException,
            )
            .await
            .unwrap();

        let final_row = writer.read_by_system_id("products", &id).await.unwrap();
        assert_eq!(final_row.get("name"), Some(&Value::Text("First".into())));
        assert_eq!(final_row.get("name__hlc").unwrap().as_text().unwrap(), name_hlc_after_first);
        assert_eq!(final_row.get("stock"), Some(&Value::Integer(30)));
    }

    #[tokio::test]
    async fn bulk_load_never_appends_to_the_journal() {
        let writer = writer_with_schema(products_schema());
        writer
            .bulk_load(
                "products",
                vec![row(&[(SYSTEM_ID, Value::Text("r1".into())), ("name", Value::Text("Server".into()))])],
                ConstraintStrategy::ThrowException,
            )
            .await
            .unwrap();
        let conn = writer.connection().await;
        assert!(writer.journal().get_all(&conn).unwrap().is_empty());
    }

    #[tokio::test]
    async fn dirty_journal_collapses_repeated_updates_on_one_row() {
        // spec.md §8 scenario 5.
        let writer = writer_with_schema(products_schema());
        let id = writer.insert("products", row(&[("name", Value::Text("A".into()))])).await.unwrap();
        writer
            .update("products", row(&[("stock", Value::Integer(1))]), Some(Where::eq(SYSTEM_ID, &id)))
            .await
            .unwrap();
        writer
            .update("products", row(&[("stock", Value::Integer(2))]), Some(Where::eq(SYSTEM_ID, &id)))
            .await
            .unwrap();

        let conn = writer.connection().await;
        let all = writer.journal().get_all(&conn).unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].is_full_row);
        assert_eq!(all[0].data.as_ref().unwrap().get("stock"), Some(&Value::Integer(2)));
    }

    #[tokio::test]
    async fn delete_then_read_fails_not_found() {
        let writer = writer_with_schema(products_schema());
        let id = writer.insert("products", row(&[("name", Value::Text("A".into()))])).await.unwrap();
        writer.delete_by_system_id("products", &id).await.unwrap();
        let err = writer.read_by_system_id("products", &id).await.unwrap_err();
        assert!(matches!(err, Error::Read { .. }));
    }
}
