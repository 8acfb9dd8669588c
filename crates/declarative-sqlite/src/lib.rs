//! Declarative, embedded, offline-first relational data library over
//! SQLite: a caller describes tables/columns/keys/indexes/views/fileset
//! columns, and [`Database`] reconciles the live database to that shape,
//! mediates every read and write, tracks mutations for later sync with a
//! remote server, resolves concurrent writes on designated columns with a
//! last-writer-wins rule, and serves query results as reactive streams.
//!
//! Grounded on `ah-core/src/lib.rs`'s module list/re-export style and
//! `ah-local-db/src/connection.rs`'s `Database` wrapping a guarded
//! `Connection`.

pub mod error;
pub mod fileset;
pub mod hlc;
pub mod introspect;
pub mod journal;
pub mod migrate;
pub mod query;
pub mod record;
pub mod schema;
pub mod stream;
pub mod sync;
pub mod value;
pub mod write;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::Connection;

pub use error::{Error, Result};
pub use fileset::{FileMeta, FileRepository, FilesetField, GcReport, MemoryFileRepository, DiskFileRepository};
pub use hlc::Hlc;
pub use journal::JournalEntry;
pub use query::{ColumnRef, Query, SelectItem, Where};
pub use record::{Record, RecordKind};
pub use schema::Schema;
pub use stream::{ExecutedRow, QueryStream};
pub use sync::{FetchReport, FetchedTable, SendOutcome, SyncManager, SyncTransport, UploadReport};
pub use value::{RowValues, Value};
pub use write::ConstraintStrategy;

use stream::{QueryExecutor, StreamRegistry, WriteNotification};
use write::Writer;

/// Caller-configurable knobs `spec.md` §9 calls out as needing to be
/// settable at `open()` time (SPEC_FULL.md §4.10).
#[derive(Debug, Clone)]
pub struct OpenOptions {
    /// Overrides the node id used by the process-wide HLC clock the first
    /// time it is created. Has no effect if the clock already exists (see
    /// `hlc::global_with_node_id`).
    pub node_id: Option<String>,
    /// Debounce window before a stream re-executes after an impacting
    /// write; coalesces bursts into one re-execution.
    pub debounce: Duration,
    /// Default constraint-violation strategy for `bulkLoad` calls that
    /// don't specify their own.
    pub bulk_load_strategy: ConstraintStrategy,
}

impl Default for OpenOptions {
    fn default() -> Self {
        OpenOptions {
            node_id: None,
            debounce: Duration::from_millis(25),
            bulk_load_strategy: ConstraintStrategy::default(),
        }
    }
}

/// Delegates `QueryExecutor` to the writer so the stream registry can
/// re-execute queries without owning connection/transaction concerns
/// itself (the registry and the writer are constructed in sequence during
/// `Database::open`, which is why this indirection exists at all).
struct WriterExecutor(Arc<Writer>);

#[async_trait::async_trait]
impl QueryExecutor for WriterExecutor {
    async fn execute_rows(&self, query: &Query) -> Result<Vec<ExecutedRow>> {
        self.0.execute_rows(query).await
    }
}

/// Top-level handle: owns the connection (via [`Writer`]), the reactive
/// stream registry, and the file repository backing fileset columns.
pub struct Database {
    writer: Arc<Writer>,
    registry: Arc<StreamRegistry>,
    file_repository: Arc<dyn FileRepository>,
    options: OpenOptions,
}

impl Database {
    /// Opens (creating if absent) the SQLite file at `path`, reconciles it
    /// to `schema`, and wires up the write path and stream registry
    /// (spec.md §6 `open`).
    pub async fn open(
        path: impl AsRef<Path>,
        schema: Schema,
        file_repository: Arc<dyn FileRepository>,
        options: OpenOptions,
    ) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn, schema, file_repository, options).await
    }

    /// An ephemeral, in-memory database, for tests and scratch use.
    pub async fn open_in_memory(
        schema: Schema,
        file_repository: Arc<dyn FileRepository>,
        options: OpenOptions,
    ) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, schema, file_repository, options).await
    }

    async fn from_connection(
        mut conn: Connection,
        schema: Schema,
        file_repository: Arc<dyn FileRepository>,
        options: OpenOptions,
    ) -> Result<Self> {
        let live = introspect::introspect(&conn)?;
        let steps = migrate::plan(&schema, &live)?;
        migrate::apply(&mut conn, &steps)?;

        journal::create_table(&conn)?;
        sync::create_table(&conn)?;
        fileset::create_registry_table(&conn)?;

        let clock = match &options.node_id {
            Some(node_id) => hlc::global_with_node_id(node_id.clone()),
            None => hlc::global(),
        };

        let writer = Arc::new(Writer::new(conn, schema, clock));
        let registry = Arc::new(StreamRegistry::new(
            Arc::new(WriterExecutor(writer.clone())),
            options.debounce,
        ));
        writer.set_registry(registry.clone());

        tracing::info!("database opened");
        Ok(Database {
            writer,
            registry,
            file_repository,
            options,
        })
    }

    /// Drops every live stream, completing each subscriber's stream (spec.md
    /// §6 `close`).
    pub fn close(&self) {
        tracing::info!("database closing");
        self.registry.close_all();
    }

    // ---- CRUD -------------------------------------------------------------

    pub async fn insert(&self, table: &str, values: RowValues) -> Result<String> {
        self.writer.insert(table, values).await
    }

    pub async fn update(&self, table: &str, values: RowValues, where_clause: Option<Where>) -> Result<u64> {
        self.writer.update(table, values, where_clause).await
    }

    pub async fn delete(&self, table: &str, where_clause: Option<Where>) -> Result<u64> {
        self.writer.delete(table, where_clause).await
    }

    /// Loads rows from remote sync (spec.md §4.4 `bulkLoad`). Uses
    /// `strategy` for this call rather than the database-wide default in
    /// [`OpenOptions`].
    pub async fn bulk_load(&self, table: &str, rows: Vec<RowValues>, strategy: ConstraintStrategy) -> Result<()> {
        self.writer.bulk_load(table, rows, strategy).await
    }

    /// `bulkLoad` using the database-wide default constraint strategy.
    pub async fn bulk_load_default(&self, table: &str, rows: Vec<RowValues>) -> Result<()> {
        self.writer.bulk_load(table, rows, self.options.bulk_load_strategy).await
    }

    // ---- reads --------------------------------------------------------------

    /// Runs `build()`'s query and wraps each row in a [`Record`] (spec.md
    /// §6 `query`, §4.7 "a record is CRUD-enabled iff its source is a
    /// table, or the query was declared forUpdate(targetTable)").
    pub async fn query(&self, build: impl FnOnce() -> Query) -> Result<Vec<Record>> {
        let query = build();
        let kind = record_kind_for(&query);
        let table_ref = match &kind {
            RecordKind::ForUpdate(target) => Some(target.as_str()),
            _ => None,
        };
        let rows = self.writer.execute_maps_for_record(&query, table_ref).await?;
        Ok(rows
            .into_iter()
            .map(|row| Record::new(kind.clone(), row, self.writer.clone()))
            .collect())
    }

    /// Runs `build()`'s query with no augmentation or `Record` wrapping
    /// (spec.md §6 `queryMaps`).
    pub async fn query_maps(&self, build: impl FnOnce() -> Query) -> Result<Vec<RowValues>> {
        self.writer.query_maps(&build()).await
    }

    /// Registers a reactive query stream (spec.md §4.6, §6 `stream`).
    /// `mapper` converts each re-executed row into the caller's type `T`;
    /// the row cache reuses `Arc<T>` identity across re-executions when a
    /// row's `system_version` hasn't changed.
    pub async fn stream<T>(
        &self,
        build: impl FnOnce() -> Query,
        mapper: impl Fn(&ExecutedRow) -> T + Send + Sync + 'static,
    ) -> QueryStream<T>
    where
        T: Send + Sync + 'static,
    {
        self.registry.register(build(), self.writer.schema(), Arc::new(mapper)).await
    }

    pub async fn raw_query(&self, sql: &str, params: &[Value]) -> Result<Vec<RowValues>> {
        self.writer.raw_query(sql, params).await
    }

    pub async fn raw_update(&self, sql: &str, params: &[Value]) -> Result<usize> {
        self.writer.raw_update(sql, params).await
    }

    pub async fn raw_delete(&self, sql: &str, params: &[Value]) -> Result<usize> {
        self.writer.raw_delete(sql, params).await
    }

    pub async fn raw_insert(&self, sql: &str, params: &[Value]) -> Result<i64> {
        self.writer.raw_insert(sql, params).await
    }

    // ---- dirty journal ------------------------------------------------------

    pub async fn get_dirty_rows(&self) -> Result<Vec<JournalEntry>> {
        let conn = self.writer.connection().await;
        self.writer.journal().get_all(&conn)
    }

    pub fn subscribe_dirty_rows(&self) -> tokio::sync::broadcast::Receiver<JournalEntry> {
        self.writer.journal().subscribe()
    }

    pub async fn clear_dirty_rows(&self) -> Result<()> {
        let conn = self.writer.connection().await;
        self.writer.journal().clear(&conn)
    }

    // ---- filesets / sync ------------------------------------------------------

    pub fn file_repository(&self) -> &Arc<dyn FileRepository> {
        &self.file_repository
    }

    /// Reconciles the `__files` registry and the file repository against
    /// every fileset column's live values (spec.md §4.8 "garbage
    /// collection").
    pub async fn gc_filesets(&self) -> Result<GcReport> {
        let conn = self.writer.connection().await;
        fileset::run_gc(&conn, self.writer.schema(), &self.file_repository).await
    }

    /// Builds a [`SyncManager`] bound to this database's writer. Constructed
    /// on demand rather than held permanently, since a caller may sync
    /// against different transports/batch sizes over the database's
    /// lifetime.
    pub fn sync(&self, transport: Arc<dyn SyncTransport>, batch_size: usize) -> SyncManager {
        SyncManager::new(self.writer.clone(), transport, batch_size, self.options.bulk_load_strategy)
    }
}

/// A record is CRUD-enabled iff its source is a table, or the query was
/// declared `forUpdate(targetTable)` (spec.md §4.7).
fn record_kind_for(query: &Query) -> RecordKind {
    if let Some(target) = &query.for_update {
        return RecordKind::ForUpdate(target.clone());
    }
    match query.from.as_ref().and_then(|f| f.table_name()) {
        Some(name) if query.joins.is_empty() => RecordKind::Table(name.to_owned()),
        _ => RecordKind::View,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Column, StorageType, Table};

    fn products_schema() -> Schema {
        Schema::new().table(
            Table::new("products")
                .column(Column::new("name", StorageType::Text).not_null().lww())
                .column(Column::new("stock", StorageType::Integer).default_value(0_i64))
                .primary_key(["system_id"]),
        )
    }

    async fn open_products() -> Database {
        Database::open_in_memory(
            products_schema(),
            Arc::new(MemoryFileRepository::new()),
            OpenOptions::default(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn insert_then_query_returns_a_crud_enabled_record() {
        let db = open_products().await;
        let mut values = RowValues::new();
        values.insert("name".into(), Value::Text("Widget".into()));
        let system_id = db.insert("products", values).await.unwrap();

        let records = db.query(|| Query::from_table("products").select_all()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].system_id(), Some(system_id.as_str()));
        assert!(!records[0].is_read_only());
    }

    #[tokio::test]
    async fn record_save_persists_modified_columns() {
        let db = open_products().await;
        let mut values = RowValues::new();
        values.insert("name".into(), Value::Text("Widget".into()));
        db.insert("products", values).await.unwrap();

        let mut records = db.query(|| Query::from_table("products").select_all()).await.unwrap();
        let record = &mut records[0];
        record.set_value(db_schema(&db), "stock", 42_i64).unwrap();
        record.save().await.unwrap();

        let reloaded = db.query(|| Query::from_table("products").select_all()).await.unwrap();
        assert_eq!(reloaded[0].get("stock"), Some(&Value::Integer(42)));
    }

    #[tokio::test]
    async fn stream_emits_on_impacting_write() {
        let db = open_products().await;
        let mut values = RowValues::new();
        values.insert("name".into(), Value::Text("Widget".into()));
        db.insert("products", values).await.unwrap();

        let mut stream = db
            .stream(
                || Query::from_table("products").select_column("name"),
                |row: &ExecutedRow| row.values.get("name").unwrap().as_text().unwrap().to_owned(),
            )
            .await;

        let first = stream.recv().await.unwrap().unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(*first[0], "Widget");

        let mut more = RowValues::new();
        more.insert("name".into(), Value::Text("Gadget".into()));
        db.insert("products", more).await.unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        let second = stream.recv().await.unwrap().unwrap();
        assert_eq!(second.len(), 2);
    }

    #[tokio::test]
    async fn dirty_rows_are_recorded_and_clearable() {
        let db = open_products().await;
        let mut values = RowValues::new();
        values.insert("name".into(), Value::Text("Widget".into()));
        db.insert("products", values).await.unwrap();

        assert_eq!(db.get_dirty_rows().await.unwrap().len(), 1);
        db.clear_dirty_rows().await.unwrap();
        assert!(db.get_dirty_rows().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn bulk_load_does_not_touch_the_dirty_journal() {
        let db = open_products().await;
        let mut row = RowValues::new();
        row.insert(schema::SYSTEM_ID.to_owned(), Value::Text("remote-1".into()));
        row.insert("name".into(), Value::Text("Remote Widget".into()));
        db.bulk_load_default("products", vec![row]).await.unwrap();

        assert!(db.get_dirty_rows().await.unwrap().is_empty());
    }

    fn db_schema(db: &Database) -> &Schema {
        db.writer.schema()
    }
}
