//! Sync manager: orchestrates uploading the dirty journal and fetching
//! remote changes through caller-supplied callbacks (spec.md §4.9).
//!
//! Grounded on the upload/apply/cursor split found in the reference
//! oplog implementation: `get_pending_ops`/`mark_ops_pushed` became upload,
//! `apply_remote_ops`/`get_remote_cursor`/`set_remote_cursor` became fetch,
//! generalized from a raw SQLite cursor string to a per-table HLC
//! high-water mark since this library already has an HLC.

use std::collections::HashMap;
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Error, Result, SyncErrorKind};
use crate::hlc::Hlc;
use crate::journal::JournalEntry;
use crate::write::{ConstraintStrategy, Writer};

pub const TABLE_NAME: &str = "sync_server_timestamps";

pub fn create_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {TABLE_NAME} (
            table_name TEXT PRIMARY KEY,
            server_timestamp TEXT NOT NULL
        );"
    ))?;
    Ok(())
}

fn read_cursor(conn: &Connection, table_name: &str) -> Result<Option<Hlc>> {
    let text: Option<String> = conn
        .query_row(
            &format!("SELECT server_timestamp FROM {TABLE_NAME} WHERE table_name = ?1"),
            params![table_name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(match text {
        Some(text) => Some(text.parse()?),
        None => None,
    })
}

fn write_cursor(conn: &Connection, table_name: &str, hlc: &Hlc) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO {TABLE_NAME} (table_name, server_timestamp) VALUES (?1, ?2)
             ON CONFLICT(table_name) DO UPDATE SET server_timestamp = excluded.server_timestamp"
        ),
        params![table_name, hlc.to_string()],
    )?;
    Ok(())
}

/// Result of pushing one batch of journal entries to the remote server
/// (spec.md §4.9 "Upload"). `onSend` reports one of these per call.
#[derive(Debug, Clone)]
pub enum SendOutcome {
    /// The server accepted the batch; it is removed from the journal.
    Accepted,
    /// The server permanently rejected the batch (e.g. schema mismatch); it
    /// is removed from the journal and the discard is logged.
    Rejected { reason: String },
    /// The callback failed transiently (network error, timeout); the batch
    /// is left in the journal for a later retry.
    Failed { reason: String },
}

/// Rows to insert or merge for one table during a fetch, along with the new
/// high-water mark to persist once `bulkLoad` succeeds (spec.md §4.9
/// "Fetch").
pub struct FetchedTable {
    pub table_name: String,
    pub rows: Vec<crate::value::RowValues>,
    pub new_cursor: Hlc,
}

/// The remote transport a caller wires up to move bytes; the sync manager
/// only knows about batches, cursors and outcomes (spec.md §1 non-goal: "the
/// remote sync transport ... only").
#[async_trait::async_trait]
pub trait SyncTransport: Send + Sync {
    /// Pushes one batch of pending local changes.
    async fn send(&self, batch: &[JournalEntry]) -> SendOutcome;

    /// Pulls remote changes for every table whose cursor is in `cursors`
    /// (`None` meaning "never fetched"). Returns one [`FetchedTable`] per
    /// table that had new data; tables with nothing new are omitted.
    async fn fetch(&self, cursors: &HashMap<String, Option<Hlc>>) -> Result<Vec<FetchedTable>>;
}

#[derive(Debug, Clone, Default)]
pub struct UploadReport {
    pub batches_sent: usize,
    pub entries_uploaded: usize,
    pub entries_rejected: usize,
    pub entries_pending_retry: usize,
}

#[derive(Debug, Clone, Default)]
pub struct FetchReport {
    pub tables_updated: usize,
    pub rows_loaded: usize,
}

/// Orchestrates bidirectional sync against a [`Writer`] (spec.md §4.9).
pub struct SyncManager {
    writer: Arc<Writer>,
    transport: Arc<dyn SyncTransport>,
    batch_size: usize,
    bulk_load_strategy: ConstraintStrategy,
}

impl SyncManager {
    pub fn new(
        writer: Arc<Writer>,
        transport: Arc<dyn SyncTransport>,
        batch_size: usize,
        bulk_load_strategy: ConstraintStrategy,
    ) -> Self {
        SyncManager {
            writer,
            transport,
            batch_size: batch_size.max(1),
            bulk_load_strategy,
        }
    }

    /// Reads the journal, sends it in batches of `batch_size`, and reconciles
    /// the journal against each batch's outcome (spec.md §4.9 "Upload").
    pub async fn upload(&self) -> Result<UploadReport> {
        let mut report = UploadReport::default();
        let entries = {
            let conn = self.writer.connection().await;
            self.writer.journal().get_all(&conn)?
        };

        for chunk in entries.chunks(self.batch_size) {
            let outcome = self.transport.send(chunk).await;
            report.batches_sent += 1;

            match outcome {
                SendOutcome::Accepted => {
                    report.entries_uploaded += chunk.len();
                    self.remove_batch(chunk).await?;
                }
                SendOutcome::Rejected { reason } => {
                    tracing::warn!(batch_len = chunk.len(), reason = %reason, "discarding rejected sync batch");
                    report.entries_rejected += chunk.len();
                    self.remove_batch(chunk).await?;
                    return Err(Error::Sync {
                        message: reason,
                        kind: SyncErrorKind::Hard,
                    });
                }
                SendOutcome::Failed { reason } => {
                    tracing::warn!(batch_len = chunk.len(), reason = %reason, "sync batch failed, left for retry");
                    report.entries_pending_retry += chunk.len();
                    return Err(Error::Sync {
                        message: reason,
                        kind: SyncErrorKind::Soft,
                    });
                }
            }
        }

        Ok(report)
    }

    async fn remove_batch(&self, batch: &[JournalEntry]) -> Result<()> {
        let keys: Vec<(String, String)> = batch
            .iter()
            .map(|entry| (entry.table_name.clone(), entry.row_id.clone()))
            .collect();
        let conn = self.writer.connection().await;
        self.writer.journal().remove(&conn, &keys)
    }

    /// Reads each table's high-water mark, asks the transport for anything
    /// newer, and applies it via `bulkLoad` (spec.md §4.9 "Fetch"). The
    /// high-water mark only advances for tables the fetch actually updated.
    pub async fn fetch(&self, tables: &[String]) -> Result<FetchReport> {
        let cursors = {
            let conn = self.writer.connection().await;
            let mut cursors = HashMap::new();
            for table in tables {
                cursors.insert(table.clone(), read_cursor(&conn, table)?);
            }
            cursors
        };

        let fetched = self.transport.fetch(&cursors).await?;
        let mut report = FetchReport::default();

        for table in fetched {
            let row_count = table.rows.len();
            self.writer
                .bulk_load(&table.table_name, table.rows, self.bulk_load_strategy)
                .await?;

            let conn = self.writer.connection().await;
            write_cursor(&conn, &table.table_name, &table.new_cursor)?;

            report.tables_updated += 1;
            report.rows_loaded += row_count;
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hlc::HlcClock;
    use crate::schema::{Column, Schema, StorageType, Table};
    use crate::value::Value;
    use std::sync::Mutex as StdMutex;

    fn products_schema() -> Schema {
        Schema::new().table(
            Table::new("products")
                .column(Column::new("name", StorageType::Text).not_null().lww())
                .primary_key(["system_id"]),
        )
    }

    fn writer_with_schema(schema: Schema) -> Writer {
        let mut conn = Connection::open_in_memory().unwrap();
        let live = crate::introspect::introspect(&conn).unwrap();
        let steps = crate::migrate::plan(&schema, &live).unwrap();
        crate::migrate::apply(&mut conn, &steps).unwrap();
        create_table(&conn).unwrap();
        Writer::new(conn, schema, Arc::new(HlcClock::new("node-a")))
    }

    struct AcceptingTransport {
        sent_batches: StdMutex<Vec<usize>>,
    }

    #[async_trait::async_trait]
    impl SyncTransport for AcceptingTransport {
        async fn send(&self, batch: &[JournalEntry]) -> SendOutcome {
            self.sent_batches.lock().unwrap().push(batch.len());
            SendOutcome::Accepted
        }

        async fn fetch(&self, _cursors: &HashMap<String, Option<Hlc>>) -> Result<Vec<FetchedTable>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn upload_removes_accepted_entries_from_the_journal() {
        let writer = Arc::new(writer_with_schema(products_schema()));
        let mut values = crate::value::RowValues::new();
        values.insert("name".into(), Value::Text("widget".into()));
        writer.insert("products", values).await.unwrap();

        {
            let conn = writer.connection().await;
            assert_eq!(writer.journal().get_all(&conn).unwrap().len(), 1);
        }

        let transport = Arc::new(AcceptingTransport {
            sent_batches: StdMutex::new(Vec::new()),
        });
        let manager = SyncManager::new(writer.clone(), transport.clone(), 10, ConstraintStrategy::default());
        let report = manager.upload().await.unwrap();

        assert_eq!(report.entries_uploaded, 1);
        assert_eq!(transport.sent_batches.lock().unwrap().as_slice(), &[1]);

        let conn = writer.connection().await;
        assert!(writer.journal().get_all(&conn).unwrap().is_empty());
    }

    struct FailingTransport;

    #[async_trait::async_trait]
    impl SyncTransport for FailingTransport {
        async fn send(&self, _batch: &[JournalEntry]) -> SendOutcome {
            SendOutcome::Failed {
                reason: "connection reset".into(),
            }
        }

        async fn fetch(&self, _cursors: &HashMap<String, Option<Hlc>>) -> Result<Vec<FetchedTable>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn soft_failure_leaves_entries_in_the_journal_for_retry() {
        let writer = Arc::new(writer_with_schema(products_schema()));
        let mut values = crate::value::RowValues::new();
        values.insert("name".into(), Value::Text("widget".into()));
        writer.insert("products", values).await.unwrap();

        let manager = SyncManager::new(writer.clone(), Arc::new(FailingTransport), 10, ConstraintStrategy::default());
        let result = manager.upload().await;
        assert!(matches!(
            result,
            Err(Error::Sync {
                kind: SyncErrorKind::Soft,
                ..
            })
        ));

        let conn = writer.connection().await;
        assert_eq!(writer.journal().get_all(&conn).unwrap().len(), 1);
    }

    struct BulkLoadTransport;

    #[async_trait::async_trait]
    impl SyncTransport for BulkLoadTransport {
        async fn send(&self, _batch: &[JournalEntry]) -> SendOutcome {
            SendOutcome::Accepted
        }

        async fn fetch(&self, cursors: &HashMap<String, Option<Hlc>>) -> Result<Vec<FetchedTable>> {
            assert!(cursors.contains_key("products"));
            let mut row = crate::value::RowValues::new();
            row.insert("system_id".into(), Value::Text("remote-1".into()));
            row.insert("name".into(), Value::Text("remote widget".into()));
            Ok(vec![FetchedTable {
                table_name: "products".into(),
                rows: vec![row],
                new_cursor: Hlc::zero("server"),
            }])
        }
    }

    #[tokio::test]
    async fn fetch_bulk_loads_rows_and_advances_the_cursor() {
        let writer = Arc::new(writer_with_schema(products_schema()));
        let manager = SyncManager::new(writer.clone(), Arc::new(BulkLoadTransport), 10, ConstraintStrategy::default());

        let report = manager.fetch(&["products".to_owned()]).await.unwrap();
        assert_eq!(report.tables_updated, 1);
        assert_eq!(report.rows_loaded, 1);

        let row = writer.read_by_system_id("products", "remote-1").await.unwrap();
        assert_eq!(row.get("name"), Some(&Value::Text("remote widget".into())));
        let stamped_version = row.get("system_version").and_then(Value::as_text).unwrap();
        stamped_version.parse::<Hlc>().expect("fabricated system_version must round-trip as an Hlc");

        let conn = writer.connection().await;
        let cursor = read_cursor(&conn, "products").unwrap();
        assert_eq!(cursor, Some(Hlc::zero("server")));
    }
}
