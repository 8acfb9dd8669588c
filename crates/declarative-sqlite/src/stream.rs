//! Reactive stream registry (spec.md §4.6): per-stream dependency sets,
//! change dispatch gated by structural intersection, debounced
//! re-execution, and a row cache that preserves reference identity for
//! unchanged rows.
//!
//! Grounded on `ReQueryObservable`/`QueryRegistry` (cached plan, subscriber
//! list, skip-if-no-subscribers, change-driven re-execution), adapted from
//! its single-threaded `Rc<RefCell<_>>` shape to an `Arc`/`tokio::Mutex`one
//! so writes and stream subscribers can live on different tasks.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::error::Result;
use crate::hlc::Hlc;
use crate::query::{analyze, Dependencies, Query};
use crate::schema::Schema;
use crate::value::RowValues;

/// One row as returned by re-running a query: enough to drive the cache
/// (`system_id`, `system_version`) and the caller's mapper (`values`).
#[derive(Debug, Clone)]
pub struct ExecutedRow {
    pub system_id: String,
    pub system_version: Hlc,
    pub values: RowValues,
}

/// Runs a structured [`Query`] against the live database. Implemented by
/// the top-level `Database` so this module stays decoupled from connection
/// management.
#[async_trait::async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute_rows(&self, query: &Query) -> Result<Vec<ExecutedRow>>;
}

/// What a write reports to the registry (spec.md §4.6 "change dispatch").
#[derive(Debug, Clone)]
pub struct WriteNotification {
    pub table: String,
    pub columns_written: HashSet<String>,
    /// `true` for insert/delete, which change result-set *membership*
    /// regardless of which columns were written.
    pub is_insert_or_delete: bool,
}

impl WriteNotification {
    pub fn new(table: impl Into<String>) -> Self {
        WriteNotification {
            table: table.into(),
            columns_written: HashSet::new(),
            is_insert_or_delete: false,
        }
    }

    pub fn columns(mut self, columns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.columns_written = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn insert_or_delete(mut self) -> Self {
        self.is_insert_or_delete = true;
        self
    }
}

/// `Ok` carries the freshly materialized list; `Err` surfaces a
/// re-execution failure as an error event while the stream stays active
/// (spec.md §4.6, §7).
pub type StreamEvent<T> = Result<Vec<Arc<T>>>;

struct Inner<T> {
    cache: HashMap<String, (Hlc, Arc<T>)>,
}

/// Type-erased handle the registry dispatches writes to, independent of the
/// mapped type `T` each concrete stream carries.
trait LiveStream: Send + Sync {
    fn is_impacted(&self, write: &WriteNotification) -> bool;
    fn schedule(self: Arc<Self>, executor: Arc<dyn QueryExecutor>, debounce: Duration);
    /// `false` once the subscriber has dropped its receiving half.
    fn has_sink(&self) -> bool;
}

struct TypedLiveStream<T> {
    query: Query,
    dependencies: Dependencies,
    mapper: Arc<dyn Fn(&ExecutedRow) -> T + Send + Sync>,
    sender: mpsc::UnboundedSender<StreamEvent<T>>,
    inner: AsyncMutex<Inner<T>>,
    /// `true` while a debounce timer is already in flight — coalesces a
    /// burst of writes into a single re-execution (spec.md §4.6).
    scheduled: AtomicBool,
}

impl<T: Send + Sync + 'static> TypedLiveStream<T> {
    async fn reexecute(self: &Arc<Self>, executor: Arc<dyn QueryExecutor>) {
        let result = executor.execute_rows(&self.query).await;
        let mut inner = self.inner.lock().await;
        match result {
            Ok(rows) => {
                let mut new_cache = HashMap::with_capacity(rows.len());
                let mut emitted = Vec::with_capacity(rows.len());
                for row in &rows {
                    let mapped = match inner.cache.get(&row.system_id) {
                        Some((version, value)) if *version == row.system_version => value.clone(),
                        _ => Arc::new((self.mapper)(row)),
                    };
                    new_cache.insert(row.system_id.clone(), (row.system_version.clone(), mapped.clone()));
                    emitted.push(mapped);
                }
                inner.cache = new_cache;
                let _ = self.sender.send(Ok(emitted));
            }
            Err(e) => {
                let _ = self.sender.send(Err(e));
            }
        }
    }
}

impl<T: Send + Sync + 'static> LiveStream for TypedLiveStream<T> {
    fn is_impacted(&self, write: &WriteNotification) -> bool {
        if !self.dependencies.tables.contains(&write.table) {
            return false;
        }
        if write.is_insert_or_delete {
            return true;
        }
        if self.dependencies.is_wildcard_on(&write.table) {
            return true;
        }
        write
            .columns_written
            .iter()
            .any(|c| self.dependencies.columns.contains(&(write.table.clone(), c.clone())))
    }

    fn schedule(self: Arc<Self>, executor: Arc<dyn QueryExecutor>, debounce: Duration) {
        if self.scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            self.scheduled.store(false, Ordering::SeqCst);
            self.reexecute(executor).await;
        });
    }

    fn has_sink(&self) -> bool {
        !self.sender.is_closed()
    }
}

/// The caller's handle to a live query: an async stream of materialized
/// lists, terminated when the registry drops it (database close) or the
/// caller drops its receiving half (unsubscribe).
pub struct QueryStream<T> {
    id: u64,
    receiver: mpsc::UnboundedReceiver<StreamEvent<T>>,
}

impl<T> QueryStream<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Awaits the next materialized list or error event.
    pub async fn recv(&mut self) -> Option<StreamEvent<T>> {
        self.receiver.recv().await
    }
}

impl<T> futures::Stream for QueryStream<T> {
    type Item = StreamEvent<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

/// Registry of every live stream, keyed by an opaque subscription id.
pub struct StreamRegistry {
    executor: Arc<dyn QueryExecutor>,
    debounce: Duration,
    next_id: AtomicU64,
    streams: StdMutex<HashMap<u64, Arc<dyn LiveStream>>>,
}

impl StreamRegistry {
    pub fn new(executor: Arc<dyn QueryExecutor>, debounce: Duration) -> Self {
        StreamRegistry {
            executor,
            debounce,
            next_id: AtomicU64::new(1),
            streams: StdMutex::new(HashMap::new()),
        }
    }

    /// Registers a new stream: computes its dependency set, runs the query
    /// once to populate the cache, and emits the initial list (spec.md §4.6
    /// "Creation").
    pub async fn register<T>(
        &self,
        query: Query,
        schema: &Schema,
        mapper: Arc<dyn Fn(&ExecutedRow) -> T + Send + Sync>,
    ) -> QueryStream<T>
    where
        T: Send + Sync + 'static,
    {
        let dependencies = analyze(&query, schema);
        let (sender, receiver) = mpsc::unbounded_channel();
        let live = Arc::new(TypedLiveStream {
            query,
            dependencies,
            mapper,
            sender,
            inner: AsyncMutex::new(Inner { cache: HashMap::new() }),
            scheduled: AtomicBool::new(false),
        });
        live.reexecute(self.executor.clone()).await;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.streams.lock().expect("stream registry poisoned").insert(id, live);
        QueryStream { id, receiver }
    }

    /// Intersects `write` against every live stream's dependency set and
    /// schedules the impacted ones for debounced re-execution (spec.md
    /// §4.6 "Change dispatch").
    pub fn notify(&self, write: WriteNotification) {
        self.sweep_cancelled();
        let streams = self.streams.lock().expect("stream registry poisoned");
        for stream in streams.values() {
            if stream.is_impacted(&write) {
                stream.clone().schedule(self.executor.clone(), self.debounce);
            }
        }
    }

    /// Removes streams whose subscriber has dropped its receiver (spec.md
    /// §4.6 "Cleanup").
    pub fn sweep_cancelled(&self) {
        self.streams.lock().expect("stream registry poisoned").retain(|_, s| s.has_sink());
    }

    /// Drops every live stream, completing each subscriber's stream (spec.md
    /// §4.6 "disposing the database completes all streams").
    pub fn close_all(&self) {
        self.streams.lock().expect("stream registry poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.streams.lock().expect("stream registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
