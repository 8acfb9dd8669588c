//! Fileset columns and the file repository (spec.md §4.8). No teacher table
//! maps directly onto blob storage, so this module is a supplement built in
//! the teacher's idiom: a small trait with in-memory and disk-backed
//! implementations, the way `ah-local-db` separates its `Database` handle
//! from pluggable storage concerns.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex as AsyncMutex;

use crate::error::Result;
use crate::hlc::Hlc;
use crate::schema::{Schema, LogicalType};
use crate::value::{RowValues, Value};

pub const REGISTRY_TABLE: &str = "__files";

/// Metadata for one stored blob (spec.md §4.8 "file registry").
#[derive(Debug, Clone, PartialEq)]
pub struct FileMeta {
    pub file_id: String,
    pub fileset_id: String,
    pub name: String,
    pub size: u64,
    pub created_at: Hlc,
}

#[derive(Debug, Clone, Default)]
pub struct GcReport {
    pub filesets_removed: usize,
    pub files_removed: usize,
}

pub fn create_registry_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {REGISTRY_TABLE} (
            file_id TEXT PRIMARY KEY,
            fileset_id TEXT NOT NULL,
            name TEXT NOT NULL,
            size INTEGER NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_files_fileset ON {REGISTRY_TABLE} (fileset_id);"
    ))?;
    Ok(())
}

fn insert_meta(conn: &Connection, meta: &FileMeta) -> Result<()> {
    conn.execute(
        &format!("INSERT INTO {REGISTRY_TABLE} (file_id, fileset_id, name, size, created_at) VALUES (?1, ?2, ?3, ?4, ?5)"),
        params![meta.file_id, meta.fileset_id, meta.name, meta.size as i64, meta.created_at.to_string()],
    )?;
    Ok(())
}

fn remove_meta(conn: &Connection, fileset_id: &str, file_id: &str) -> Result<()> {
    conn.execute(
        &format!("DELETE FROM {REGISTRY_TABLE} WHERE fileset_id = ?1 AND file_id = ?2"),
        params![fileset_id, file_id],
    )?;
    Ok(())
}

fn list_meta(conn: &Connection, fileset_id: &str) -> Result<Vec<FileMeta>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT file_id, fileset_id, name, size, created_at FROM {REGISTRY_TABLE} WHERE fileset_id = ?1 ORDER BY created_at ASC"
    ))?;
    let rows = stmt.query_map(params![fileset_id], |row| {
        let created_at: String = row.get(4)?;
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, i64>(3)?,
            created_at,
        ))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (file_id, fileset_id, name, size, created_at) = row?;
        out.push(FileMeta {
            file_id,
            fileset_id,
            name,
            size: size as u64,
            created_at: created_at.parse().unwrap_or_else(|_| Hlc::zero("unknown")),
        });
    }
    Ok(out)
}

fn distinct_fileset_ids(conn: &Connection) -> Result<HashSet<String>> {
    let mut stmt = conn.prepare(&format!("SELECT DISTINCT fileset_id FROM {REGISTRY_TABLE}"))?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut out = HashSet::new();
    for row in rows {
        out.insert(row?);
    }
    Ok(out)
}

/// Scans every declared `Fileset`-logical-type column on every non-system
/// table and returns the set of fileset ids still referenced by a row
/// (spec.md §4.8 "garbage collection"). The empty string means "no value"
/// and is not a live reference.
pub fn collect_live_fileset_ids(schema: &Schema, conn: &Connection) -> Result<HashSet<String>> {
    let mut live = HashSet::new();
    for table in &schema.tables {
        if table.is_system {
            continue;
        }
        for column in &table.columns {
            if column.logical_type != Some(LogicalType::Fileset) {
                continue;
            }
            let sql = format!(
                "SELECT DISTINCT \"{}\" FROM \"{}\" WHERE \"{}\" IS NOT NULL AND \"{}\" <> ''",
                column.name, table.name, column.name, column.name
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            for row in rows {
                live.insert(row?);
            }
        }
    }
    Ok(live)
}

/// Storage backend for fileset blobs (spec.md §4.8). One implementation per
/// storage medium; `Database` holds one behind an `Arc<dyn FileRepository>`.
#[async_trait::async_trait]
pub trait FileRepository: Send + Sync {
    async fn add(&self, fileset_id: &str, name: &str, bytes: Vec<u8>) -> Result<String>;
    async fn list(&self, fileset_id: &str) -> Result<Vec<FileMeta>>;
    async fn get(&self, fileset_id: &str, file_id: &str) -> Result<Vec<u8>>;
    async fn delete(&self, fileset_id: &str, file_id: &str) -> Result<()>;
    /// Removes every fileset not present in `live_fileset_ids`, returning how
    /// much was reclaimed.
    async fn gc(&self, live_fileset_ids: &HashSet<String>) -> Result<GcReport>;
}

/// An ergonomic handle bound to one fileset column value, so callers don't
/// thread `fileset_id`/repository pairs through by hand (spec.md §4.8
/// "FilesetField").
pub struct FilesetField {
    fileset_id: String,
    repository: Arc<dyn FileRepository>,
}

impl FilesetField {
    pub fn new(fileset_id: impl Into<String>, repository: Arc<dyn FileRepository>) -> Self {
        FilesetField {
            fileset_id: fileset_id.into(),
            repository,
        }
    }

    pub fn id(&self) -> &str {
        &self.fileset_id
    }

    pub async fn add(&self, name: &str, bytes: Vec<u8>) -> Result<String> {
        self.repository.add(&self.fileset_id, name, bytes).await
    }

    pub async fn list(&self) -> Result<Vec<FileMeta>> {
        self.repository.list(&self.fileset_id).await
    }

    pub async fn get(&self, file_id: &str) -> Result<Vec<u8>> {
        self.repository.get(&self.fileset_id, file_id).await
    }

    pub async fn delete(&self, file_id: &str) -> Result<()> {
        self.repository.delete(&self.fileset_id, file_id).await
    }
}

type MemoryStore = HashMap<String, HashMap<String, (String, Vec<u8>)>>;

/// In-memory blob store, for tests and ephemeral databases
/// (`open_in_memory`).
pub struct MemoryFileRepository {
    store: AsyncMutex<MemoryStore>,
}

impl MemoryFileRepository {
    pub fn new() -> Self {
        MemoryFileRepository {
            store: AsyncMutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryFileRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl FileRepository for MemoryFileRepository {
    async fn add(&self, fileset_id: &str, name: &str, bytes: Vec<u8>) -> Result<String> {
        let file_id = uuid::Uuid::new_v4().to_string();
        let mut store = self.store.lock().await;
        store
            .entry(fileset_id.to_owned())
            .or_default()
            .insert(file_id.clone(), (name.to_owned(), bytes));
        Ok(file_id)
    }

    async fn list(&self, fileset_id: &str) -> Result<Vec<FileMeta>> {
        let store = self.store.lock().await;
        Ok(store
            .get(fileset_id)
            .map(|files| {
                files
                    .iter()
                    .map(|(file_id, (name, bytes))| FileMeta {
                        file_id: file_id.clone(),
                        fileset_id: fileset_id.to_owned(),
                        name: name.clone(),
                        size: bytes.len() as u64,
                        created_at: Hlc::zero(fileset_id),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get(&self, fileset_id: &str, file_id: &str) -> Result<Vec<u8>> {
        let store = self.store.lock().await;
        store
            .get(fileset_id)
            .and_then(|files| files.get(file_id))
            .map(|(_, bytes)| bytes.clone())
            .ok_or_else(|| crate::error::Error::not_found(REGISTRY_TABLE))
    }

    async fn delete(&self, fileset_id: &str, file_id: &str) -> Result<()> {
        let mut store = self.store.lock().await;
        if let Some(files) = store.get_mut(fileset_id) {
            files.remove(file_id);
        }
        Ok(())
    }

    async fn gc(&self, live_fileset_ids: &HashSet<String>) -> Result<GcReport> {
        let mut store = self.store.lock().await;
        let mut report = GcReport::default();
        store.retain(|fileset_id, files| {
            if live_fileset_ids.contains(fileset_id) {
                true
            } else {
                report.filesets_removed += 1;
                report.files_removed += files.len();
                false
            }
        });
        Ok(report)
    }
}

/// Disk-backed blob store: one directory per fileset id under `root`.
pub struct DiskFileRepository {
    root: PathBuf,
}

impl DiskFileRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DiskFileRepository { root: root.into() }
    }

    fn fileset_dir(&self, fileset_id: &str) -> PathBuf {
        self.root.join(fileset_id)
    }

    fn blob_path(&self, fileset_id: &str, file_id: &str) -> PathBuf {
        self.fileset_dir(fileset_id).join(file_id)
    }

    fn meta_path(&self, fileset_id: &str, file_id: &str) -> PathBuf {
        self.fileset_dir(fileset_id).join(format!("{file_id}.name"))
    }
}

#[async_trait::async_trait]
impl FileRepository for DiskFileRepository {
    async fn add(&self, fileset_id: &str, name: &str, bytes: Vec<u8>) -> Result<String> {
        let file_id = uuid::Uuid::new_v4().to_string();
        let dir = self.fileset_dir(fileset_id);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(self.blob_path(fileset_id, &file_id), &bytes).await?;
        tokio::fs::write(self.meta_path(fileset_id, &file_id), name).await?;
        Ok(file_id)
    }

    async fn list(&self, fileset_id: &str) -> Result<Vec<FileMeta>> {
        let dir = self.fileset_dir(fileset_id);
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if file_name.ends_with(".name") {
                continue;
            }
            let name = tokio::fs::read_to_string(self.meta_path(fileset_id, &file_name)).await.unwrap_or_default();
            let size = entry.metadata().await?.len();
            out.push(FileMeta {
                file_id: file_name.to_string(),
                fileset_id: fileset_id.to_owned(),
                name,
                size,
                created_at: Hlc::zero(fileset_id),
            });
        }
        Ok(out)
    }

    async fn get(&self, fileset_id: &str, file_id: &str) -> Result<Vec<u8>> {
        tokio::fs::read(self.blob_path(fileset_id, file_id))
            .await
            .map_err(|e| if e.kind() == std::io::ErrorKind::NotFound { crate::error::Error::not_found(REGISTRY_TABLE) } else { e.into() })
    }

    async fn delete(&self, fileset_id: &str, file_id: &str) -> Result<()> {
        let _ = tokio::fs::remove_file(self.blob_path(fileset_id, file_id)).await;
        let _ = tokio::fs::remove_file(self.meta_path(fileset_id, file_id)).await;
        Ok(())
    }

    async fn gc(&self, live_fileset_ids: &HashSet<String>) -> Result<GcReport> {
        let mut report = GcReport::default();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(report),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let fileset_id = entry.file_name().to_string_lossy().to_string();
            if live_fileset_ids.contains(&fileset_id) {
                continue;
            }
            let dir = entry.path();
            let mut file_count = 0usize;
            if let Ok(mut files) = tokio::fs::read_dir(&dir).await {
                while let Some(f) = files.next_entry().await? {
                    if !f.file_name().to_string_lossy().ends_with(".name") {
                        file_count += 1;
                    }
                }
            }
            tokio::fs::remove_dir_all(&dir).await?;
            report.filesets_removed += 1;
            report.files_removed += file_count;
        }
        Ok(report)
    }
}

/// Reconciles the `__files` registry against `repository`'s actual blob
/// storage and drops anything `schema`'s live fileset-column scan no longer
/// references (spec.md §4.8 "garbage collection").
pub async fn run_gc(
    conn: &Connection,
    schema: &Schema,
    repository: &Arc<dyn FileRepository>,
) -> Result<GcReport> {
    let live = collect_live_fileset_ids(schema, conn)?;
    let registered = distinct_fileset_ids(conn)?;
    let mut report = GcReport::default();

    for fileset_id in registered.difference(&live) {
        for meta in list_meta(conn, fileset_id)? {
            remove_meta(conn, fileset_id, &meta.file_id)?;
        }
        report.filesets_removed += 1;
    }

    let repo_report = repository.gc(&live).await?;
    report.filesets_removed += repo_report.filesets_removed;
    report.files_removed += repo_report.files_removed;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_repository_round_trips_and_lists() {
        let repo = MemoryFileRepository::new();
        let id = repo.add("fs-1", "a.txt", b"hello".to_vec()).await.unwrap();
        let listed = repo.list("fs-1").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "a.txt");
        assert_eq!(repo.get("fs-1", &id).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn memory_repository_gc_drops_unreferenced_filesets() {
        let repo = MemoryFileRepository::new();
        repo.add("fs-live", "a.txt", b"1".to_vec()).await.unwrap();
        repo.add("fs-orphan", "b.txt", b"2".to_vec()).await.unwrap();

        let mut live = HashSet::new();
        live.insert("fs-live".to_owned());
        let report = repo.gc(&live).await.unwrap();

        assert_eq!(report.filesets_removed, 1);
        assert_eq!(report.files_removed, 1);
        assert!(repo.list("fs-live").await.unwrap().len() == 1);
        assert!(repo.list("fs-orphan").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn disk_repository_round_trips_and_gcs() {
        let dir = tempfile::tempdir().unwrap();
        let repo = DiskFileRepository::new(dir.path());
        let id = repo.add("fs-1", "a.txt", b"hi".to_vec()).await.unwrap();
        assert_eq!(repo.get("fs-1", &id).await.unwrap(), b"hi");

        let empty = HashSet::new();
        let report = repo.gc(&empty).await.unwrap();
        assert_eq!(report.filesets_removed, 1);
        assert!(repo.list("fs-1").await.unwrap().is_empty());
    }
}
