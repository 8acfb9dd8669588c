//! Dirty-row journal: a durable queue of pending local mutations awaiting
//! upload, plus an in-memory broadcast of every accepted add (spec.md §4.5).
//!
//! The persistence shape mirrors the upsert-by-key oplog pattern: one row
//! per `(table_name, row_id)`, collapsed on every write so the store never
//! grows past the number of dirty rows.

use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::broadcast;

use crate::error::Result;
use crate::hlc::Hlc;
use crate::value::{row_from_json, row_to_json, RowValues};

pub const TABLE_NAME: &str = "__dirty_rows";

/// One pending mutation, keyed by `(table_name, row_id)`.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalEntry {
    pub table_name: String,
    pub row_id: String,
    pub hlc: Hlc,
    /// Full-row entries carry every column (local-origin writes); partial
    /// entries carry only the LWW subset plus `system_id` (remote-origin
    /// writes), per spec.md §4.4.
    pub is_full_row: bool,
    /// `None` represents a delete (spec.md §4.5: "data is ... null for
    /// deletes").
    pub data: Option<RowValues>,
}

impl JournalEntry {
    /// Merges `incoming` on top of `self`, the row already on record for the
    /// same key (spec.md §4.5 collapse rules):
    /// - a partial entry followed by a full entry stays full;
    /// - a full entry followed by a partial entry stays full (the payload
    ///   keeps whatever the partial entry updates, since that reflects a
    ///   newer write to those specific columns);
    /// - partial + partial merges payload maps latest-wins per column;
    /// - either side being a delete (`data: None`) wins, since deletes
    ///   supersede any earlier pending payload for the row.
    fn collapse(self, incoming: JournalEntry) -> JournalEntry {
        let is_full_row = self.is_full_row || incoming.is_full_row;
        let data = match (self.data, incoming.data) {
            (_, None) => None,
            (None, Some(new_data)) => Some(new_data),
            (Some(mut old_data), Some(new_data)) => {
                old_data.extend(new_data);
                Some(old_data)
            }
        };
        JournalEntry {
            table_name: incoming.table_name,
            row_id: incoming.row_id,
            hlc: incoming.hlc,
            is_full_row,
            data,
        }
    }
}

pub fn create_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {TABLE_NAME} (
            table_name TEXT NOT NULL,
            row_id TEXT NOT NULL,
            hlc TEXT NOT NULL,
            is_full_row INTEGER NOT NULL,
            data_json TEXT,
            PRIMARY KEY (table_name, row_id)
        );"
    ))?;
    Ok(())
}

/// Persistent dirty-row queue with a lazy broadcast of every accepted add.
pub struct Journal {
    /// Capacity of the broadcast channel; a lagging subscriber drops the
    /// oldest entries rather than stalling writers (spec.md §5, §9 "Broadcast
    /// stream").
    sender: broadcast::Sender<JournalEntry>,
}

impl Journal {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Journal { sender }
    }

    /// Upserts `entry` by `(table_name, row_id)`, collapsing with any
    /// existing entry for the same key, then broadcasts the *collapsed*
    /// result (spec.md §4.5 `add`).
    pub fn add(&self, conn: &Connection, entry: JournalEntry) -> Result<()> {
        let existing = self.find(conn, &entry.table_name, &entry.row_id)?;
        let merged = match existing {
            Some(existing) => existing.collapse(entry),
            None => entry,
        };
        self.upsert(conn, &merged)?;
        // A lazily-constructed broadcast channel has no receivers until the
        // first subscription; sending with none is not an error.
        let _ = self.sender.send(merged);
        Ok(())
    }

    fn upsert(&self, conn: &Connection, entry: &JournalEntry) -> Result<()> {
        conn.execute(
            &format!(
                "INSERT INTO {TABLE_NAME} (table_name, row_id, hlc, is_full_row, data_json)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(table_name, row_id) DO UPDATE SET
                     hlc = excluded.hlc,
                     is_full_row = excluded.is_full_row,
                     data_json = excluded.data_json"
            ),
            params![
                entry.table_name,
                entry.row_id,
                entry.hlc.to_string(),
                entry.is_full_row as i64,
                entry.data.as_ref().map(|d| row_to_json(d).to_string()),
            ],
        )?;
        Ok(())
    }

    fn find(&self, conn: &Connection, table_name: &str, row_id: &str) -> Result<Option<JournalEntry>> {
        conn.query_row(
            &format!(
                "SELECT table_name, row_id, hlc, is_full_row, data_json
                 FROM {TABLE_NAME} WHERE table_name = ?1 AND row_id = ?2"
            ),
            params![table_name, row_id],
            row_to_entry,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Snapshot of every pending entry, ordered by HLC ascending (spec.md
    /// §4.5 `getAll`).
    pub fn get_all(&self, conn: &Connection) -> Result<Vec<JournalEntry>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT table_name, row_id, hlc, is_full_row, data_json
             FROM {TABLE_NAME} ORDER BY hlc ASC"
        ))?;
        let rows = stmt.query_map([], row_to_entry)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Drops the given `(table_name, row_id)` keys; idempotent if a key is
    /// already absent (spec.md §4.5 `remove`).
    pub fn remove(&self, conn: &Connection, entries: &[(String, String)]) -> Result<()> {
        for (table_name, row_id) in entries {
            conn.execute(
                &format!("DELETE FROM {TABLE_NAME} WHERE table_name = ?1 AND row_id = ?2"),
                params![table_name, row_id],
            )?;
        }
        Ok(())
    }

    /// Deletes every pending entry (spec.md §4.5 `clear`).
    pub fn clear(&self, conn: &Connection) -> Result<()> {
        conn.execute(&format!("DELETE FROM {TABLE_NAME}"), [])?;
        Ok(())
    }

    /// Subscribes to every future accepted `add`. Multiple subscribers each
    /// receive every add independently; a subscriber that falls behind the
    /// channel capacity silently drops the oldest entries on its next recv
    /// rather than blocking `add` (spec.md §5, §4.5 `onRowAdded`).
    pub fn subscribe(&self) -> broadcast::Receiver<JournalEntry> {
        self.sender.subscribe()
    }
}

impl Default for Journal {
    fn default() -> Self {
        Self::new()
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<JournalEntry> {
    let hlc_text: String = row.get(2)?;
    let hlc = hlc_text.parse::<Hlc>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let data_json: Option<String> = row.get(4)?;
    let data = match data_json {
        Some(raw) => {
            let value: serde_json::Value = serde_json::from_str(&raw).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
            })?;
            Some(row_from_json(&value).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
            })?)
        }
        None => None,
    };
    Ok(JournalEntry {
        table_name: row.get(0)?,
        row_id: row.get(1)?,
        hlc,
        is_full_row: row.get::<_, i64>(3)? != 0,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn setup() -> (Connection, Journal) {
        let conn = Connection::open_in_memory().unwrap();
        create_table(&conn).unwrap();
        (conn, Journal::new())
    }

    fn hlc(millis: i64) -> Hlc {
        Hlc {
            millis,
            counter: 0,
            node_id: "n".into(),
        }
    }

    #[test]
    fn add_then_get_all_round_trips() {
        let (conn, journal) = setup();
        let mut data = RowValues::new();
        data.insert("name".into(), Value::Text("a".into()));
        journal
            .add(
                &conn,
                JournalEntry {
                    table_name: "products".into(),
                    row_id: "1".into(),
                    hlc: hlc(1),
                    is_full_row: true,
                    data: Some(data.clone()),
                },
            )
            .unwrap();

        let all = journal.get_all(&conn).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].data, Some(data));
    }

    #[test]
    fn repeated_updates_collapse_into_one_entry_with_latest_data() {
        let (conn, journal) = setup();
        for (millis, name) in [(1, "first"), (2, "second"), (3, "third")] {
            let mut data = RowValues::new();
            data.insert("name".into(), Value::Text(name.into()));
            journal
                .add(
                    &conn,
                    JournalEntry {
                        table_name: "products".into(),
                        row_id: "1".into(),
                        hlc: hlc(millis),
                        is_full_row: true,
                        data: Some(data),
                    },
                )
                .unwrap();
        }

        let all = journal.get_all(&conn).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].hlc, hlc(3));
        assert_eq!(all[0].data.as_ref().unwrap().get("name"), Some(&Value::Text("third".into())));
    }

    #[test]
    fn partial_followed_by_full_stays_full() {
        let (conn, journal) = setup();
        let mut partial = RowValues::new();
        partial.insert("name__hlc".into(), Value::Text(hlc(1).to_string()));
        journal
            .add(
                &conn,
                JournalEntry {
                    table_name: "products".into(),
                    row_id: "1".into(),
                    hlc: hlc(1),
                    is_full_row: false,
                    data: Some(partial),
                },
            )
            .unwrap();

        let mut full = RowValues::new();
        full.insert("stock".into(), Value::Integer(5));
        journal
            .add(
                &conn,
                JournalEntry {
                    table_name: "products".into(),
                    row_id: "1".into(),
                    hlc: hlc(2),
                    is_full_row: true,
                    data: Some(full),
                },
            )
            .unwrap();

        let all = journal.get_all(&conn).unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].is_full_row);
        // latest-wins merge keeps both columns once merged.
        assert!(all[0].data.as_ref().unwrap().contains_key("name__hlc"));
        assert!(all[0].data.as_ref().unwrap().contains_key("stock"));
    }

    #[test]
    fn delete_collapses_any_pending_payload() {
        let (conn, journal) = setup();
        let mut data = RowValues::new();
        data.insert("name".into(), Value::Text("a".into()));
        journal
            .add(
                &conn,
                JournalEntry {
                    table_name: "products".into(),
                    row_id: "1".into(),
                    hlc: hlc(1),
                    is_full_row: true,
                    data: Some(data),
                },
            )
            .unwrap();
        journal
            .add(
                &conn,
                JournalEntry {
                    table_name: "products".into(),
                    row_id: "1".into(),
                    hlc: hlc(2),
                    is_full_row: true,
                    data: None,
                },
            )
            .unwrap();

        let all = journal.get_all(&conn).unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].data.is_none());
    }

    #[test]
    fn remove_is_idempotent() {
        let (conn, journal) = setup();
        journal
            .add(
                &conn,
                JournalEntry {
                    table_name: "products".into(),
                    row_id: "1".into(),
                    hlc: hlc(1),
                    is_full_row: true,
                    data: None,
                },
            )
            .unwrap();

        journal.remove(&conn, &[("products".into(), "1".into())]).unwrap();
        journal.remove(&conn, &[("products".into(), "1".into())]).unwrap();
        assert!(journal.get_all(&conn).unwrap().is_empty());
    }

    #[tokio::test]
    async fn subscribers_each_receive_every_add() {
        let (conn, journal) = setup();
        let mut rx1 = journal.subscribe();
        let mut rx2 = journal.subscribe();

        journal
            .add(
                &conn,
                JournalEntry {
                    table_name: "products".into(),
                    row_id: "1".into(),
                    hlc: hlc(1),
                    is_full_row: true,
                    data: None,
                },
            )
            .unwrap();

        assert_eq!(rx1.recv().await.unwrap().row_id, "1");
        assert_eq!(rx2.recv().await.unwrap().row_id, "1");
    }
}
