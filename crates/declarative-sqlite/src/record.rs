//! Record snapshot: a row's data plus modification bookkeeping (spec.md
//! §3 "Record", §4.7, §9 "replace deep inheritance with tagged records").
//!
//! Grounded on `ah-local-db`'s per-table `*Record` structs, generalized into
//! one dynamic-but-typed record so CRUD authorization is decided in one
//! place (`RecordKind`) instead of a type hierarchy.

use std::sync::Arc;

use crate::error::{Error, Result, UpdateErrorKind};
use crate::hlc::Hlc;
use crate::schema::{is_system_column, Schema, SYSTEM_ID, SYSTEM_IS_LOCAL_ORIGIN, SYSTEM_VERSION};
use crate::value::{RowValues, Value};
use crate::write::Writer;

/// What authorizes mutation on this record (spec.md §9 "tagged records"
/// replacing a source-language class hierarchy).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordKind {
    /// Read straight from a table: mutation targets that table.
    Table(String),
    /// Read from a view or ad-hoc query with no `forUpdate` declaration:
    /// read-only.
    View,
    /// Read from a query declared `forUpdate(target_table)`.
    ForUpdate(String),
}

/// A row snapshot plus the set of columns changed since the last save
/// (spec.md §3 "Record").
#[derive(Debug, Clone)]
pub struct Record {
    kind: RecordKind,
    data: RowValues,
    modified: std::collections::BTreeSet<String>,
    writer: Arc<Writer>,
}

impl Record {
    pub(crate) fn new(kind: RecordKind, data: RowValues, writer: Arc<Writer>) -> Self {
        Record {
            kind,
            data,
            modified: std::collections::BTreeSet::new(),
            writer,
        }
    }

    pub fn table_name(&self) -> Option<&str> {
        match &self.kind {
            RecordKind::Table(t) | RecordKind::ForUpdate(t) => Some(t),
            RecordKind::View => None,
        }
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self.kind, RecordKind::View)
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.data.get(column)
    }

    pub fn data(&self) -> &RowValues {
        &self.data
    }

    pub fn is_local_origin(&self) -> bool {
        matches!(
            self.data.get(SYSTEM_IS_LOCAL_ORIGIN),
            Some(Value::Integer(1))
        )
    }

    pub fn system_id(&self) -> Option<&str> {
        self.data.get(SYSTEM_ID).and_then(Value::as_text)
    }

    fn modifiable_table(&self) -> Result<&str> {
        match &self.kind {
            RecordKind::Table(t) | RecordKind::ForUpdate(t) => Ok(t),
            RecordKind::View => Err(Error::permission_denied(
                "<view>",
                "record is read-only: query was not declared forUpdate",
            )),
        }
    }

    /// Sets `column` to `value` in the in-memory snapshot (spec.md §4.7
    /// "Setters"). A matching `X__hlc` shadow column is synthesized for LWW
    /// columns; non-LWW columns on remote-origin rows are rejected.
    pub fn set_value(&mut self, schema: &Schema, column: &str, value: impl Into<Value>) -> Result<()> {
        let table_name = self.modifiable_table()?.to_owned();
        let table = schema
            .find_table(&table_name)
            .ok_or_else(|| Error::schema(format!("unknown table `{table_name}`")))?;
        let col = table.find_column(column).ok_or_else(|| {
            Error::Update {
                table: table_name.clone(),
                column: Some(column.to_owned()),
                kind: UpdateErrorKind::InvalidData,
                source: None,
            }
        })?;

        if !col.lww && !self.is_local_origin() {
            return Err(Error::permission_denied(
                &table_name,
                format!("column `{column}` is not LWW and this row is remote-origin"),
            ));
        }

        let value = value.into();
        if col.lww {
            let hlc = self.writer.clock().now();
            self.data
                .insert(crate::schema::hlc_shadow_column_name(column), Value::Text(hlc.to_string()));
        }
        self.data.insert(column.to_owned(), value);
        self.modified.insert(column.to_owned());
        Ok(())
    }

    /// Persists every modified column (plus LWW shadows) via an update keyed
    /// by `system_id` (spec.md §4.7 "save()").
    pub async fn save(&mut self) -> Result<()> {
        if self.modified.is_empty() {
            return Ok(());
        }
        let table_name = self.modifiable_table()?.to_owned();
        let system_id = self
            .system_id()
            .ok_or_else(|| Error::not_found(&table_name))?
            .to_owned();

        let mut values = RowValues::new();
        for column in &self.modified {
            if let Some(v) = self.data.get(column) {
                values.insert(column.clone(), v.clone());
            }
            let shadow = crate::schema::hlc_shadow_column_name(column);
            if let Some(v) = self.data.get(&shadow) {
                values.insert(shadow, v.clone());
            }
        }

        let new_version = self
            .writer
            .update_by_system_id(&table_name, &system_id, values)
            .await?;
        self.data
            .insert(SYSTEM_VERSION.to_owned(), Value::Text(new_version.to_string()));
        self.modified.clear();
        Ok(())
    }

    /// Deletes this row keyed by `system_id` (spec.md §4.7 "delete()").
    pub async fn delete(&self) -> Result<()> {
        let table_name = self.modifiable_table()?.to_owned();
        let system_id = self
            .system_id()
            .ok_or_else(|| Error::not_found(&table_name))?
            .to_owned();
        self.writer.delete_by_system_id(&table_name, &system_id).await
    }

    /// Re-reads the current row by `system_id`, replacing the snapshot.
    /// Fails with not-found if the row no longer exists (spec.md §4.7
    /// "reload()", §8 scenario 6). The modified set is left untouched on
    /// failure.
    pub async fn reload(&mut self) -> Result<()> {
        let table_name = self.modifiable_table()?.to_owned();
        let system_id = self
            .system_id()
            .ok_or_else(|| Error::not_found(&table_name))?
            .to_owned();
        let fresh = self.writer.read_by_system_id(&table_name, &system_id).await?;
        self.data = fresh;
        Ok(())
    }

    pub fn version(&self) -> Option<Hlc> {
        self.data
            .get(SYSTEM_VERSION)
            .and_then(Value::as_text)
            .and_then(|s| s.parse().ok())
    }
}

/// `true` for every key that is a system or LWW-shadow column, used by
/// callers building maps for display that want to hide library bookkeeping.
pub fn is_bookkeeping_column(name: &str) -> bool {
    is_system_column(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Column, StorageType, Table};

    fn schema() -> Schema {
        Schema::new().table(
            Table::new("products")
                .column(Column::new("name", StorageType::Text).lww())
                .column(Column::new("stock", StorageType::Integer)),
        )
    }

    fn row(local_origin: bool) -> RowValues {
        let mut data = RowValues::new();
        data.insert(SYSTEM_ID.to_owned(), Value::Text("sid-1".into()));
        data.insert(
            SYSTEM_IS_LOCAL_ORIGIN.to_owned(),
            Value::Integer(if local_origin { 1 } else { 0 }),
        );
        data.insert("name".to_owned(), Value::Text("Original".into()));
        data.insert("stock".to_owned(), Value::Integer(10));
        data
    }

    #[test]
    fn setting_non_lww_column_on_remote_origin_row_is_rejected() {
        crate::hlc::reset_for_testing();
        let writer = Arc::new(Writer::for_testing());
        let mut record = Record::new(RecordKind::Table("products".into()), row(false), writer);
        let err = record.set_value(&schema(), "stock", 99).unwrap_err();
        assert!(matches!(err, Error::PermissionDenied { .. }));
    }

    #[test]
    fn setting_lww_column_synthesizes_shadow_hlc() {
        crate::hlc::reset_for_testing();
        let writer = Arc::new(Writer::for_testing());
        let mut record = Record::new(RecordKind::Table("products".into()), row(false), writer);
        record.set_value(&schema(), "name", "Updated").unwrap();
        assert_eq!(record.get("name").unwrap().as_text(), Some("Updated"));
        assert!(record.get("name__hlc").is_some());
        assert!(record.modified.contains("name"));
    }

    #[test]
    fn view_records_reject_any_mutation() {
        let writer = Arc::new(Writer::for_testing());
        let mut record = Record::new(RecordKind::View, row(true), writer);
        let err = record.set_value(&schema(), "name", "x").unwrap_err();
        assert!(matches!(err, Error::PermissionDenied { .. }));
    }
}
