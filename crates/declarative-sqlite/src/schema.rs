//! Declarative schema model: the shape a caller describes and the
//! reconciler (`migrate.rs`) drives the live database toward (spec.md §3).

use std::fmt;
use std::sync::Arc;

/// The four SQLite storage classes we model explicitly (NULL is a value
/// state, not a storage type, and is controlled via [`Column::nullable`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    Integer,
    Real,
    Text,
    Blob,
}

impl StorageType {
    pub fn sql_type_name(self) -> &'static str {
        match self {
            StorageType::Integer => "INTEGER",
            StorageType::Real => "REAL",
            StorageType::Text => "TEXT",
            StorageType::Blob => "BLOB",
        }
    }
}

/// A logical overlay on top of a storage type, used by the write path and
/// record layer to serialize/deserialize richer values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalType {
    Guid,
    Date,
    Fileset,
}

/// A default value applied on insert when the caller omits the column.
#[derive(Clone)]
pub enum DefaultValue {
    Static(crate::value::Value),
    Callback(Arc<dyn Fn() -> crate::value::Value + Send + Sync>),
}

impl fmt::Debug for DefaultValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefaultValue::Static(v) => f.debug_tuple("Static").field(v).finish(),
            DefaultValue::Callback(_) => f.write_str("Callback(..)"),
        }
    }
}

impl DefaultValue {
    pub fn resolve(&self) -> crate::value::Value {
        match self {
            DefaultValue::Static(v) => v.clone(),
            DefaultValue::Callback(f) => f(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub storage_type: StorageType,
    pub logical_type: Option<LogicalType>,
    pub nullable: bool,
    pub default: Option<DefaultValue>,
    /// Marks this column as subject to last-writer-wins conflict
    /// resolution; a shadow `{name}__hlc` column is maintained alongside it.
    pub lww: bool,
    /// Marks this column as a foreign-key parent reference for cascade
    /// traversal bookkeeping (spec.md §9 "cyclic graphs").
    pub parent: bool,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
}

impl Column {
    pub fn new(name: impl Into<String>, storage_type: StorageType) -> Self {
        Column {
            name: name.into(),
            storage_type,
            logical_type: None,
            nullable: true,
            default: None,
            lww: false,
            parent: false,
            min_length: None,
            max_length: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn lww(mut self) -> Self {
        self.lww = true;
        self
    }

    pub fn parent(mut self) -> Self {
        self.parent = true;
        self
    }

    pub fn logical(mut self, logical_type: LogicalType) -> Self {
        self.logical_type = Some(logical_type);
        self
    }

    pub fn default_value(mut self, value: impl Into<crate::value::Value>) -> Self {
        self.default = Some(DefaultValue::Static(value.into()));
        self
    }

    pub fn default_callback<F>(mut self, f: F) -> Self
    where
        F: Fn() -> crate::value::Value + Send + Sync + 'static,
    {
        self.default = Some(DefaultValue::Callback(Arc::new(f)));
        self
    }

    pub fn min_length(mut self, min: usize) -> Self {
        self.min_length = Some(min);
        self
    }

    pub fn max_length(mut self, max: usize) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Name of this column's HLC shadow column, if it is LWW.
    pub fn hlc_shadow_name(&self) -> Option<String> {
        self.lww.then(|| hlc_shadow_column_name(&self.name))
    }
}

/// Name of the shadow column tracking the HLC of the last accepted write to
/// LWW column `name`.
pub fn hlc_shadow_column_name(name: &str) -> String {
    format!("{name}__hlc")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadePolicy {
    Restrict,
    Cascade,
}

#[derive(Debug, Clone)]
pub struct Reference {
    pub name: String,
    pub column: String,
    pub referenced_table: String,
    pub referenced_column: String,
    pub on_delete: CascadePolicy,
}

#[derive(Debug, Clone, Default)]
pub struct Keys {
    pub primary: Vec<String>,
    pub unique: Vec<Vec<String>>,
    pub indexed: Vec<Vec<String>>,
}

pub const SYSTEM_ID: &str = "system_id";
pub const SYSTEM_CREATED_AT: &str = "system_created_at";
pub const SYSTEM_VERSION: &str = "system_version";
pub const SYSTEM_IS_LOCAL_ORIGIN: &str = "system_is_local_origin";

/// The four columns added to every non-system user table (spec.md §3).
pub fn system_columns() -> Vec<Column> {
    vec![
        Column::new(SYSTEM_ID, StorageType::Text).not_null(),
        Column::new(SYSTEM_CREATED_AT, StorageType::Text).not_null(),
        Column::new(SYSTEM_VERSION, StorageType::Text).not_null(),
        Column::new(SYSTEM_IS_LOCAL_ORIGIN, StorageType::Integer).not_null(),
    ]
}

pub fn is_system_column(name: &str) -> bool {
    matches!(
        name,
        SYSTEM_ID | SYSTEM_CREATED_AT | SYSTEM_VERSION | SYSTEM_IS_LOCAL_ORIGIN
    ) || name.ends_with("__hlc")
}

#[derive(Debug, Clone)]
pub struct Table {
    pub name: String,
    pub columns: Vec<Column>,
    pub keys: Keys,
    pub references: Vec<Reference>,
    /// Library-internal tables (e.g. the dirty journal, `__files`,
    /// `sync_server_timestamps`) are not augmented with system/LWW columns.
    pub is_system: bool,
}

impl Table {
    pub fn new(name: impl Into<String>) -> Self {
        Table {
            name: name.into(),
            columns: Vec::new(),
            keys: Keys::default(),
            references: Vec::new(),
            is_system: false,
        }
    }

    pub fn system(mut self) -> Self {
        self.is_system = true;
        self
    }

    pub fn column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    pub fn primary_key(mut self, columns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.keys.primary = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn unique(mut self, columns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.keys.unique.push(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn indexed(mut self, columns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.keys.indexed.push(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn reference(mut self, reference: Reference) -> Self {
        self.references.push(reference);
        self
    }

    pub fn find_column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn lww_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| c.lww)
    }

    /// The full column set this table should have in the live database:
    /// declared user columns, then system columns (for non-system tables),
    /// then one `{col}__hlc` shadow per LWW column (spec.md §4.2 ordering).
    pub fn all_columns(&self) -> Vec<Column> {
        let mut all = self.columns.clone();
        if !self.is_system {
            all.extend(system_columns());
            for lww in self.lww_columns().cloned().collect::<Vec<_>>() {
                all.push(
                    Column::new(hlc_shadow_column_name(&lww.name), StorageType::Text).nullable_shadow(),
                );
            }
        }
        all
    }
}

impl Column {
    /// HLC shadow columns are nullable (absent until the first write to
    /// their LWW column) but otherwise plain text columns.
    fn nullable_shadow(mut self) -> Self {
        self.nullable = true;
        self
    }
}

#[derive(Debug, Clone)]
pub struct View {
    pub name: String,
    pub sql: String,
    /// Structured column list, used by the dependency analyzer instead of
    /// parsing `sql` (spec.md §1 non-goals: "not SQL strings").
    pub columns: Vec<String>,
    /// Tables (or other views) this view reads from, for transitive
    /// dependency expansion.
    pub source_tables: Vec<String>,
}

impl View {
    pub fn new(name: impl Into<String>, sql: impl Into<String>) -> Self {
        View {
            name: name.into(),
            sql: sql.into(),
            columns: Vec::new(),
            source_tables: Vec::new(),
        }
    }

    pub fn columns(mut self, columns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn reads(mut self, tables: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.source_tables = tables.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct Schema {
    pub tables: Vec<Table>,
    pub views: Vec<View>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(mut self, table: Table) -> Self {
        self.tables.push(table);
        self
    }

    pub fn view(mut self, view: View) -> Self {
        self.views.push(view);
        self
    }

    pub fn find_table(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn find_view(&self, name: &str) -> Option<&View> {
        self.views.iter().find(|v| v.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn all_columns_appends_system_then_lww_shadows() {
        let table = Table::new("products")
            .column(Column::new("name", StorageType::Text).lww())
            .column(Column::new("stock", StorageType::Integer));

        let all = table.all_columns();
        let names: Vec<_> = all.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "name",
                "stock",
                SYSTEM_ID,
                SYSTEM_CREATED_AT,
                SYSTEM_VERSION,
                SYSTEM_IS_LOCAL_ORIGIN,
                "name__hlc",
            ]
        );
    }

    #[test]
    fn system_tables_are_not_augmented() {
        let table = Table::new("sync_server_timestamps").system();
        assert_eq!(table.all_columns().len(), 0);
    }

    #[test]
    fn default_value_resolves_static_and_callback() {
        let static_default = DefaultValue::Static(Value::Integer(7));
        assert_eq!(static_default.resolve(), Value::Integer(7));

        let callback_default = DefaultValue::Callback(Arc::new(|| Value::Text("generated".into())));
        assert_eq!(callback_default.resolve(), Value::Text("generated".into()));
    }
}
