use crate::error::RelationError;
use crate::model::{
    value_dict, ColumnAttribute, ColumnAttributes, ColumnNames, DataType, Handle, Handles,
    Identifier, Value, ValueDict,
};
use crate::store::{BTreeIndex, DbIndex, DbRelation, HeapTable, Store};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

pub const TABLES_TABLE: &str = "_tables";
pub const COLUMNS_TABLE: &str = "_columns";
pub const INDICES_TABLE: &str = "_indices";

pub fn is_schema_table(name: &str) -> bool {
    matches!(name, TABLES_TABLE | COLUMNS_TABLE | INDICES_TABLE)
}

fn schema_of(columns: &[(&str, DataType)]) -> (ColumnNames, ColumnAttributes) {
    columns
        .iter()
        .map(|(name, ty)| (name.to_string(), ColumnAttribute::new(*ty)))
        .unzip()
}

fn tables_schema() -> (ColumnNames, ColumnAttributes) {
    schema_of(&[("table_name", DataType::Text)])
}

fn columns_schema() -> (ColumnNames, ColumnAttributes) {
    schema_of(&[
        ("table_name", DataType::Text),
        ("column_name", DataType::Text),
        ("data_type", DataType::Text),
    ])
}

fn indices_schema() -> (ColumnNames, ColumnAttributes) {
    schema_of(&[
        ("table_name", DataType::Text),
        ("index_name", DataType::Text),
        ("seq_in_index", DataType::Int),
        ("column_name", DataType::Text),
        ("index_type", DataType::Text),
        ("is_unique", DataType::Boolean),
    ])
}

/// Creates the catalog relations and the rows describing them.
///
/// `_tables` and `_columns` are created first and their own rows are the first
/// ones written. Safe to call on an already initialized environment.
pub fn initialize_schema_tables(store: &Store) -> Result<(), RelationError> {
    let tables = Tables::new(store.clone());

    if !store.relation_exists(TABLES_TABLE)? {
        tables.relation.create()?;
        tables.columns.create_if_not_exists()?;
        describe_table(&tables, TABLES_TABLE, &tables_schema())?;
        describe_table(&tables, COLUMNS_TABLE, &columns_schema())?;
        info!("bootstrapped {TABLES_TABLE} and {COLUMNS_TABLE}");
    }

    if !store.relation_exists(INDICES_TABLE)? {
        let (names, attrs) = indices_schema();
        HeapTable::new(store.clone(), INDICES_TABLE, names.clone(), attrs.clone()).create()?;
        describe_table(&tables, INDICES_TABLE, &(names, attrs))?;
        info!("bootstrapped {INDICES_TABLE}");
    }
    Ok(())
}

fn describe_table(
    tables: &Tables,
    table_name: &str,
    (names, attrs): &(ColumnNames, ColumnAttributes),
) -> Result<(), RelationError> {
    tables.insert(&value_dict([("table_name", table_name)]))?;
    for (name, attr) in names.iter().zip(attrs) {
        tables.columns.insert(&value_dict([
            ("table_name", table_name),
            ("column_name", name.as_str()),
            ("data_type", attr.data_type.as_str()),
        ]))?;
    }
    Ok(())
}

/// A catalog relation: a heap table that refuses duplicate keys.
pub struct SchemaRelation {
    relation: HeapTable,
    unique_key: &'static [&'static str],
    validate: Option<fn(&ValueDict) -> Result<(), RelationError>>,
}

impl SchemaRelation {
    fn new(
        store: Store,
        name: &str,
        (names, attrs): (ColumnNames, ColumnAttributes),
        unique_key: &'static [&'static str],
    ) -> Self {
        Self {
            relation: HeapTable::new(store, name, names, attrs),
            unique_key,
            validate: None,
        }
    }

    fn with_validation(mut self, validate: fn(&ValueDict) -> Result<(), RelationError>) -> Self {
        self.validate = Some(validate);
        self
    }
}

fn validate_column_row(row: &ValueDict) -> Result<(), RelationError> {
    match row.get("data_type").and_then(Value::as_str) {
        Some(name) if DataType::parse(name).is_some() => Ok(()),
        Some(name) => Err(RelationError::Invalid(format!("unknown data type: {name}"))),
        None => Err(RelationError::Invalid("column row needs a data_type".into())),
    }
}

impl DbRelation for SchemaRelation {
    fn table_name(&self) -> &str {
        self.relation.table_name()
    }

    fn column_names(&self) -> &[Identifier] {
        self.relation.column_names()
    }

    fn column_attributes(&self) -> &[ColumnAttribute] {
        self.relation.column_attributes()
    }

    fn create(&self) -> Result<(), RelationError> {
        self.relation.create()
    }

    fn create_if_not_exists(&self) -> Result<(), RelationError> {
        self.relation.create_if_not_exists()
    }

    fn drop_relation(&self) -> Result<(), RelationError> {
        self.relation.drop_relation()
    }

    fn insert(&self, row: &ValueDict) -> Result<Handle, RelationError> {
        if let Some(validate) = self.validate {
            validate(row)?;
        }
        let key = self
            .unique_key
            .iter()
            .map(|column| {
                row.get(*column)
                    .map(|v| (column.to_string(), v.clone()))
                    .ok_or_else(|| {
                        RelationError::Invalid(format!(
                            "{} row needs {column}",
                            self.relation.table_name()
                        ))
                    })
            })
            .collect::<Result<ValueDict, RelationError>>()?;
        if !self.relation.select(Some(&key))?.is_empty() {
            let shown: Vec<String> = key.values().map(|v| v.to_string()).collect();
            return Err(RelationError::Invalid(format!(
                "duplicate key in {}: {}",
                self.relation.table_name(),
                shown.join(", ")
            )));
        }
        self.relation.insert(row)
    }

    fn del(&self, handle: Handle) -> Result<(), RelationError> {
        self.relation.del(handle)
    }

    fn select(&self, filter: Option<&ValueDict>) -> Result<Handles, RelationError> {
        self.relation.select(filter)
    }

    fn project(
        &self,
        handle: Handle,
        columns: Option<&[Identifier]>,
    ) -> Result<ValueDict, RelationError> {
        self.relation.project(handle, columns)
    }
}

macro_rules! delegate_relation {
    ($ty:ty) => {
        impl DbRelation for $ty {
            fn table_name(&self) -> &str {
                self.relation.table_name()
            }

            fn column_names(&self) -> &[Identifier] {
                self.relation.column_names()
            }

            fn column_attributes(&self) -> &[ColumnAttribute] {
                self.relation.column_attributes()
            }

            fn create(&self) -> Result<(), RelationError> {
                self.relation.create()
            }

            fn create_if_not_exists(&self) -> Result<(), RelationError> {
                self.relation.create_if_not_exists()
            }

            fn drop_relation(&self) -> Result<(), RelationError> {
                self.relation.drop_relation()
            }

            fn insert(&self, row: &ValueDict) -> Result<Handle, RelationError> {
                self.relation.insert(row)
            }

            fn del(&self, handle: Handle) -> Result<(), RelationError> {
                self.relation.del(handle)
            }

            fn select(&self, filter: Option<&ValueDict>) -> Result<Handles, RelationError> {
                self.relation.select(filter)
            }

            fn project(
                &self,
                handle: Handle,
                columns: Option<&[Identifier]>,
            ) -> Result<ValueDict, RelationError> {
                self.relation.project(handle, columns)
            }
        }
    };
}

/// Accessor for `_tables`; also resolves table names to their relations.
pub struct Tables {
    store: Store,
    relation: Arc<SchemaRelation>,
    columns: Arc<SchemaRelation>,
    cache: Mutex<HashMap<Identifier, Arc<dyn DbRelation>>>,
}

delegate_relation!(Tables);

impl Tables {
    pub fn new(store: Store) -> Self {
        let relation =
            SchemaRelation::new(store.clone(), TABLES_TABLE, tables_schema(), &["table_name"]);
        let columns = SchemaRelation::new(
            store.clone(),
            COLUMNS_TABLE,
            columns_schema(),
            &["table_name", "column_name"],
        )
        .with_validation(validate_column_row);
        Self {
            store,
            relation: Arc::new(relation),
            columns: Arc::new(columns),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Whether `_tables` has a row for `table_name`.
    pub fn contains(&self, table_name: &str) -> Result<bool, RelationError> {
        Ok(self.find(table_name)?.is_some())
    }

    pub fn find(&self, table_name: &str) -> Result<Option<Handle>, RelationError> {
        let filter = value_dict([("table_name", table_name)]);
        Ok(self.relation.select(Some(&filter))?.into_iter().next())
    }

    /// Declared schema of `table_name`, read from `_columns` in declaration order.
    pub fn get_columns(
        &self,
        table_name: &str,
    ) -> Result<(ColumnNames, ColumnAttributes), RelationError> {
        let filter = value_dict([("table_name", table_name)]);
        let wanted = ["column_name".to_string(), "data_type".to_string()];
        let mut names = Vec::new();
        let mut attrs = Vec::new();
        for handle in self.columns.select(Some(&filter))? {
            let row = self.columns.project(handle, Some(wanted.as_slice()))?;
            let name = row
                .get("column_name")
                .and_then(Value::as_str)
                .ok_or_else(|| RelationError::Corrupt(format!("column row of {table_name}")))?;
            let data_type = row
                .get("data_type")
                .and_then(Value::as_str)
                .and_then(DataType::parse)
                .ok_or_else(|| {
                    RelationError::Corrupt(format!("data type of {table_name}.{name}"))
                })?;
            names.push(name.to_string());
            attrs.push(ColumnAttribute::new(data_type));
        }
        Ok((names, attrs))
    }

    /// The relation named `name`, built from its catalog schema.
    pub fn get_table(&self, name: &str) -> Result<Arc<dyn DbRelation>, RelationError> {
        match name {
            TABLES_TABLE => return Ok(self.relation.clone() as Arc<dyn DbRelation>),
            COLUMNS_TABLE => return Ok(self.columns.clone() as Arc<dyn DbRelation>),
            _ => {}
        }
        if let Some(table) = self.cache.lock().get(name) {
            return Ok(table.clone());
        }

        let (names, attrs) = self.get_columns(name)?;
        let known = !names.is_empty();
        let table: Arc<dyn DbRelation> =
            Arc::new(HeapTable::new(self.store.clone(), name, names, attrs));
        if known {
            self.cache.lock().insert(name.to_string(), table.clone());
        }
        Ok(table)
    }

    /// Forgets the cached relation for `name`; its schema may have changed.
    pub fn evict(&self, name: &str) {
        if self.cache.lock().remove(name).is_some() {
            debug!(table = name, "evicted cached relation");
        }
    }
}

/// Accessor for `_indices`.
pub struct Indices {
    store: Store,
    relation: Arc<SchemaRelation>,
}

delegate_relation!(Indices);

impl Indices {
    pub fn new(store: Store) -> Self {
        let relation = SchemaRelation::new(
            store.clone(),
            INDICES_TABLE,
            indices_schema(),
            &["table_name", "index_name", "seq_in_index"],
        );
        Self {
            store,
            relation: Arc::new(relation),
        }
    }

    /// Distinct index names on `table_name`, in creation order.
    pub fn get_index_names(&self, table_name: &str) -> Result<Vec<Identifier>, RelationError> {
        let filter = value_dict([("table_name", table_name)]);
        let wanted = ["index_name".to_string()];
        let mut out: Vec<Identifier> = Vec::new();
        for handle in self.relation.select(Some(&filter))? {
            let row = self.relation.project(handle, Some(wanted.as_slice()))?;
            if let Some(name) = row.get("index_name").and_then(Value::as_str) {
                if !out.iter().any(|n| n == name) {
                    out.push(name.to_string());
                }
            }
        }
        Ok(out)
    }

    pub fn contains(&self, table_name: &str, index_name: &str) -> Result<bool, RelationError> {
        let filter = value_dict([("table_name", table_name), ("index_name", index_name)]);
        Ok(!self.relation.select(Some(&filter))?.is_empty())
    }

    /// The physical index `index_name` on `table_name`, with key columns in sequence order.
    pub fn get_index(
        &self,
        tables: &Tables,
        table_name: &str,
        index_name: &str,
    ) -> Result<Arc<dyn DbIndex>, RelationError> {
        let filter = value_dict([("table_name", table_name), ("index_name", index_name)]);
        let handles = self.relation.select(Some(&filter))?;
        if handles.is_empty() {
            return Err(RelationError::NotFound(format!(
                "unknown index: {table_name}.{index_name}"
            )));
        }

        let mut parts = Vec::with_capacity(handles.len());
        let mut unique = false;
        for handle in handles {
            let row = self.relation.project(handle, None)?;
            let seq = row.get("seq_in_index").and_then(Value::as_i32);
            let column = row.get("column_name").and_then(Value::as_str);
            let (Some(seq), Some(column)) = (seq, column) else {
                return Err(RelationError::Corrupt(format!(
                    "index row of {table_name}.{index_name}"
                )));
            };
            unique = row.get("is_unique").and_then(Value::as_bool).unwrap_or(false);
            parts.push((seq, column.to_string()));
        }
        parts.sort_by_key(|(seq, _)| *seq);
        let key_columns = parts.into_iter().map(|(_, column)| column).collect();

        let relation = tables.get_table(table_name)?;
        Ok(Arc::new(BTreeIndex::new(
            self.store.clone(),
            relation,
            index_name,
            key_columns,
            unique,
        )))
    }
}

/// Owned catalog accessors shared by every statement of one execution context.
pub struct Catalog {
    pub tables: Tables,
    pub indices: Indices,
}

impl Catalog {
    /// Opens the accessors over an environment already passed through
    /// [`initialize_schema_tables`].
    pub fn open(store: &Store) -> Result<Self, RelationError> {
        for name in [TABLES_TABLE, COLUMNS_TABLE, INDICES_TABLE] {
            if !store.relation_exists(name)? {
                return Err(RelationError::NoSuchRelation(name.to_string()));
            }
        }
        Ok(Self {
            tables: Tables::new(store.clone()),
            indices: Indices::new(store.clone()),
        })
    }

    pub fn get_index(
        &self,
        table_name: &str,
        index_name: &str,
    ) -> Result<Arc<dyn DbIndex>, RelationError> {
        self.indices.get_index(&self.tables, table_name, index_name)
    }
}
