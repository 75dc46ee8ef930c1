use crate::error::RelationError;
use crate::model::{
    value_dict, ColumnAttribute, ColumnAttributes, ColumnNames, DataType, Handle, Handles,
    Identifier, Value, ValueDict,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sled::IVec;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

/// Records are numbered per relation and grouped into logical blocks of this size.
pub const RECORDS_PER_BLOCK: u64 = 64;

/// The storage environment: one sled database holding every relation and index.
#[derive(Clone)]
pub struct Store {
    db: sled::Db,
    relations: sled::Tree,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RelationError> {
        let db = sled::open(path)?;
        let relations = db.open_tree("relations")?;
        Ok(Self { db, relations })
    }

    pub fn relation_exists(&self, name: &str) -> Result<bool, RelationError> {
        Ok(self.relations.contains_key(Self::relation_key(name))?)
    }

    pub fn create_relation(&self, name: &str) -> Result<(), RelationError> {
        check_identifier(name)?;
        let key = Self::relation_key(name);
        if self.relations.contains_key(&key)? {
            return Err(RelationError::AlreadyExists(name.to_string()));
        }
        self.relations.insert(key, IVec::from(&b""[..]))?;
        self.flush()?;
        debug!(relation = name, "created relation");
        Ok(())
    }

    pub fn drop_relation(&self, name: &str) -> Result<(), RelationError> {
        let key = Self::relation_key(name);
        if !self.relations.contains_key(&key)? {
            return Err(RelationError::NoSuchRelation(name.to_string()));
        }
        self.db.drop_tree(Self::data_tree_name(name))?;
        self.relations.remove(key)?;
        self.relations.remove(Self::seq_key(name))?;
        self.flush()?;
        debug!(relation = name, "dropped relation");
        Ok(())
    }

    pub fn index_exists(&self, table: &str, index: &str) -> Result<bool, RelationError> {
        Ok(self.relations.contains_key(Self::index_key(table, index))?)
    }

    fn create_index_tree(&self, table: &str, index: &str) -> Result<(), RelationError> {
        check_identifier(index)?;
        let key = Self::index_key(table, index);
        if self.relations.contains_key(&key)? {
            return Err(RelationError::AlreadyExists(format!("{table}.{index}")));
        }
        self.relations.insert(key, IVec::from(&b""[..]))?;
        self.flush()?;
        Ok(())
    }

    fn drop_index_tree(&self, table: &str, index: &str) -> Result<(), RelationError> {
        let key = Self::index_key(table, index);
        if !self.relations.contains_key(&key)? {
            return Err(RelationError::NoSuchRelation(format!("{table}.{index}")));
        }
        self.db.drop_tree(Self::index_tree_name(table, index))?;
        self.relations.remove(key)?;
        self.flush()?;
        Ok(())
    }

    fn data_tree(&self, name: &str) -> Result<sled::Tree, RelationError> {
        if !self.relation_exists(name)? {
            return Err(RelationError::NoSuchRelation(name.to_string()));
        }
        Ok(self.db.open_tree(Self::data_tree_name(name))?)
    }

    fn index_tree(&self, table: &str, index: &str) -> Result<sled::Tree, RelationError> {
        if !self.index_exists(table, index)? {
            return Err(RelationError::NoSuchRelation(format!("{table}.{index}")));
        }
        Ok(self.db.open_tree(Self::index_tree_name(table, index))?)
    }

    fn allocate_handle(&self, name: &str) -> Result<Handle, RelationError> {
        let key = Self::seq_key(name);
        let next = self
            .relations
            .update_and_fetch(key, |old| {
                let cur = old.and_then(decode_u64).unwrap_or(0);
                Some(cur.saturating_add(1).to_be_bytes().to_vec())
            })?
            .ok_or_else(|| RelationError::Invalid("record counter update failed".into()))?;
        let seq = decode_u64(&next)
            .ok_or_else(|| RelationError::Corrupt(format!("record counter of {name}")))?
            .saturating_sub(1);
        let block_id = u32::try_from(seq / RECORDS_PER_BLOCK)
            .map_err(|_| RelationError::Invalid(format!("relation {name} is full")))?;
        let record_id = (seq % RECORDS_PER_BLOCK) as u16;
        Ok(Handle {
            block_id,
            record_id,
        })
    }

    pub fn flush(&self) -> Result<(), RelationError> {
        self.db.flush()?;
        Ok(())
    }

    /// Runs a scratch relation through create/insert/select/project/del/drop.
    pub fn self_test(&self) -> Result<bool, RelationError> {
        const NAME: &str = "_test_heap";
        if self.relation_exists(NAME)? {
            self.drop_relation(NAME)?;
        }
        let table = HeapTable::new(
            self.clone(),
            NAME,
            vec!["a".into(), "b".into()],
            vec![
                ColumnAttribute::new(DataType::Int),
                ColumnAttribute::new(DataType::Text),
            ],
        );
        table.create()?;
        let outcome = exercise_heap_table(&table);
        let dropped = table.drop_relation();
        let passed = outcome?;
        dropped?;
        Ok(passed)
    }

    fn relation_key(name: &str) -> Vec<u8> {
        let mut k = Vec::with_capacity(2 + name.len());
        k.extend_from_slice(b"r\0");
        k.extend_from_slice(name.as_bytes());
        k
    }

    fn seq_key(name: &str) -> Vec<u8> {
        let mut k = Vec::with_capacity(4 + name.len());
        k.extend_from_slice(b"seq\0");
        k.extend_from_slice(name.as_bytes());
        k
    }

    fn index_key(table: &str, index: &str) -> Vec<u8> {
        let mut k = Vec::new();
        k.extend_from_slice(b"i\0");
        k.extend_from_slice(table.as_bytes());
        k.push(0);
        k.extend_from_slice(index.as_bytes());
        k
    }

    fn data_tree_name(name: &str) -> Vec<u8> {
        let mut k = Vec::new();
        k.extend_from_slice(b"rel\0");
        k.extend_from_slice(name.as_bytes());
        k
    }

    fn index_tree_name(table: &str, index: &str) -> Vec<u8> {
        let mut k = Vec::new();
        k.extend_from_slice(b"idx\0");
        k.extend_from_slice(table.as_bytes());
        k.push(0);
        k.extend_from_slice(index.as_bytes());
        k
    }
}

fn exercise_heap_table(table: &HeapTable) -> Result<bool, RelationError> {
    let first = value_dict([("a", Value::Int(12)), ("b", "Hello!".into())]);
    let second = value_dict([
        ("a", Value::Int(-192)),
        ("b", "Much longer piece of text here".into()),
    ]);
    let h1 = table.insert(&first)?;
    let h2 = table.insert(&second)?;
    if h1 == h2 || table.select(None)?.len() != 2 {
        return Ok(false);
    }
    let filter = value_dict([("a", Value::Int(-192))]);
    if table.select(Some(&filter))? != vec![h2] {
        return Ok(false);
    }
    if table.project(h1, None)? != first {
        return Ok(false);
    }
    table.del(h1)?;
    Ok(table.select(None)? == vec![h2])
}

fn check_identifier(name: &str) -> Result<(), RelationError> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid identifier regex")
    });
    if re.is_match(name) {
        Ok(())
    } else {
        Err(RelationError::Invalid(format!("invalid identifier: {name:?}")))
    }
}

fn decode_u64(bytes: &[u8]) -> Option<u64> {
    let raw: [u8; 8] = bytes.try_into().ok()?;
    Some(u64::from_be_bytes(raw))
}

fn handle_key(handle: Handle) -> [u8; 6] {
    let mut k = [0u8; 6];
    k[..4].copy_from_slice(&handle.block_id.to_be_bytes());
    k[4..].copy_from_slice(&handle.record_id.to_be_bytes());
    k
}

fn parse_handle(key: &[u8]) -> Result<Handle, RelationError> {
    if key.len() != 6 {
        return Err(RelationError::Corrupt("record key".into()));
    }
    let block: [u8; 4] = key[..4]
        .try_into()
        .map_err(|_| RelationError::Corrupt("record key".into()))?;
    let record: [u8; 2] = key[4..]
        .try_into()
        .map_err(|_| RelationError::Corrupt("record key".into()))?;
    Ok(Handle {
        block_id: u32::from_be_bytes(block),
        record_id: u16::from_be_bytes(record),
    })
}

/// What the executor needs from any named relation, user table or catalog.
pub trait DbRelation: Send + Sync {
    fn table_name(&self) -> &str;

    fn column_names(&self) -> &[Identifier];

    fn column_attributes(&self) -> &[ColumnAttribute];

    /// Fails if the relation already exists.
    fn create(&self) -> Result<(), RelationError>;

    fn create_if_not_exists(&self) -> Result<(), RelationError>;

    fn drop_relation(&self) -> Result<(), RelationError>;

    fn insert(&self, row: &ValueDict) -> Result<Handle, RelationError>;

    fn del(&self, handle: Handle) -> Result<(), RelationError>;

    /// Handles of rows matching every `(column, value)` pair of `filter`, in insertion order.
    fn select(&self, filter: Option<&ValueDict>) -> Result<Handles, RelationError>;

    /// Materializes `columns` (all declared columns when `None`) of one row.
    fn project(
        &self,
        handle: Handle,
        columns: Option<&[Identifier]>,
    ) -> Result<ValueDict, RelationError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredRow {
    /// Values aligned to the relation's declared columns.
    values: Vec<Value>,
}

/// A relation whose rows live unordered in one sled tree.
#[derive(Clone)]
pub struct HeapTable {
    store: Store,
    name: Identifier,
    column_names: ColumnNames,
    column_attributes: ColumnAttributes,
}

impl HeapTable {
    pub fn new(
        store: Store,
        name: impl Into<Identifier>,
        column_names: ColumnNames,
        column_attributes: ColumnAttributes,
    ) -> Self {
        Self {
            store,
            name: name.into(),
            column_names,
            column_attributes,
        }
    }

    fn column_index(&self, column: &str) -> Result<usize, RelationError> {
        self.column_names
            .iter()
            .position(|c| c == column)
            .ok_or_else(|| RelationError::Invalid(format!("unknown column: {}.{column}", self.name)))
    }

    fn validate(&self, row: &ValueDict) -> Result<Vec<Value>, RelationError> {
        let mut values = Vec::with_capacity(self.column_names.len());
        for (column, attr) in self.column_names.iter().zip(&self.column_attributes) {
            let value = row.get(column).ok_or_else(|| {
                RelationError::Invalid(format!(
                    "missing value for {}.{column}: NULLs and defaults are not supported",
                    self.name
                ))
            })?;
            if value.data_type() != Some(attr.data_type) {
                return Err(RelationError::Invalid(format!(
                    "{}.{column} expects {}, got {value}",
                    self.name, attr.data_type
                )));
            }
            values.push(value.clone());
        }
        Ok(values)
    }

    fn decode(&self, bytes: &[u8]) -> Result<StoredRow, RelationError> {
        let row: StoredRow = bincode::deserialize(bytes)?;
        if row.values.len() != self.column_names.len() {
            return Err(RelationError::Corrupt(format!(
                "row of {} has {} values, expected {}",
                self.name,
                row.values.len(),
                self.column_names.len()
            )));
        }
        Ok(row)
    }
}

impl DbRelation for HeapTable {
    fn table_name(&self) -> &str {
        &self.name
    }

    fn column_names(&self) -> &[Identifier] {
        &self.column_names
    }

    fn column_attributes(&self) -> &[ColumnAttribute] {
        &self.column_attributes
    }

    fn create(&self) -> Result<(), RelationError> {
        self.store.create_relation(&self.name)
    }

    fn create_if_not_exists(&self) -> Result<(), RelationError> {
        if self.store.relation_exists(&self.name)? {
            return Ok(());
        }
        self.create()
    }

    fn drop_relation(&self) -> Result<(), RelationError> {
        self.store.drop_relation(&self.name)
    }

    fn insert(&self, row: &ValueDict) -> Result<Handle, RelationError> {
        let tree = self.store.data_tree(&self.name)?;
        let values = self.validate(row)?;
        let handle = self.store.allocate_handle(&self.name)?;
        tree.insert(handle_key(handle), bincode::serialize(&StoredRow { values })?)?;
        self.store.flush()?;
        Ok(handle)
    }

    fn del(&self, handle: Handle) -> Result<(), RelationError> {
        let tree = self.store.data_tree(&self.name)?;
        if tree.remove(handle_key(handle))?.is_none() {
            return Err(RelationError::NotFound(format!(
                "record {handle:?} in {}",
                self.name
            )));
        }
        self.store.flush()?;
        Ok(())
    }

    fn select(&self, filter: Option<&ValueDict>) -> Result<Handles, RelationError> {
        let tree = self.store.data_tree(&self.name)?;
        let positions = match filter {
            Some(filter) => filter
                .iter()
                .map(|(column, value)| Ok((self.column_index(column)?, value)))
                .collect::<Result<Vec<_>, RelationError>>()?,
            None => Vec::new(),
        };

        let mut out = Vec::new();
        for item in tree.iter() {
            let (k, v) = item?;
            if !positions.is_empty() {
                let row = self.decode(&v)?;
                if positions.iter().any(|(idx, value)| row.values[*idx] != **value) {
                    continue;
                }
            }
            out.push(parse_handle(&k)?);
        }
        Ok(out)
    }

    fn project(
        &self,
        handle: Handle,
        columns: Option<&[Identifier]>,
    ) -> Result<ValueDict, RelationError> {
        let tree = self.store.data_tree(&self.name)?;
        let Some(bytes) = tree.get(handle_key(handle))? else {
            return Err(RelationError::NotFound(format!(
                "record {handle:?} in {}",
                self.name
            )));
        };
        let row = self.decode(&bytes)?;
        let columns = columns.unwrap_or(self.column_names.as_slice());
        let mut out = ValueDict::new();
        for column in columns {
            let idx = self.column_index(column)?;
            out.insert(column.clone(), row.values[idx].clone());
        }
        Ok(out)
    }
}

/// Physical index contract.
pub trait DbIndex: Send + Sync {
    /// Materializes the index and fills it from the rows already in the relation.
    fn create(&self) -> Result<(), RelationError>;

    fn drop_index(&self) -> Result<(), RelationError>;

    fn lookup(&self, key: &ValueDict) -> Result<Handles, RelationError>;

    fn insert(&self, handle: Handle) -> Result<(), RelationError>;

    fn del(&self, handle: Handle) -> Result<(), RelationError>;
}

/// Ordered index over one relation. Entry keys are `bincode(key values) ++ handle`.
pub struct BTreeIndex {
    store: Store,
    relation: Arc<dyn DbRelation>,
    name: Identifier,
    key_columns: ColumnNames,
    unique: bool,
}

impl BTreeIndex {
    pub fn new(
        store: Store,
        relation: Arc<dyn DbRelation>,
        name: impl Into<Identifier>,
        key_columns: ColumnNames,
        unique: bool,
    ) -> Self {
        Self {
            store,
            relation,
            name: name.into(),
            key_columns,
            unique,
        }
    }

    fn key_prefix(&self, row: &ValueDict) -> Result<Vec<u8>, RelationError> {
        let key = self
            .key_columns
            .iter()
            .map(|column| {
                row.get(column).ok_or_else(|| {
                    RelationError::Invalid(format!("index {} needs column {column}", self.name))
                })
            })
            .collect::<Result<Vec<&Value>, RelationError>>()?;
        Ok(bincode::serialize(&key)?)
    }

    fn entry_key(&self, handle: Handle) -> Result<(Vec<u8>, Vec<u8>), RelationError> {
        let row = self.relation.project(handle, Some(self.key_columns.as_slice()))?;
        let prefix = self.key_prefix(&row)?;
        let mut key = prefix.clone();
        key.extend_from_slice(&handle_key(handle));
        Ok((prefix, key))
    }
}

impl DbIndex for BTreeIndex {
    fn create(&self) -> Result<(), RelationError> {
        let table = self.relation.table_name();
        self.store.create_index_tree(table, &self.name)?;
        let built = self
            .relation
            .select(None)
            .and_then(|handles| handles.into_iter().try_for_each(|h| self.insert(h)));
        if let Err(e) = built {
            if let Err(cleanup) = self.store.drop_index_tree(table, &self.name) {
                warn!(index = %self.name, error = %cleanup, "failed to remove partially built index");
            }
            return Err(e);
        }
        debug!(table, index = %self.name, "built index");
        Ok(())
    }

    fn drop_index(&self) -> Result<(), RelationError> {
        self.store
            .drop_index_tree(self.relation.table_name(), &self.name)
    }

    fn lookup(&self, key: &ValueDict) -> Result<Handles, RelationError> {
        let tree = self.store.index_tree(self.relation.table_name(), &self.name)?;
        let prefix = self.key_prefix(key)?;
        let mut out = Vec::new();
        for item in tree.scan_prefix(&prefix) {
            let (k, _v) = item?;
            out.push(parse_handle(&k[prefix.len()..])?);
        }
        Ok(out)
    }

    fn insert(&self, handle: Handle) -> Result<(), RelationError> {
        let tree = self.store.index_tree(self.relation.table_name(), &self.name)?;
        let (prefix, key) = self.entry_key(handle)?;
        if self.unique && tree.scan_prefix(&prefix).next().is_some() {
            return Err(RelationError::Invalid(format!(
                "duplicate key in unique index {}",
                self.name
            )));
        }
        tree.insert(key, IVec::from(&b""[..]))?;
        self.store.flush()?;
        Ok(())
    }

    fn del(&self, handle: Handle) -> Result<(), RelationError> {
        let tree = self.store.index_tree(self.relation.table_name(), &self.name)?;
        let (_prefix, key) = self.entry_key(handle)?;
        if tree.remove(key)?.is_none() {
            return Err(RelationError::NotFound(format!(
                "entry {handle:?} in index {}",
                self.name
            )));
        }
        self.store.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn people(store: &Store) -> HeapTable {
        HeapTable::new(
            store.clone(),
            "people",
            vec!["id".into(), "name".into()],
            vec![
                ColumnAttribute::new(DataType::Int),
                ColumnAttribute::new(DataType::Text),
            ],
        )
    }

    #[test]
    fn test_heap_table_flow() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let table = people(&store);

        assert!(matches!(
            table.insert(&value_dict([("id", Value::Int(1)), ("name", "x".into())])),
            Err(RelationError::NoSuchRelation(_))
        ));

        table.create().unwrap();
        assert!(matches!(table.create(), Err(RelationError::AlreadyExists(_))));
        table.create_if_not_exists().unwrap();

        let alice = value_dict([("id", Value::Int(1)), ("name", "Alice".into())]);
        let bob = value_dict([("id", Value::Int(2)), ("name", "Bob".into())]);
        let h1 = table.insert(&alice).unwrap();
        let h2 = table.insert(&bob).unwrap();
        assert_ne!(h1, h2);

        assert_eq!(table.select(None).unwrap(), vec![h1, h2]);
        let filter = value_dict([("name", "Bob")]);
        assert_eq!(table.select(Some(&filter)).unwrap(), vec![h2]);

        let names = vec!["name".to_string()];
        let projected = table.project(h1, Some(names.as_slice())).unwrap();
        assert_eq!(projected, value_dict([("name", "Alice")]));
        assert_eq!(table.project(h2, None).unwrap(), bob);

        table.del(h1).unwrap();
        assert!(matches!(table.del(h1), Err(RelationError::NotFound(_))));
        assert_eq!(table.select(None).unwrap(), vec![h2]);

        table.drop_relation().unwrap();
        assert!(!store.relation_exists("people").unwrap());
        assert!(matches!(
            table.drop_relation(),
            Err(RelationError::NoSuchRelation(_))
        ));
    }

    #[test]
    fn test_insert_validates_declared_columns() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let table = people(&store);
        table.create().unwrap();

        let missing = value_dict([("id", Value::Int(1))]);
        assert!(matches!(
            table.insert(&missing),
            Err(RelationError::Invalid(_))
        ));

        let wrong_type = value_dict([("id", "one"), ("name", "Alice")]);
        assert!(matches!(
            table.insert(&wrong_type),
            Err(RelationError::Invalid(_))
        ));

        let filter = value_dict([("age", Value::Int(3))]);
        assert!(matches!(
            table.select(Some(&filter)),
            Err(RelationError::Invalid(_))
        ));
        assert!(table.select(None).unwrap().is_empty());
    }

    #[test]
    fn test_handles_span_blocks_and_restart_after_drop() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let table = people(&store);
        table.create().unwrap();

        let mut handles = Vec::new();
        for i in 0..(RECORDS_PER_BLOCK as i32 + 2) {
            let row = value_dict([("id", Value::Int(i)), ("name", format!("p{i}").into())]);
            handles.push(table.insert(&row).unwrap());
        }
        assert_eq!(handles[0].block_id, 0);
        assert_eq!(handles[RECORDS_PER_BLOCK as usize].block_id, 1);
        assert_eq!(handles[RECORDS_PER_BLOCK as usize].record_id, 0);
        assert_eq!(table.select(None).unwrap(), handles);

        table.drop_relation().unwrap();
        table.create().unwrap();
        assert!(table.select(None).unwrap().is_empty());
        let h = table
            .insert(&value_dict([("id", Value::Int(9)), ("name", "again".into())]))
            .unwrap();
        assert_eq!(h, handles[0]);
    }

    #[test]
    fn test_invalid_relation_name_is_rejected() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        assert!(matches!(
            store.create_relation("bad name"),
            Err(RelationError::Invalid(_))
        ));
    }

    #[test]
    fn test_btree_index_lookup_and_unique() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let table = people(&store);
        table.create().unwrap();
        let h1 = table
            .insert(&value_dict([("id", Value::Int(1)), ("name", "Ann".into())]))
            .unwrap();
        let h2 = table
            .insert(&value_dict([("id", Value::Int(2)), ("name", "Ann".into())]))
            .unwrap();

        let relation: Arc<dyn DbRelation> = Arc::new(table.clone());
        let by_name = BTreeIndex::new(
            store.clone(),
            relation.clone(),
            "by_name",
            vec!["name".into()],
            false,
        );
        by_name.create().unwrap();
        let ann = value_dict([("name", "Ann")]);
        assert_eq!(by_name.lookup(&ann).unwrap(), vec![h1, h2]);
        assert!(by_name
            .lookup(&value_dict([("name", "Bo")]))
            .unwrap()
            .is_empty());

        by_name.del(h1).unwrap();
        assert_eq!(by_name.lookup(&ann).unwrap(), vec![h2]);
        by_name.drop_index().unwrap();
        assert!(!store.index_exists("people", "by_name").unwrap());

        let unique = BTreeIndex::new(
            store.clone(),
            relation,
            "uniq_name",
            vec!["name".into()],
            true,
        );
        assert!(matches!(unique.create(), Err(RelationError::Invalid(_))));
        assert!(!store.index_exists("people", "uniq_name").unwrap());
    }

    #[test]
    fn test_self_test_passes_and_cleans_up() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        assert!(store.self_test().unwrap());
        assert!(!store.relation_exists("_test_heap").unwrap());
        assert!(store.self_test().unwrap());
    }
}
