use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub type Identifier = String;
pub type ColumnNames = Vec<Identifier>;
pub type ColumnAttributes = Vec<ColumnAttribute>;

/// One record's projected or full content, keyed by column name.
pub type ValueDict = BTreeMap<Identifier, Value>;
pub type ValueDicts = Vec<ValueDict>;
pub type Handles = Vec<Handle>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DataType {
    Int,
    Text,
    Boolean,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Int => "INT",
            DataType::Text => "TEXT",
            DataType::Boolean => "BOOLEAN",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "INT" => Some(DataType::Int),
            "TEXT" => Some(DataType::Text),
            "BOOLEAN" => Some(DataType::Boolean),
            _ => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnAttribute {
    pub data_type: DataType,
}

impl ColumnAttribute {
    pub fn new(data_type: DataType) -> Self {
        Self { data_type }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Value {
    #[default]
    Null,
    Int(i32),
    Text(String),
    Boolean(bool),
}

impl Value {
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Value::Null => None,
            Value::Int(_) => Some(DataType::Int),
            Value::Text(_) => Some(DataType::Text),
            Value::Boolean(_) => Some(DataType::Boolean),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Text(s) => write!(f, "\"{s}\""),
            Value::Boolean(b) => f.write_str(if *b { "true" } else { "false" }),
        }
    }
}

/// Storage-assigned address of one record inside the relation that issued it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle {
    pub(crate) block_id: u32,
    pub(crate) record_id: u16,
}

/// Builds a row from `(column, value)` pairs.
pub fn value_dict<I, K, V>(pairs: I) -> ValueDict
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<Identifier>,
    V: Into<Value>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}
