use crate::model::{ColumnAttributes, ColumnNames, Value, ValueDicts};
use std::fmt;

/// Outcome of one executed statement. Owns everything it carries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub column_names: Option<ColumnNames>,
    pub column_attributes: Option<ColumnAttributes>,
    pub rows: Option<ValueDicts>,
    pub message: String,
}

impl QueryResult {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn with_rows(
        column_names: ColumnNames,
        column_attributes: ColumnAttributes,
        rows: ValueDicts,
        message: impl Into<String>,
    ) -> Self {
        Self {
            column_names: Some(column_names),
            column_attributes: Some(column_attributes),
            rows: Some(rows),
            message: message.into(),
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.as_ref().map_or(0, Vec::len)
    }
}

impl fmt::Display for QueryResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(names) = &self.column_names {
            for name in names {
                write!(f, "{name} ")?;
            }
            writeln!(f)?;
            write!(f, "+")?;
            for _ in names {
                write!(f, "----------+")?;
            }
            writeln!(f)?;
            for row in self.rows.iter().flatten() {
                for name in names {
                    let value = row.get(name).unwrap_or(&Value::Null);
                    write!(f, "{value} ")?;
                }
                writeln!(f)?;
            }
        }
        write!(f, "{}", self.message)
    }
}
