//! Column contract for decoded rows

use serde_json::Value;

use crate::error::{KsqlError, Result};

/// One decoded row. Values keep the JSON shape the server sent.
pub type Row = Vec<Value>;

/// Expected shape of the rows of one result set.
///
/// Built once from a stream or query header and never changed afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Columns {
    /// `None` when the header carried no usable schema; rows are unchecked
    count: Option<usize>,
    names: Vec<String>,
}

impl Columns {
    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn new(count: usize, names: Vec<String>) -> Self {
        Self {
            count: Some(count),
            names,
        }
    }

    pub fn from_names(names: Vec<String>) -> Self {
        Self::new(names.len(), names)
    }

    /// Build from a static query header schema such as
    /// `` `ID` STRING KEY, `TOTAL` BIGINT ``.
    pub fn from_schema(schema: &str) -> Self {
        Self::from_names(parse_schema_keys(schema))
    }

    pub fn count(&self) -> Option<usize> {
        self.count
    }

    pub fn validate(&self, row: &[Value]) -> Result<()> {
        match self.count {
            Some(expected) if row.len() != expected => Err(KsqlError::ColumnCountMismatch {
                expected,
                got: row.len(),
            }),
            _ => Ok(()),
        }
    }

    /// Column names, always exactly `count` long when the count is known.
    ///
    /// Names that don't line up with the count are replaced by empty
    /// placeholders so callers can index by column position.
    pub fn names(&self) -> Vec<String> {
        match self.count {
            None => self.names.clone(),
            Some(count) if self.names.len() == count => self.names.clone(),
            Some(count) => vec![String::new(); count],
        }
    }
}

/// Extract the backtick-quoted column names of a schema string.
///
/// Only top-level names are returned; the field names of `STRUCT<...>`
/// columns are skipped.
pub fn parse_schema_keys(schema: &str) -> Vec<String> {
    let mut keys = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut depth = 0usize;

    for ch in schema.chars() {
        match ch {
            '`' => {
                if quoted && depth == 0 {
                    keys.push(std::mem::take(&mut current));
                }
                quoted = !quoted;
            }
            _ if quoted => {
                if depth == 0 {
                    current.push(ch);
                }
            }
            '<' => depth += 1,
            '>' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    keys
}
