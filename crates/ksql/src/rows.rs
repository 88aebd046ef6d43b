//! Buffered rows of a `/query` response

use std::collections::VecDeque;

use log::debug;
use serde::Deserialize;
use serde::de::Error as _;
use serde_json::Value;

use crate::columns::{Columns, Row};
use crate::error::{KsqlError, Result};
use crate::protocol::ErrorMessage;

const UNKNOWN_ERROR: &str = "an unknown error occurred";

#[derive(Debug, Deserialize)]
struct StaticHeader {
    #[serde(default)]
    schema: String,
    #[serde(default, rename = "queryId")]
    query_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RowColumns {
    columns: Row,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Entry {
    Header {
        header: StaticHeader,
    },
    Row {
        row: RowColumns,
    },
    Final {
        #[serde(rename = "finalMessage")]
        final_message: Value,
    },
    Error {
        #[serde(rename = "errorMessage")]
        error_message: Value,
    },
}

fn entry_error(value: Value) -> KsqlError {
    match serde_json::from_value::<ErrorMessage>(value.clone()) {
        Ok(err) => err.into_error(0),
        Err(_) => KsqlError::Server {
            code: 0,
            message: match value {
                Value::String(message) => message,
                other => other.to_string(),
            },
        },
    }
}

/// Rows of a static query, already fully received.
#[derive(Debug)]
pub struct QueryRows {
    columns: Columns,
    query_id: Option<String>,
    entries: VecDeque<Entry>,
    closed: bool,
}

impl QueryRows {
    /// Parse a `/query` body.
    ///
    /// An object body is the server rejecting the statement. An array starts
    /// with a header entry when the server knows the schema.
    pub fn parse(body: &[u8]) -> Result<Self> {
        let items = match serde_json::from_slice::<Value>(body)? {
            Value::Object(obj) => {
                let message = obj
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or(UNKNOWN_ERROR);
                return Err(KsqlError::Statement {
                    message: message.to_string(),
                });
            }
            Value::Array(items) => items,
            other => {
                return Err(KsqlError::Decode(serde_json::Error::custom(format!(
                    "expected an array of query results, got {}",
                    other
                ))));
            }
        };

        let mut entries = items
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<VecDeque<Entry>, _>>()?;

        let (columns, query_id) = match entries.front() {
            Some(Entry::Header { .. }) => match entries.pop_front() {
                Some(Entry::Header { header }) => {
                    (Columns::from_schema(&header.schema), header.query_id)
                }
                _ => (Columns::unknown(), None),
            },
            _ => (Columns::unknown(), None),
        };

        Ok(Self {
            columns,
            query_id,
            entries,
            closed: false,
        })
    }

    pub fn columns(&self) -> &Columns {
        &self.columns
    }

    pub fn query_id(&self) -> Option<&str> {
        self.query_id.as_deref()
    }

    /// Rows not yet read, including trailing status entries.
    pub fn remaining(&self) -> usize {
        self.entries.len()
    }

    /// Copy the next row into `dest`. Returns `Ok(false)` when none are left.
    pub fn next(&mut self, dest: &mut Row) -> Result<bool> {
        if self.closed {
            return Err(KsqlError::StreamClosed);
        }
        while let Some(entry) = self.entries.pop_front() {
            match entry {
                Entry::Row { row } => {
                    self.columns.validate(&row.columns)?;
                    *dest = row.columns;
                    return Ok(true);
                }
                Entry::Error { error_message } => return Err(entry_error(error_message)),
                Entry::Final { final_message } => debug!("query finished: {}", final_message),
                Entry::Header { .. } => continue,
            }
        }
        Ok(false)
    }

    /// Drop any unread rows. Idempotent.
    pub fn close(&mut self) {
        self.closed = true;
        self.entries.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
