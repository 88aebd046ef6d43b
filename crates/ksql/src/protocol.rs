//! ksqlDB REST message types

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::KsqlError;
use crate::properties::StreamsProperties;

// ============ Requests ============

/// Body of `POST /ksql`. Anything but `SELECT` is allowed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecPayload {
    pub ksql: String,
    #[serde(default, skip_serializing_if = "StreamsProperties::is_empty")]
    pub streams_properties: StreamsProperties,
    /// Wait until this command sequence number has completed before running
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_sequence_number: Option<i64>,
}

impl ExecPayload {
    pub fn new(ksql: impl Into<String>) -> Self {
        Self {
            ksql: ksql.into(),
            ..Default::default()
        }
    }

    pub fn with_properties(mut self, properties: StreamsProperties) -> Self {
        self.streams_properties = properties;
        self
    }
}

/// Body of `POST /query`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryPayload {
    pub ksql: String,
    #[serde(default, skip_serializing_if = "StreamsProperties::is_empty")]
    pub streams_properties: StreamsProperties,
}

impl QueryPayload {
    pub fn new(ksql: impl Into<String>) -> Self {
        Self {
            ksql: ksql.into(),
            ..Default::default()
        }
    }

    pub fn with_properties(mut self, properties: StreamsProperties) -> Self {
        self.streams_properties = properties;
        self
    }
}

/// Body of `POST /query-stream`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryStreamPayload {
    pub sql: String,
    #[serde(default, skip_serializing_if = "StreamsProperties::is_empty")]
    pub properties: StreamsProperties,
}

impl QueryStreamPayload {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            ..Default::default()
        }
    }

    pub fn with_properties(mut self, properties: StreamsProperties) -> Self {
        self.properties = properties;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseQueryPayload {
    pub query_id: String,
}

/// First line of an inserts stream request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertsStreamTarget {
    pub target: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminateClusterPayload {
    /// Kafka topics to delete along with the cluster
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub delete_topic_list: Vec<String>,
}

// ============ Streaming frames ============

/// Header line of a `/query-stream` response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryStreamHeader {
    /// Present for push queries, which must be closed server-side
    #[serde(alias = "queryID", skip_serializing_if = "Option::is_none")]
    pub query_id: Option<String>,
    pub column_names: Vec<String>,
    pub column_types: Vec<String>,
}

/// Acknowledgement line of an inserts stream response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertAck {
    pub seq: u64,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<i64>,
}

impl InsertAck {
    pub fn ok(seq: u64) -> Self {
        Self {
            seq,
            status: "ok".into(),
            message: None,
            error_code: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// Error object returned by the server, either as a whole response body or
/// as a line inside a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessage {
    #[serde(rename = "@type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<i64>,
    pub message: String,
}

impl ErrorMessage {
    pub(crate) fn into_error(self, fallback_code: i64) -> KsqlError {
        KsqlError::Server {
            code: self.error_code.unwrap_or(fallback_code),
            message: self.message,
        }
    }
}

/// Map a non-success response body to an error, keeping the server's message
/// when the body is a JSON error object.
pub(crate) fn error_from_body(status: u16, body: &[u8]) -> KsqlError {
    match serde_json::from_slice::<ErrorMessage>(body) {
        Ok(err) => err.into_error(i64::from(status)),
        Err(_) => KsqlError::Server {
            code: i64::from(status),
            message: String::from_utf8_lossy(body).trim().to_string(),
        },
    }
}

// ============ /ksql results ============

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Warning {
    pub message: String,
}

/// Status of a CREATE, DROP or TERMINATE command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CommandStatus {
    /// One of QUEUED, PARSING, EXECUTING, TERMINATED, SUCCESS or ERROR
    pub status: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamInfo {
    pub name: String,
    pub topic: String,
    #[serde(alias = "valueFormat")]
    pub format: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TableInfo {
    pub name: String,
    pub topic: String,
    #[serde(alias = "valueFormat")]
    pub format: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub is_windowed: bool,
}

/// A persistent query running on the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunningQuery {
    pub query_string: String,
    pub sinks: Vec<String>,
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Schema {
    /// INTEGER, BIGINT, BOOLEAN, DOUBLE, STRING, MAP, ARRAY or STRUCT
    #[serde(rename = "type")]
    pub kind: String,
    /// Element/value schema for ARRAY and MAP
    #[serde(skip_serializing_if = "Option::is_none")]
    pub member_schema: Option<Box<Schema>>,
    /// Fields of a STRUCT
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<Field>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Field {
    pub name: String,
    pub schema: Schema,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SourceDescription {
    pub name: String,
    pub read_queries: Vec<RunningQuery>,
    pub write_queries: Vec<RunningQuery>,
    pub fields: Vec<Field>,
    /// STREAM or TABLE
    #[serde(rename = "type")]
    pub kind: String,
    pub key: String,
    pub timestamp: String,
    #[serde(alias = "valueFormat")]
    pub format: String,
    pub topic: String,
    pub extended: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub statistics: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error_stats: String,
    pub replication: u32,
    pub partitions: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryDescription {
    pub id: String,
    pub statement_text: String,
    pub fields: Vec<Field>,
    pub sources: Vec<String>,
    pub sinks: Vec<String>,
    pub execution_plan: String,
    pub topology: String,
}

/// One element of a `/ksql` response. Which of the optional sections is set
/// depends on the statement that produced it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecResult {
    #[serde(rename = "@type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub statement_text: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<Warning>,

    // CREATE, DROP, TERMINATE
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_status: Option<CommandStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_sequence_number: Option<i64>,

    // LIST / SHOW
    #[serde(skip_serializing_if = "Option::is_none")]
    pub streams: Option<Vec<StreamInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tables: Option<Vec<TableInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queries: Option<Vec<RunningQuery>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<BTreeMap<String, Value>>,

    // DESCRIBE
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_description: Option<SourceDescription>,

    // EXPLAIN
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_description: Option<QueryDescription>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overridden_properties: Option<BTreeMap<String, Value>>,
}

/// Decode a `/ksql` body, which may be an array of results or a lone result.
pub(crate) fn decode_exec_results(body: &[u8]) -> Result<Vec<ExecResult>, KsqlError> {
    if let Ok(results) = serde_json::from_slice::<Vec<ExecResult>>(body) {
        return Ok(results);
    }
    let single: ExecResult = serde_json::from_slice(body)?;
    Ok(vec![single])
}

// ============ Server status ============

/// Free-form `/info` response.
pub type ServerInfo = BTreeMap<String, Value>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Health {
    pub is_healthy: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthDetails {
    pub metastore: Health,
    pub kafka: Health,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthcheckResult {
    pub is_healthy: bool,
    pub details: HealthDetails,
}
