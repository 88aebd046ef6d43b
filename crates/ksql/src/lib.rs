//! ksqlDB client - statements, buffered and streaming queries, inserts
//!
//! This crate provides:
//! - A REST client over a pluggable [`Transport`]
//! - A cancellable row cursor for `/query-stream`
//! - An inserts stream writer that waits for per-row acks, matched by
//!   sequence number in whatever order the server sends them

pub mod ack;
pub mod client;
pub mod columns;
pub mod config;
pub mod context;
pub mod cursor;
pub mod error;
pub mod frames;
pub mod properties;
pub mod protocol;
pub mod rows;
pub mod statement;
pub mod transport;
pub mod writer;

pub use client::Client;
pub use columns::{Columns, Row};
pub use config::ClientConfig;
pub use context::{CancelCause, Context};
pub use cursor::QueryStream;
pub use error::{KsqlError, Result};
pub use properties::StreamsProperties;
pub use protocol::{
    ExecPayload, ExecResult, InsertAck, QueryPayload, QueryStreamHeader, QueryStreamPayload,
    TerminateClusterPayload,
};
pub use rows::QueryRows;
pub use statement::{Params, build_statement};
pub use transport::{HttpTransport, Route, Transport};
pub use writer::InsertsStream;
