//! Error type shared by every client operation

use thiserror::Error;
use tokio_util::codec::LinesCodecError;

use crate::context::CancelCause;

pub type Result<T, E = KsqlError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum KsqlError {
    #[error("unexpected number of columns: expected {expected}, got {got}")]
    ColumnCountMismatch { expected: usize, got: usize },
    #[error("stream closed")]
    StreamClosed,
    #[error("ack for row {seq} was received but the status was '{status}'")]
    AckNotOk {
        seq: u64,
        status: String,
        message: Option<String>,
    },
    #[error("cancelled before completion: {0}")]
    Cancelled(#[from] CancelCause),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Frame error: {0}")]
    Frame(#[from] LinesCodecError),
    #[error("Invalid JSON: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("failed to encode row: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("statement rejected: {message}")]
    Statement { message: String },
    #[error("server error ({code}): {message}")]
    Server { code: i64, message: String },
    #[error("expected exactly one result, got {got}")]
    UnexpectedResultCount { got: usize },
    #[error("invalid base URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("statement is missing a trailing semi-colon")]
    MissingSemicolon,
    #[error("transport error: {0}")]
    Transport(String),
}

impl KsqlError {
    /// The cancellation cause, if this error came from a fired [`Context`](crate::Context).
    pub fn cancel_cause(&self) -> Option<CancelCause> {
        match self {
            KsqlError::Cancelled(cause) => Some(*cause),
            _ => None,
        }
    }

    pub fn is_stream_closed(&self) -> bool {
        matches!(self, KsqlError::StreamClosed)
    }
}
