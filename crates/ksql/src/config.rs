//! Client configuration

use std::time::Duration;

pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;
pub const DEFAULT_MAX_PENDING_ACKS: usize = 10_000;
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server root, e.g. `http://localhost:8088`
    pub base_url: String,
    /// Applies to buffered requests only; streams live until closed
    pub request_timeout: Option<Duration>,
    /// Speak HTTP/2 without upgrade negotiation
    pub http2_prior_knowledge: bool,
    /// How long close waits for the rest of a response body
    pub drain_timeout: Duration,
    /// Longest accepted line in a delimited body
    pub max_frame_bytes: usize,
    /// Unclaimed acks, and rows whose writer stopped waiting, kept before the
    /// oldest is dropped. Rows a writer is waiting on never count.
    pub max_pending_acks: usize,
    /// Encoded rows buffered ahead of the request body
    pub outbound_capacity: usize,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            request_timeout: None,
            http2_prior_knowledge: false,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            max_pending_acks: DEFAULT_MAX_PENDING_ACKS,
            outbound_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn with_http2_prior_knowledge(mut self, enabled: bool) -> Self {
        self.http2_prior_knowledge = enabled;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn with_max_frame_bytes(mut self, bytes: usize) -> Self {
        self.max_frame_bytes = bytes;
        self
    }

    pub fn with_max_pending_acks(mut self, max: usize) -> Self {
        self.max_pending_acks = max;
        self
    }

    pub fn with_outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity;
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new("http://localhost:8088")
    }
}
