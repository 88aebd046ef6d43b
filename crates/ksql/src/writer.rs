//! Writer half of an `/inserts-stream` request
//!
//! Each row is sent as one JSON line on the request body and implicitly
//! numbered from 0 in send order. [`InsertsStream::write_json`] returns only
//! once the server has acknowledged that row, or the wait fails.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use log::{debug, info};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::ack::{AckCorrelator, AckWaiter, read_acks};
use crate::config::ClientConfig;
use crate::context::Context;
use crate::error::{KsqlError, Result};
use crate::frames::FrameStream;

pub(crate) struct WriterShared {
    target: String,
    /// `None` once closed, which ends the request body
    outbound: tokio::sync::Mutex<Option<mpsc::Sender<Bytes>>>,
    next_seq: AtomicU64,
    correlator: Arc<AckCorrelator>,
    closed: AtomicBool,
    shutdown: CancellationToken,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl WriterShared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.cancel();
        self.outbound.lock().await.take();

        let reader = match self.reader.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(reader) = reader {
            if let Err(e) = reader.await {
                debug!("ack reader failed: {}", e);
            }
        }
        info!(
            "inserts stream to {} closed after {} rows",
            self.target,
            self.next_seq.load(Ordering::SeqCst)
        );
        Ok(())
    }

    /// Queue `line` on the request body. The ack waiter is registered before
    /// the row can reach the server.
    async fn send(&self, ctx: &Context, line: Bytes) -> Result<AckWaiter> {
        let outbound = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Err(KsqlError::StreamClosed),
            cause = ctx.done() => return Err(KsqlError::Cancelled(cause)),
            guard = self.outbound.lock() => guard,
        };
        let Some(sink) = &*outbound else {
            return Err(KsqlError::StreamClosed);
        };
        let permit = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Err(KsqlError::StreamClosed),
            cause = ctx.done() => return Err(KsqlError::Cancelled(cause)),
            permit = sink.reserve() => permit.map_err(|_| KsqlError::StreamClosed)?,
        };
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let waiter = self.correlator.register(seq);
        permit.send(line);
        Ok(waiter)
    }
}

impl Drop for WriterShared {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Row writer for one insert target.
///
/// Clones share the stream. Concurrent writers are allowed; each waits for
/// its own row's ack.
#[derive(Clone)]
pub struct InsertsStream {
    shared: Arc<WriterShared>,
}

impl InsertsStream {
    /// Start reading acks from `frames`. `outbound` feeds the request body and
    /// must already carry the target line.
    pub fn start(
        target: impl Into<String>,
        outbound: mpsc::Sender<Bytes>,
        frames: FrameStream,
        config: &ClientConfig,
    ) -> Self {
        let target = target.into();
        let shutdown = CancellationToken::new();
        let correlator = Arc::new(AckCorrelator::new(config.max_pending_acks));
        let reader = tokio::spawn(read_acks(
            frames,
            Arc::clone(&correlator),
            shutdown.clone(),
            config.drain_timeout,
        ));
        info!("inserts stream to {} opened", target);

        Self {
            shared: Arc::new(WriterShared {
                target,
                outbound: tokio::sync::Mutex::new(Some(outbound)),
                next_seq: AtomicU64::new(0),
                correlator,
                closed: AtomicBool::new(false),
                shutdown,
                reader: Mutex::new(Some(reader)),
            }),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<WriterShared> {
        &self.shared
    }

    /// Send one row and wait for the server to acknowledge it.
    ///
    /// A row that fails to encode is not sent and takes no sequence number.
    /// When `ctx` fires after the row went out, the row may still be inserted.
    pub async fn write_json<T>(&self, ctx: &Context, row: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let shared = &self.shared;
        if let Some(cause) = ctx.err() {
            return Err(KsqlError::Cancelled(cause));
        }
        if shared.is_closed() {
            return Err(KsqlError::StreamClosed);
        }

        let mut line = serde_json::to_vec(row).map_err(KsqlError::Encode)?;
        line.push(b'\n');
        let waiter = shared.send(ctx, Bytes::from(line)).await?;
        debug!("row {} sent to {}", waiter.seq(), shared.target);
        waiter.wait(ctx, &shared.shutdown).await
    }

    /// End the request body and release the stream. Idempotent.
    ///
    /// Writers still waiting for acks fail with `StreamClosed`.
    pub async fn close(&self) -> Result<()> {
        self.shared.close().await
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub fn target(&self) -> &str {
        &self.shared.target
    }

    /// Rows sent so far, which is also the sequence number of the next row.
    pub fn next_seq(&self) -> u64 {
        self.shared.next_seq.load(Ordering::SeqCst)
    }

    /// Acks that arrived with no writer waiting for them.
    pub fn pending_acks(&self) -> usize {
        self.shared.correlator.pending()
    }
}
