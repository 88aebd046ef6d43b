//! Acknowledgement correlation for the inserts stream
//!
//! The server acknowledges inserted rows by sequence number, not necessarily
//! in the order they were sent. Every writer registers its sequence number
//! with the [`AckCorrelator`] before the row goes out and then waits on its
//! own one-shot. The reader task hands each decoded ack straight to the
//! writer waiting for it, and parks acks nobody has registered for yet.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use log::{debug, warn};
use serde::Deserialize;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::context::Context;
use crate::error::{KsqlError, Result};
use crate::frames::{self, FrameStream};
use crate::protocol::{ErrorMessage, InsertAck};

#[derive(Deserialize)]
#[serde(untagged)]
enum AckFrame {
    Ack(InsertAck),
    Error(ErrorMessage),
}

/// Ack lines carry no HTTP status of their own
const NO_ERROR_CODE: i64 = 0;

fn decode_ack(line: &str) -> Result<InsertAck> {
    match serde_json::from_str(line)? {
        AckFrame::Ack(ack) => Ok(ack),
        AckFrame::Error(err) => Err(err.into_error(NO_ERROR_CODE)),
    }
}

type AckReply = oneshot::Sender<Result<InsertAck>>;

#[derive(Default)]
struct AckState {
    /// Acks that arrived before anyone registered for them
    parked: BTreeMap<u64, InsertAck>,
    waiters: HashMap<u64, AckReply>,
    /// Rows whose writer stopped waiting before the ack came in
    abandoned: BTreeSet<u64>,
    /// Reader failure not yet handed to a writer
    failure: Option<KsqlError>,
    terminated: bool,
}

/// Matches acks to the sequence numbers waiting on them.
///
/// Shared by the reader task and every writer of one inserts stream. The
/// lock is never held across an await.
pub struct AckCorrelator {
    state: Mutex<AckState>,
    parked: AtomicUsize,
    max_pending: usize,
}

impl AckCorrelator {
    /// `max_pending` bounds both the parked acks and the abandoned rows.
    pub fn new(max_pending: usize) -> Self {
        Self {
            state: Mutex::new(AckState::default()),
            parked: AtomicUsize::new(0),
            max_pending: max_pending.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AckState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acks received but not yet claimed.
    pub fn pending(&self) -> usize {
        self.parked.load(Ordering::SeqCst)
    }

    /// Start waiting for the ack of `seq`. Call before the row is sent.
    pub fn register(self: &Arc<Self>, seq: u64) -> AckWaiter {
        let (reply, rx) = oneshot::channel();
        let mut state = self.lock();
        if let Some(ack) = state.parked.remove(&seq) {
            self.parked.store(state.parked.len(), Ordering::SeqCst);
            let _ = reply.send(Ok(ack));
        } else if state.terminated {
            let err = state.failure.take().unwrap_or(KsqlError::StreamClosed);
            let _ = reply.send(Err(err));
        } else {
            state.waiters.insert(seq, reply);
        }
        drop(state);

        AckWaiter {
            seq,
            rx,
            correlator: Arc::clone(self),
        }
    }

    /// Hand `ack` to its writer, drop it if the writer gave up, or park it.
    pub fn deliver(&self, ack: InsertAck) {
        let seq = ack.seq;
        debug!("ack {} received ({})", seq, ack.status);
        let mut state = self.lock();
        if let Some(reply) = state.waiters.remove(&seq) {
            if reply.send(Ok(ack)).is_err() {
                debug!("writer for row {} went away", seq);
            }
            return;
        }
        if state.abandoned.remove(&seq) {
            debug!("discarding ack for abandoned row {}", seq);
            return;
        }

        state.parked.insert(seq, ack);
        while state.parked.len() > self.max_pending {
            if let Some((oldest, _)) = state.parked.pop_first() {
                warn!("dropping unclaimed ack for row {}", oldest);
            }
        }
        self.parked.store(state.parked.len(), Ordering::SeqCst);
    }

    /// Forget the waiter for `seq`; its ack is discarded when it arrives.
    fn abandon(&self, seq: u64) {
        let mut state = self.lock();
        if state.waiters.remove(&seq).is_none() || state.terminated {
            return;
        }
        state.abandoned.insert(seq);
        while state.abandoned.len() > self.max_pending {
            if let Some(oldest) = state.abandoned.pop_first() {
                warn!("forgetting abandoned row {}", oldest);
            }
        }
    }

    /// No more acks will arrive. The lowest waiting row gets `failure`, the
    /// rest get `StreamClosed`. Parked acks stay claimable.
    pub fn terminate(&self, failure: Option<KsqlError>) {
        let mut state = self.lock();
        if state.terminated {
            return;
        }
        state.terminated = true;
        state.abandoned.clear();

        let mut waiters: Vec<_> = state.waiters.drain().collect();
        waiters.sort_unstable_by_key(|(seq, _)| *seq);
        let mut failure = failure;
        for (_, reply) in waiters {
            let _ = reply.send(Err(failure.take().unwrap_or(KsqlError::StreamClosed)));
        }
        state.failure = failure;
    }
}

fn resolve(ack: InsertAck) -> Result<()> {
    if ack.is_ok() {
        Ok(())
    } else {
        Err(KsqlError::AckNotOk {
            seq: ack.seq,
            status: ack.status,
            message: ack.message,
        })
    }
}

/// One writer's claim on the ack for its row. Dropping it unresolved marks
/// the row abandoned.
pub struct AckWaiter {
    seq: u64,
    rx: oneshot::Receiver<Result<InsertAck>>,
    correlator: Arc<AckCorrelator>,
}

impl AckWaiter {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Wait for the ack.
    ///
    /// Fails with `AckNotOk` for a negative ack, with the reader's error if
    /// the ack stream broke, `StreamClosed` once the stream is closed or has
    /// ended, and `Cancelled` when `ctx` fires first.
    pub async fn wait(mut self, ctx: &Context, shutdown: &CancellationToken) -> Result<()> {
        tokio::select! {
            biased;
            received = &mut self.rx => match received {
                Ok(Ok(ack)) => resolve(ack),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(KsqlError::StreamClosed),
            },
            _ = shutdown.cancelled() => Err(KsqlError::StreamClosed),
            cause = ctx.done() => Err(KsqlError::Cancelled(cause)),
        }
    }
}

impl Drop for AckWaiter {
    fn drop(&mut self) {
        self.correlator.abandon(self.seq);
    }
}

/// Decode ack lines until the stream ends, fails, or `shutdown` fires.
///
/// A failure terminates the correlator with that error. After shutdown the
/// rest of the body is drained for up to `drain_timeout`.
pub async fn read_acks(
    mut frames: FrameStream,
    correlator: Arc<AckCorrelator>,
    shutdown: CancellationToken,
    drain_timeout: Duration,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            frame = frames.next() => frame,
        };
        let ack = match frame {
            Some(Ok(line)) => decode_ack(&line),
            Some(Err(e)) => Err(e),
            None => {
                debug!("ack stream ended by server");
                correlator.terminate(None);
                return;
            }
        };
        match ack {
            Ok(ack) => correlator.deliver(ack),
            Err(e) => {
                debug!("ack stream failed: {}", e);
                correlator.terminate(Some(e));
                return;
            }
        }
    }

    correlator.terminate(None);
    let discarded = frames::drain(&mut frames, drain_timeout).await;
    debug!("drained {} ack frames after close", discarded);
}
