//! Row cursor over a `/query-stream` response
//!
//! The response body is owned by a decode task spawned when the stream
//! opens. [`QueryStream::next`] asks that task for one row through a one-shot
//! reply and races the answer against the stream's [`Context`]. Closing the
//! stream cancels the task, which answers any outstanding request with
//! [`KsqlError::StreamClosed`] and then drains what is left of the body.
//!
//! A `next` that loses its race to cancellation has already asked for a
//! frame. That frame is still consumed by the decode task and dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use futures::future::BoxFuture;
use log::{debug, info, warn};
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::columns::{Columns, Row};
use crate::context::Context;
use crate::error::{KsqlError, Result};
use crate::frames::{self, FrameStream};
use crate::protocol::{ErrorMessage, QueryStreamHeader};

/// Tells the server a push query is no longer wanted. Receives the query id.
pub type TerminateFn = Box<dyn FnOnce(String) -> BoxFuture<'static, Result<()>> + Send>;

type RowReply = oneshot::Sender<Result<Option<Row>>>;

#[derive(Deserialize)]
#[serde(untagged)]
enum HeaderFrame {
    Error(ErrorMessage),
    Header(QueryStreamHeader),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RowFrame {
    Row(Row),
    Error(ErrorMessage),
}

/// Error frames inside a 200 response may omit their code
const NO_ERROR_CODE: i64 = 0;

fn decode_header(line: &str) -> Result<QueryStreamHeader> {
    match serde_json::from_str(line)? {
        HeaderFrame::Header(header) => Ok(header),
        HeaderFrame::Error(err) => Err(err.into_error(NO_ERROR_CODE)),
    }
}

fn decode_row(line: &str) -> Result<Row> {
    match serde_json::from_str(line)? {
        RowFrame::Row(row) => Ok(row),
        RowFrame::Error(err) => Err(err.into_error(NO_ERROR_CODE)),
    }
}

fn columns_for(header: &QueryStreamHeader) -> Columns {
    match (header.column_names.len(), header.column_types.len()) {
        (0, 0) => Columns::unknown(),
        (_, 0) => Columns::from_names(header.column_names.clone()),
        (_, types) => Columns::new(types, header.column_names.clone()),
    }
}

pub(crate) struct CursorShared {
    header: QueryStreamHeader,
    columns: Columns,
    ctx: Context,
    closed: AtomicBool,
    shutdown: CancellationToken,
    requests: mpsc::Sender<RowReply>,
    task: Mutex<Option<JoinHandle<()>>>,
    terminate: Mutex<Option<TerminateFn>>,
}

impl CursorShared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.cancel();

        let task = take(&self.task);
        let notify = match (take(&self.terminate), self.header.query_id.clone()) {
            (Some(terminate), Some(query_id)) => Some(terminate(query_id)),
            _ => None,
        };

        let ((), notified) = futures::join!(
            async {
                if let Some(task) = task {
                    if let Err(e) = task.await {
                        debug!("decode task failed: {}", e);
                    }
                }
            },
            async {
                match notify {
                    Some(notify) => notify.await,
                    None => Ok(()),
                }
            }
        );
        info!("query stream {} closed", self.header.query_id.as_deref().unwrap_or("<pull>"));

        notified.map_err(|e| {
            warn!("failed to close query on server: {}", e);
            e
        })
    }
}

impl Drop for CursorShared {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn take<T>(slot: &Mutex<Option<T>>) -> Option<T> {
    match slot.lock() {
        Ok(mut guard) => guard.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    }
}

/// Cursor over the rows of a streaming query.
///
/// Cheap to clone; clones share one underlying stream, so `close` can be
/// called from a different task than the one reading.
#[derive(Clone)]
pub struct QueryStream {
    shared: Arc<CursorShared>,
}

impl QueryStream {
    /// Read the header frame and start the decode task.
    ///
    /// `terminate` is called on close when the header carried a query id.
    pub async fn open(
        ctx: Context,
        mut frames: FrameStream,
        drain_timeout: Duration,
        terminate: Option<TerminateFn>,
    ) -> Result<Self> {
        let first = ctx.run(async { frames.next().await.transpose() }).await?;
        let header = match first {
            Some(line) => decode_header(&line)?,
            None => return Err(KsqlError::StreamClosed),
        };
        let columns = columns_for(&header);
        info!(
            "query stream {} opened with {} columns",
            header.query_id.as_deref().unwrap_or("<pull>"),
            header.column_names.len()
        );

        let shutdown = CancellationToken::new();
        let (requests, requests_rx) = mpsc::channel(1);
        let task = tokio::spawn(decode_rows(frames, requests_rx, shutdown.clone(), drain_timeout));

        Ok(Self {
            shared: Arc::new(CursorShared {
                header,
                columns,
                ctx,
                closed: AtomicBool::new(false),
                shutdown,
                requests,
                task: Mutex::new(Some(task)),
                terminate: Mutex::new(terminate),
            }),
        })
    }

    pub(crate) fn shared(&self) -> &Arc<CursorShared> {
        &self.shared
    }

    /// Decode the next row into `dest`.
    ///
    /// Returns `Ok(false)` once the server has ended the stream. `dest` is
    /// only written when a row passes the column check.
    pub async fn next(&self, dest: &mut Row) -> Result<bool> {
        let shared = &self.shared;
        if let Some(cause) = shared.ctx.err() {
            return Err(KsqlError::Cancelled(cause));
        }
        if shared.is_closed() {
            return Err(KsqlError::StreamClosed);
        }

        let (reply, answer) = oneshot::channel();
        let row = async {
            if shared.requests.send(reply).await.is_err() {
                return Err(KsqlError::StreamClosed);
            }
            answer.await.unwrap_or(Err(KsqlError::StreamClosed))
        };

        let row = tokio::select! {
            biased;
            cause = shared.ctx.done() => return Err(KsqlError::Cancelled(cause)),
            row = row => row,
        };

        match row {
            Ok(Some(row)) => {
                shared.columns.validate(&row)?;
                *dest = row;
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(_) if shared.is_closed() => Err(KsqlError::StreamClosed),
            Err(e) => Err(e),
        }
    }

    /// Close the stream. Safe to call more than once and from any task.
    ///
    /// For push queries the server is told to stop the query. If that fails
    /// the error is returned, but the stream is released either way.
    pub async fn close(&self) -> Result<()> {
        self.shared.close().await
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub fn columns(&self) -> &Columns {
        &self.shared.columns
    }

    pub fn header(&self) -> &QueryStreamHeader {
        &self.shared.header
    }

    /// Set for push queries only.
    pub fn query_id(&self) -> Option<&str> {
        self.shared.header.query_id.as_deref()
    }
}

async fn decode_rows(
    mut frames: FrameStream,
    mut requests: mpsc::Receiver<RowReply>,
    shutdown: CancellationToken,
    drain_timeout: Duration,
) {
    let mut ended = false;
    loop {
        let reply = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            reply = requests.recv() => match reply {
                Some(reply) => reply,
                None => break,
            },
        };
        if ended {
            let _ = reply.send(Ok(None));
            continue;
        }

        let frame = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                let _ = reply.send(Err(KsqlError::StreamClosed));
                break;
            }
            frame = frames.next() => frame,
        };
        let out = match frame {
            Some(Ok(line)) => decode_row(&line).map(Some),
            Some(Err(e)) => {
                ended = true;
                Err(e)
            }
            None => {
                debug!("query stream ended by server");
                ended = true;
                Ok(None)
            }
        };
        if reply.send(out).is_err() {
            debug!("row dropped, reader gave up");
        }
    }

    if !ended {
        let discarded = frames::drain(&mut frames, drain_timeout).await;
        debug!("drained {} frames after close", discarded);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::AtomicUsize;

    use bytes::Bytes;
    use futures::FutureExt;
    use serde_json::json;
    use tokio_stream::wrappers::ReceiverStream;

    const HEADER: &str = r#"{"queryId":"q1","columnNames":["a","b","c"],"columnTypes":["INTEGER","STRING","BOOLEAN"]}"#;

    /// A frame stream fed by hand. Dropping the sender ends the body.
    fn body() -> (mpsc::Sender<io::Result<Bytes>>, FrameStream) {
        let (tx, rx) = mpsc::channel(16);
        let frames = frames::lines(ReceiverStream::new(rx).boxed(), 1024);
        (tx, frames)
    }

    async fn push(tx: &mpsc::Sender<io::Result<Bytes>>, line: &str) {
        tx.send(Ok(Bytes::from(format!("{}\n", line)))).await.unwrap();
    }

    async fn open(ctx: Context, lines: &[&str]) -> (mpsc::Sender<io::Result<Bytes>>, QueryStream) {
        let (tx, frames) = body();
        for line in lines {
            push(&tx, line).await;
        }
        let stream = QueryStream::open(ctx, frames, Duration::from_millis(50), None)
            .await
            .unwrap();
        (tx, stream)
    }

    #[tokio::test]
    async fn rows_arrive_in_order_then_block_until_cancelled() {
        let ctx = Context::background().child();
        let (_tx, stream) = open(
            ctx.clone(),
            &[HEADER, r#"[1,"x",true]"#, r#"[2,"y",false]"#],
        )
        .await;

        let mut row = Row::new();
        assert!(stream.next(&mut row).await.unwrap());
        assert_eq!(row, vec![json!(1), json!("x"), json!(true)]);
        assert!(stream.next(&mut row).await.unwrap());
        assert_eq!(row, vec![json!(2), json!("y"), json!(false)]);

        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });
        let result = tokio::time::timeout(Duration::from_secs(2), stream.next(&mut row))
            .await
            .expect("next should return once the context is cancelled");
        assert!(matches!(
            result,
            Err(KsqlError::Cancelled(crate::CancelCause::Cancelled))
        ));
        assert!(!stream.is_closed());
    }

    #[tokio::test]
    async fn next_after_close_is_stream_closed() {
        let (tx, stream) = open(Context::background(), &[HEADER, r#"[1,"x",true]"#]).await;

        let mut row = Row::new();
        assert!(stream.next(&mut row).await.unwrap());
        stream.close().await.unwrap();

        let _ = tx.send(Ok(Bytes::from_static(b"this is not json\n"))).await;
        assert!(matches!(
            stream.next(&mut row).await,
            Err(KsqlError::StreamClosed)
        ));
        assert_eq!(row, vec![json!(1), json!("x"), json!(true)]);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (_tx, stream) = open(Context::background(), &[HEADER]).await;
        stream.close().await.unwrap();
        stream.close().await.unwrap();
        assert!(stream.is_closed());
    }

    #[tokio::test]
    async fn close_wakes_a_blocked_next() {
        let (_tx, stream) = open(Context::background(), &[HEADER]).await;

        let reader = stream.clone();
        let pending = tokio::spawn(async move {
            let mut row = Row::new();
            reader.next(&mut row).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        stream.close().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), pending)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(KsqlError::StreamClosed)));
    }

    #[tokio::test]
    async fn end_of_body_reports_no_more_rows() {
        let (tx, stream) = open(Context::background(), &[HEADER, r#"[1,"x",true]"#]).await;
        drop(tx);

        let mut row = Row::new();
        assert!(stream.next(&mut row).await.unwrap());
        assert!(!stream.next(&mut row).await.unwrap());
        assert!(!stream.next(&mut row).await.unwrap());
    }

    #[tokio::test]
    async fn wrong_arity_row_is_rejected_and_dest_untouched() {
        let (_tx, stream) = open(Context::background(), &[HEADER, "[1,2]"]).await;

        let mut row = vec![json!("before")];
        match stream.next(&mut row).await {
            Err(KsqlError::ColumnCountMismatch { expected, got }) => {
                assert_eq!(expected, 3);
                assert_eq!(got, 2);
            }
            other => panic!("expected ColumnCountMismatch, got {:?}", other),
        }
        assert_eq!(row, vec![json!("before")]);
    }

    #[tokio::test]
    async fn error_frames_surface_as_server_errors() {
        let (_tx, stream) = open(
            Context::background(),
            &[HEADER, r#"{"@type":"generic_error","error_code":50000,"message":"boom"}"#],
        )
        .await;

        let mut row = Row::new();
        match stream.next(&mut row).await {
            Err(KsqlError::Server { code, message }) => {
                assert_eq!(code, 50000);
                assert_eq!(message, "boom");
            }
            other => panic!("expected Server error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn header_error_fails_open() {
        let (tx, frames) = body();
        push(&tx, r#"{"message":"line 1:1: mismatched input"}"#).await;
        let result = QueryStream::open(Context::background(), frames, Duration::from_millis(50), None).await;
        assert!(matches!(result, Err(KsqlError::Server { .. })));
    }

    #[tokio::test]
    async fn empty_body_fails_open() {
        let (tx, frames) = body();
        drop(tx);
        let result = QueryStream::open(Context::background(), frames, Duration::from_millis(50), None).await;
        assert!(matches!(result, Err(KsqlError::StreamClosed)));
    }

    #[tokio::test]
    async fn header_without_columns_leaves_rows_unchecked() {
        let (_tx, stream) = open(Context::background(), &[r#"{"queryId":null}"#, "[1]", "[1,2,3,4]"]).await;
        assert_eq!(stream.columns().count(), None);
        assert_eq!(stream.query_id(), None);

        let mut row = Row::new();
        assert!(stream.next(&mut row).await.unwrap());
        assert!(stream.next(&mut row).await.unwrap());
        assert_eq!(row.len(), 4);
    }

    #[tokio::test]
    async fn terminate_runs_once_for_push_queries() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let terminate: TerminateFn = Box::new(move |query_id: String| {
            async move {
                assert_eq!(query_id, "q1");
                seen.fetch_add(1, Ordering::SeqCst);
                Ok::<_, KsqlError>(())
            }
            .boxed()
        });

        let (tx, frames) = body();
        push(&tx, HEADER).await;
        let stream = QueryStream::open(Context::background(), frames, Duration::from_millis(50), Some(terminate))
            .await
            .unwrap();

        let (a, b) = futures::join!(stream.close(), stream.close());
        assert!(a.is_ok() && b.is_ok());
        stream.close().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn terminate_failure_is_reported_but_stream_is_released() {
        let terminate: TerminateFn = Box::new(|_query_id: String| {
            async { Err::<(), _>(KsqlError::Transport("connection refused".into())) }.boxed()
        });

        let (tx, frames) = body();
        push(&tx, HEADER).await;
        let stream = QueryStream::open(Context::background(), frames, Duration::from_millis(50), Some(terminate))
            .await
            .unwrap();

        assert!(matches!(stream.close().await, Err(KsqlError::Transport(_))));
        assert!(stream.is_closed());
        assert!(stream.close().await.is_ok());

        let mut row = Row::new();
        assert!(matches!(stream.next(&mut row).await, Err(KsqlError::StreamClosed)));
    }

    #[tokio::test]
    async fn close_drains_the_unread_body() {
        let (tx, stream) = open(
            Context::background(),
            &[HEADER, r#"[1,"x",true]"#, r#"[2,"y",false]"#, r#"[3,"z",true]"#],
        )
        .await;
        assert!(tx.capacity() < tx.max_capacity());

        stream.close().await.unwrap();
        assert_eq!(tx.capacity(), tx.max_capacity());
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn names_follow_header() {
        let (_tx, stream) = open(Context::background(), &[HEADER]).await;
        assert_eq!(stream.columns().names(), vec!["a", "b", "c"]);
        assert_eq!(stream.header().column_types.len(), 3);

        let (_tx, stream) = open(
            Context::background(),
            &[r#"{"columnNames":["a"],"columnTypes":["INTEGER","STRING"]}"#],
        )
        .await;
        assert_eq!(stream.columns().names(), vec!["", ""]);
    }
}
