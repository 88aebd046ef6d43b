//! Line framing for delimited response bodies
//!
//! Streaming endpoints send one JSON document per line. The transport hands
//! over raw body chunks, which are re-split here on newlines regardless of
//! how the chunks happen to be cut.

use std::io;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use log::debug;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;

use crate::error::{KsqlError, Result};

/// Raw response body chunks.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// One non-empty line per item.
pub type FrameStream = BoxStream<'static, Result<String>>;

pub fn lines(body: ByteStream, max_frame_bytes: usize) -> FrameStream {
    FramedRead::new(
        StreamReader::new(body),
        LinesCodec::new_with_max_length(max_frame_bytes),
    )
    .map_err(KsqlError::from)
    .try_filter(|line| futures::future::ready(!line.trim().is_empty()))
    .boxed()
}

/// Read and discard frames until the stream ends or `timeout` elapses.
///
/// Returns the number of frames thrown away.
pub async fn drain(frames: &mut FrameStream, timeout: Duration) -> usize {
    let mut discarded = 0;
    let finished = tokio::time::timeout(timeout, async {
        while frames.next().await.is_some() {
            discarded += 1;
        }
    })
    .await;
    if finished.is_err() {
        debug!("gave up draining after {:?} ({} frames discarded)", timeout, discarded);
    }
    discarded
}
