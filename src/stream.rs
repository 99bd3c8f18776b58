//! Bridges a backend result stream to the SSE writer.
//!
//! A worker task reads the backend stream, translates and serializes each
//! result, and pushes it into a bounded channel. The HTTP side pulls from the
//! returned [`ChunkStream`]. A full channel blocks the worker, which in turn
//! stops reading from the backend. Dropping the [`ChunkStream`] (e.g. when the
//! client disconnects) cancels the worker.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::backend::BackendStream;
use crate::error::{ProxyError, Result};
use crate::logging::SharedLogger;
use crate::translate::streaming::ChunkTranslator;

/// Serialized `chat.completion.chunk` payloads, in backend order. An `Err`
/// item is always the last one.
pub struct ChunkStream {
    inner: ReceiverStream<Result<String>>,
    _cancel_on_drop: DropGuard,
}

impl ChunkStream {
    pub async fn next_chunk(&mut self) -> Option<Result<String>> {
        self.inner.next().await
    }
}

impl Stream for ChunkStream {
    type Item = Result<String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerExit {
    Exhausted,
    Failed,
    Cancelled,
}

/// Spawn the reader task. `cancel` may be shared with the caller's request
/// scope; it is also cancelled when the returned stream is dropped.
pub fn spawn_stream_worker(
    mut backend_stream: BackendStream,
    mut translator: ChunkTranslator,
    capacity: usize,
    cancel: CancellationToken,
    logger: SharedLogger,
) -> ChunkStream {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let guard = cancel.clone().drop_guard();

    tokio::spawn(async move {
        let mut forwarded = 0usize;

        let exit = loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => break WorkerExit::Cancelled,
                item = backend_stream.next() => item,
            };

            let Some(item) = next else {
                break WorkerExit::Exhausted;
            };

            let payload = item.and_then(|resp| {
                let chunk = translator.process(&resp);
                serde_json::to_string(&chunk).map_err(ProxyError::from)
            });
            let failed = payload.is_err();

            tokio::select! {
                biased;
                () = cancel.cancelled() => break WorkerExit::Cancelled,
                sent = tx.send(payload) => {
                    if sent.is_err() {
                        break WorkerExit::Cancelled;
                    }
                }
            }

            if failed {
                break WorkerExit::Failed;
            }
            forwarded += 1;
        };

        match exit {
            WorkerExit::Exhausted => {
                tracing::debug!(id = translator.id(), chunks = forwarded, "backend stream exhausted");
                logger.info(
                    "stream",
                    format!("Stream {} completed after {} chunks", translator.id(), forwarded),
                );
            }
            WorkerExit::Failed => {
                logger.error(
                    "stream",
                    format!("Stream {} failed after {} chunks", translator.id(), forwarded),
                );
            }
            WorkerExit::Cancelled => {
                tracing::debug!(id = translator.id(), chunks = forwarded, "stream cancelled");
                logger.warn(
                    "stream",
                    format!("Stream {} cancelled after {} chunks", translator.id(), forwarded),
                );
            }
        }
    });

    ChunkStream {
        inner: ReceiverStream::new(rx),
        _cancel_on_drop: guard,
    }
}
