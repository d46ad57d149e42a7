//! Incremental relay of streamed upstream bodies
//!
//! A spawned task pulls chunks from the upstream body and pushes them into a
//! bounded channel that backs the client response body. Chunks are written
//! as received, never buffered whole. When the client goes away the response
//! body and its receiver are dropped, the task sees the channel close, and
//! dropping the upstream stream releases the upstream connection.

use std::fmt::Display;
use std::io;

use axum::body::Body;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{Instrument, debug, info, warn};

use crate::metrics;

/// Chunks buffered between the upstream reader and the client writer.
pub const RELAY_BUFFER_CHUNKS: usize = 16;

/// How a relay ended, with totals forwarded to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    Completed { chunks: u64, bytes: u64 },
    ClientDisconnected { chunks: u64, bytes: u64 },
    UpstreamError { chunks: u64, bytes: u64, error: String },
}

impl RelayOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RelayOutcome::Completed { .. } => "completed",
            RelayOutcome::ClientDisconnected { .. } => "client_disconnected",
            RelayOutcome::UpstreamError { .. } => "upstream_error",
        }
    }
}

/// Copy `upstream` into `sink` chunk by chunk until the upstream ends, fails,
/// or the receiving side closes.
///
/// An upstream failure is forwarded as an `io::Error` so the client sees an
/// aborted body rather than a clean end of stream.
pub async fn relay<S, E>(upstream: S, sink: mpsc::Sender<Result<Bytes, io::Error>>) -> RelayOutcome
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    let mut upstream = std::pin::pin!(upstream);
    let mut chunks = 0u64;
    let mut bytes = 0u64;

    loop {
        let next = tokio::select! {
            biased;
            _ = sink.closed() => return RelayOutcome::ClientDisconnected { chunks, bytes },
            next = upstream.next() => next,
        };

        match next {
            None => return RelayOutcome::Completed { chunks, bytes },
            Some(Ok(chunk)) => {
                if chunk.is_empty() {
                    continue;
                }
                let len = chunk.len() as u64;
                if sink.send(Ok(chunk)).await.is_err() {
                    return RelayOutcome::ClientDisconnected { chunks, bytes };
                }
                chunks += 1;
                bytes += len;
            }
            Some(Err(e)) => {
                let error = e.to_string();
                let _ = sink.send(Err(io::Error::other(error.clone()))).await;
                return RelayOutcome::UpstreamError {
                    chunks,
                    bytes,
                    error,
                };
            }
        }
    }
}

/// Response body fed by a background relay of `upstream`.
pub fn relay_body<S, E>(upstream: S) -> Body
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let (tx, rx) = mpsc::channel(RELAY_BUFFER_CHUNKS);

    tokio::spawn(
        async move {
            let outcome = relay(upstream, tx).await;
            metrics::record_relay_outcome(outcome.label());
            match &outcome {
                RelayOutcome::Completed { chunks, bytes } => {
                    debug!(chunks, bytes, "stream relay completed");
                }
                RelayOutcome::ClientDisconnected { chunks, bytes } => {
                    info!(chunks, bytes, "client disconnected, upstream stream released");
                }
                RelayOutcome::UpstreamError {
                    chunks,
                    bytes,
                    error,
                } => {
                    warn!(chunks, bytes, error = %error, "upstream stream failed mid-relay");
                }
            }
        }
        .in_current_span(),
    );

    Body::from_stream(ReceiverStream::new(rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    type Upstream = mpsc::UnboundedSender<Result<Bytes, String>>;

    /// Upstream stream controlled by the test. The stream is dropped when the
    /// relay stops reading it, which closes the sender side.
    fn controlled_upstream() -> (
        Upstream,
        impl Stream<Item = Result<Bytes, String>> + Send + 'static,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, UnboundedReceiverStream::new(rx))
    }

    #[tokio::test]
    async fn completed_relay_forwards_every_chunk_in_order() {
        let (upstream_tx, upstream) = controlled_upstream();
        let (sink, mut client) = mpsc::channel(4);
        let task = tokio::spawn(relay(upstream, sink));

        for chunk in ["data: one\n\n", "data: two\n\n", "data: three\n\n"] {
            upstream_tx.send(Ok(Bytes::from(chunk))).unwrap();
        }
        drop(upstream_tx);

        let mut received = Vec::new();
        while let Some(item) = client.recv().await {
            received.push(item.unwrap());
        }
        assert_eq!(
            received,
            vec![
                Bytes::from("data: one\n\n"),
                Bytes::from("data: two\n\n"),
                Bytes::from("data: three\n\n")
            ]
        );
        assert_eq!(
            task.await.unwrap(),
            RelayOutcome::Completed {
                chunks: 3,
                bytes: 35
            }
        );
    }

    #[tokio::test]
    async fn first_chunk_arrives_before_upstream_finishes() {
        let (upstream_tx, upstream) = controlled_upstream();
        let (sink, mut client) = mpsc::channel(4);
        let _task = tokio::spawn(relay(upstream, sink));

        upstream_tx.send(Ok(Bytes::from("data: early\n\n"))).unwrap();
        let first = tokio::time::timeout(Duration::from_secs(1), client.recv())
            .await
            .expect("first chunk must be relayed while upstream is still open")
            .unwrap()
            .unwrap();
        assert_eq!(first, Bytes::from("data: early\n\n"));
        assert!(!upstream_tx.is_closed(), "upstream still being read");
    }

    #[tokio::test]
    async fn client_disconnect_stops_reading_and_drops_upstream() {
        let (upstream_tx, upstream) = controlled_upstream();
        let (sink, mut client) = mpsc::channel(4);
        let task = tokio::spawn(relay(upstream, sink));

        upstream_tx.send(Ok(Bytes::from("chunk"))).unwrap();
        client.recv().await.unwrap().unwrap();
        drop(client);

        // Upstream never sends another chunk; the relay must still exit.
        let outcome = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("relay must stop once the client is gone")
            .unwrap();
        assert_eq!(
            outcome,
            RelayOutcome::ClientDisconnected {
                chunks: 1,
                bytes: 5
            }
        );
        assert!(upstream_tx.is_closed(), "upstream stream must be dropped");
    }

    #[tokio::test]
    async fn upstream_error_is_forwarded_as_body_error() {
        let (upstream_tx, upstream) = controlled_upstream();
        let (sink, mut client) = mpsc::channel(4);
        let task = tokio::spawn(relay(upstream, sink));

        upstream_tx.send(Ok(Bytes::from("partial"))).unwrap();
        upstream_tx.send(Err("connection reset".into())).unwrap();

        assert_eq!(client.recv().await.unwrap().unwrap(), Bytes::from("partial"));
        let err = client.recv().await.unwrap().unwrap_err();
        assert!(err.to_string().contains("connection reset"));
        assert!(client.recv().await.is_none());

        assert!(matches!(
            task.await.unwrap(),
            RelayOutcome::UpstreamError { chunks: 1, .. }
        ));
    }

    #[tokio::test]
    async fn empty_chunks_are_skipped() {
        let (upstream_tx, upstream) = controlled_upstream();
        let (sink, mut client) = mpsc::channel(4);
        let task = tokio::spawn(relay(upstream, sink));

        upstream_tx.send(Ok(Bytes::new())).unwrap();
        upstream_tx.send(Ok(Bytes::from("x"))).unwrap();
        drop(upstream_tx);

        assert_eq!(client.recv().await.unwrap().unwrap(), Bytes::from("x"));
        assert!(client.recv().await.is_none());
        assert_eq!(
            task.await.unwrap(),
            RelayOutcome::Completed { chunks: 1, bytes: 1 }
        );
    }

    #[tokio::test]
    async fn relay_body_streams_into_response_body() {
        let (upstream_tx, upstream) = controlled_upstream();
        let body = relay_body(upstream);

        upstream_tx.send(Ok(Bytes::from("a"))).unwrap();
        upstream_tx.send(Ok(Bytes::from("b"))).unwrap();
        drop(upstream_tx);

        let collected = axum::body::to_bytes(body, usize::MAX).await.unwrap();
        assert_eq!(collected, Bytes::from("ab"));
    }
}
