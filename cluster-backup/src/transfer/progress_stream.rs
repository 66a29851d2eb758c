//! Stream wrapper that counts and hashes the bytes flowing through it.
//!
//! Used on both sides of a transfer: the tar stream read out of a pod during
//! backup, and the decompressed stream fed back in during restore. The
//! resulting size and SHA-256 are what restore verification compares.

use bytes::Bytes;
use futures_util::Stream;
use sha2::{Digest, Sha256};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::time::{Duration, Instant};

/// Callback for progress updates
pub type ProgressCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// Shared view of a [`ProgressStream`]'s running totals. Stays readable
/// after the stream itself has been moved into a decoder or the gateway.
#[derive(Clone, Default)]
pub struct StreamTally {
    inner: Arc<Mutex<TallyState>>,
}

#[derive(Default)]
struct TallyState {
    bytes: u64,
    hasher: Sha256,
}

impl StreamTally {
    pub fn bytes(&self) -> u64 {
        self.inner.lock().map(|s| s.bytes).unwrap_or(0)
    }

    /// Hex SHA-256 of everything seen so far.
    pub fn sha256(&self) -> String {
        self.inner
            .lock()
            .map(|s| hex::encode(s.hasher.clone().finalize()))
            .unwrap_or_default()
    }

    fn update(&self, chunk: &[u8]) -> u64 {
        match self.inner.lock() {
            Ok(mut state) => {
                state.bytes += chunk.len() as u64;
                state.hasher.update(chunk);
                state.bytes
            }
            Err(_) => 0,
        }
    }
}

/// Stream wrapper that tracks bytes transferred and calls a progress callback
pub struct ProgressStream<S> {
    inner: S,
    tally: StreamTally,
    last_update: Instant,
    update_interval: Duration,
    callback: Option<ProgressCallback>,
}

impl<S> ProgressStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            tally: StreamTally::default(),
            last_update: Instant::now(),
            update_interval: Duration::from_secs(5),
            callback: None,
        }
    }

    pub fn with_callback(mut self, callback: ProgressCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn tally(&self) -> StreamTally {
        self.tally.clone()
    }
}

impl<S, E> Stream for ProgressStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    type Item = Result<Bytes, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(bytes))) => {
                let total = self.tally.update(&bytes);

                let now = Instant::now();
                if now.duration_since(self.last_update) >= self.update_interval {
                    if let Some(cb) = &self.callback {
                        cb(total);
                    }
                    self.last_update = now;
                }

                Poll::Ready(Some(Ok(bytes)))
            }
            Poll::Ready(None) => {
                // Final update on completion
                if let Some(cb) = &self.callback {
                    cb(self.tally.bytes());
                }
                Poll::Ready(None)
            }
            other => other,
        }
    }
}
