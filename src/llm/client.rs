//! Provider abstraction - an opaque byte-chunk stream with abort support

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{AbortHandle, Abortable};
use futures::{Stream, StreamExt};

use super::types::{ChatRequest, StreamError};

type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, StreamError>> + Send>>;

/// A single in-flight provider response. Yields raw byte chunks; the SSE
/// parser turns them into events. `abort()` ends the stream early, which
/// readers observe as a normal end-of-stream.
pub struct ProviderStream {
    inner: Abortable<ByteStream>,
    abort: AbortHandle,
}

impl ProviderStream {
    pub fn new(stream: impl Stream<Item = Result<Bytes, StreamError>> + Send + 'static) -> Self {
        let (abort, registration) = AbortHandle::new_pair();
        Self {
            inner: Abortable::new(Box::pin(stream) as ByteStream, registration),
            abort,
        }
    }

    /// Handle that cancels the stream from another thread
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn abort(&self) {
        self.abort.abort();
    }

    /// Next byte chunk; `None` on end-of-stream or after abort
    pub async fn next_chunk(&mut self) -> Option<Result<Bytes, StreamError>> {
        self.inner.next().await
    }
}

/// A model provider that can open one streaming response per call
#[async_trait]
pub trait ModelClient: Send + Sync {
    fn name(&self) -> &str;

    async fn open_stream(&self, request: &ChatRequest) -> Result<ProviderStream, StreamError>;
}
