//! Client for the model-serving backend.
//!
//! [`Upstream`] is the seam the HTTP handlers talk to; [`HttpUpstream`] is the
//! implementation that speaks OpenAI-compatible `/chat/completions` to the
//! configured endpoint.

use std::collections::HashMap;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::stream::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;

use crate::chat::{ChatRequest, CompletionChunk, CompletionResult};
use crate::config::{BackendConfig, ProxyConfig};
use crate::error::{ProxyError, Result};
use crate::models;
use crate::translate::openai_types::{ChatCompletionRequest, ModelsResponse};
use crate::translate::request::to_upstream;
use crate::translate::response::{
    chunk_from_upstream, parse_completion, parse_stream_event, upstream_status_error,
};
use crate::translate::streaming::DONE_SENTINEL;

/// Chunks in flight between the upstream reader and the client writer.
const CHUNK_BUFFER: usize = 1;

#[async_trait]
pub trait Upstream: Send + Sync {
    /// Run a generation to completion.
    async fn complete(&self, req: &ChatRequest) -> Result<CompletionResult>;

    /// Start a streamed generation. Errors returned here happen before any
    /// chunk exists; errors inside the stream happen after.
    async fn stream(&self, req: &ChatRequest) -> Result<ChunkStream>;

    /// Models the backend serves.
    async fn models(&self) -> Result<ModelsResponse> {
        Ok(ModelsResponse {
            object: "list".to_string(),
            data: Vec::new(),
        })
    }
}

/// Lazy, finite, non-restartable sequence of chunks fed by a producer task.
///
/// Dropping the stream (or calling [`ChunkStream::close`]) closes the channel;
/// the producer notices and releases its upstream connection.
#[derive(Debug)]
pub struct ChunkStream {
    inner: ReceiverStream<Result<CompletionChunk>>,
}

impl ChunkStream {
    pub fn channel(capacity: usize) -> (mpsc::Sender<Result<CompletionChunk>>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            tx,
            Self {
                inner: ReceiverStream::new(rx),
            },
        )
    }

    /// A stream over already-known items, mostly useful for tests and stubs.
    pub fn from_items(items: Vec<Result<CompletionChunk>>) -> Self {
        let (tx, stream) = Self::channel(items.len().max(1));
        for item in items {
            // Capacity covers every item, so this cannot fail.
            let _ = tx.try_send(item);
        }
        stream
    }

    /// Signal the producer that no more chunks are wanted.
    pub fn close(&mut self) {
        self.inner.close();
    }
}

impl Stream for ChunkStream {
    type Item = Result<CompletionChunk>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

pub struct HttpUpstream {
    client: reqwest::Client,
    backend: BackendConfig,
    api_key: Option<String>,
    models: HashMap<String, String>,
    drop_params: Vec<String>,
}

impl HttpUpstream {
    /// Build the upstream from startup configuration, creating its connection pool.
    pub fn new(config: &ProxyConfig) -> Result<Self> {
        let client = config.backend.build_client()?;
        Self::with_client(config, client)
    }

    pub fn with_client(config: &ProxyConfig, client: reqwest::Client) -> Result<Self> {
        Ok(Self {
            client,
            api_key: config.backend.resolve_api_key()?,
            backend: config.backend.clone(),
            models: config.models.clone(),
            drop_params: config.params.drop.clone(),
        })
    }

    fn timeout(&self) -> Duration {
        self.backend.timeout()
    }

    fn body(&self, req: &ChatRequest, stream: bool) -> ChatCompletionRequest {
        let mut body = to_upstream(req, &self.backend, &self.models, &self.drop_params);
        body.stream = stream;
        if !stream {
            body.stream_options = None;
        }
        body
    }

    fn post(&self, body: &ChatCompletionRequest) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(self.backend.chat_completions_url())
            .header("Content-Type", "application/json")
            .json(body);
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
    }

    async fn complete_inner(&self, req: &ChatRequest) -> Result<CompletionResult> {
        let body = self.body(req, false);
        tracing::info!(
            url = %self.backend.chat_completions_url(),
            model = %body.model,
            messages = body.messages.len(),
            "POST backend"
        );

        let response = self
            .post(&body)
            .send()
            .await
            .map_err(|e| ProxyError::upstream(format!("Request failed: {}", e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ProxyError::upstream(format!("Failed to read response body: {}", e)))?;

        tracing::debug!(status = status.as_u16(), body_len = text.len(), "Backend responded");

        if !status.is_success() {
            return Err(upstream_status_error(status.as_u16(), &text));
        }

        parse_completion(&text)
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn complete(&self, req: &ChatRequest) -> Result<CompletionResult> {
        let timeout = self.timeout();
        tokio::time::timeout(timeout, self.complete_inner(req))
            .await
            .map_err(|_| ProxyError::timeout(timeout))?
    }

    async fn stream(&self, req: &ChatRequest) -> Result<ChunkStream> {
        let timeout = self.timeout();
        let deadline = Instant::now() + timeout;
        let body = self.body(req, true);

        tracing::info!(
            url = %self.backend.chat_completions_url(),
            model = %body.model,
            messages = body.messages.len(),
            "POST backend (streaming)"
        );

        let response = tokio::time::timeout_at(deadline, self.post(&body).send())
            .await
            .map_err(|_| ProxyError::timeout(timeout))?
            .map_err(|e| ProxyError::upstream(format!("Streaming request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = tokio::time::timeout_at(deadline, response.text())
                .await
                .map_err(|_| ProxyError::timeout(timeout))?
                .unwrap_or_default();
            tracing::warn!(status = status.as_u16(), "Backend rejected streaming request");
            return Err(upstream_status_error(status.as_u16(), &text));
        }

        let (tx, stream) = ChunkStream::channel(CHUNK_BUFFER);
        tokio::spawn(pump_events(response, tx, deadline, timeout));
        Ok(stream)
    }

    async fn models(&self) -> Result<ModelsResponse> {
        models::fetch_backend_models(
            &self.client,
            &self.backend.models_url(),
            self.api_key.as_deref(),
            self.timeout(),
        )
        .await
    }
}

/// Read the backend's event stream and forward each chunk, in order, until
/// `[DONE]`, an error, the deadline, or the consumer going away.
///
/// A stream that ends before `[DONE]` and before any chunk carried a finish
/// reason was cut short and is reported as an upstream error.
async fn pump_events(
    response: reqwest::Response,
    tx: mpsc::Sender<Result<CompletionChunk>>,
    deadline: Instant,
    timeout: Duration,
) {
    let events = response.bytes_stream().eventsource();
    tokio::pin!(events);
    let mut index = 0u64;
    let mut usage = None;
    let mut finished = false;

    loop {
        let next = tokio::select! {
            biased;
            () = tx.closed() => {
                tracing::debug!(chunks = index, "Client went away, dropping backend stream");
                return;
            }
            next = tokio::time::timeout_at(deadline, events.next()) => next,
        };

        let event = match next {
            Err(_) => {
                tracing::warn!(chunks = index, "Backend stream timed out");
                let _ = tx.send(Err(ProxyError::timeout(timeout))).await;
                return;
            }
            Ok(None) => {
                if !finished {
                    tracing::warn!(chunks = index, "Backend stream ended before [DONE]");
                    let _ = tx
                        .send(Err(ProxyError::upstream("Backend stream ended before [DONE]")))
                        .await;
                    return;
                }
                break;
            }
            Ok(Some(Err(e))) => {
                let _ = tx
                    .send(Err(ProxyError::upstream(format!("Stream read failed: {}", e))))
                    .await;
                return;
            }
            Ok(Some(Ok(event))) => event,
        };

        let data = event.data.trim();
        if data.is_empty() {
            continue;
        }
        if data == DONE_SENTINEL {
            break;
        }

        let chunk = match parse_stream_event(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::warn!(chunks = index, error = %e, "Backend stream failed");
                let _ = tx.send(Err(e)).await;
                return;
            }
        };

        if let Some(chunk) = chunk_from_upstream(&chunk, index, &mut usage) {
            finished |= chunk.finish_reason.is_some();
            index += 1;
            if tx.send(Ok(chunk)).await.is_err() {
                tracing::debug!(chunks = index, "Client went away, dropping backend stream");
                return;
            }
        }
    }

    tracing::info!(chunks = index, usage = ?usage, "Backend stream completed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{ChatMessage, Role};

    fn request(stream: bool) -> ChatRequest {
        ChatRequest {
            messages: vec![ChatMessage::new(Role::User, "hi")],
            stream,
            model: None,
            params: serde_json::Map::new(),
        }
    }

    #[test]
    fn test_from_items_yields_in_order() {
        let stream = ChunkStream::from_items(vec![
            Ok(CompletionChunk::text(0, "a")),
            Ok(CompletionChunk::text(1, "b")),
        ]);
        let items: Vec<_> = tokio_test::block_on(stream.collect::<Vec<_>>());
        let contents: Vec<String> = items.into_iter().map(|c| c.unwrap().content).collect();
        assert_eq!(contents, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_close_signals_producer() {
        let (tx, mut stream) = ChunkStream::channel(1);
        stream.close();
        tx.closed().await;
        assert!(tx.send(Ok(CompletionChunk::text(0, "x"))).await.is_err());
    }

    #[tokio::test]
    async fn test_drop_signals_producer() {
        let (tx, stream) = ChunkStream::channel(1);
        drop(stream);
        assert!(tx.is_closed());
    }

    #[test]
    fn test_body_stream_flag_follows_mode() {
        let upstream =
            HttpUpstream::with_client(&ProxyConfig::default(), reqwest::Client::new()).unwrap();

        let body = upstream.body(&request(true), false);
        assert!(!body.stream);
        assert!(body.stream_options.is_none());
        assert_eq!(body.model, "default");

        let body = upstream.body(&request(false), true);
        assert!(body.stream);
        assert!(body.stream_options.is_some());
    }
}
