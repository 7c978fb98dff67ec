//! Turns a sequence of [`CompletionChunk`]s into OpenAI `chat.completion.chunk`
//! server-sent events.
//!
//! Every chunk becomes exactly one frame, in order. The stream always ends
//! with the `[DONE]` sentinel; if the chunk sequence fails, an `error` frame is
//! emitted first so the client can tell a truncated answer from a finished one.

use futures::stream::{Stream, StreamExt};

use super::openai_types::{ChatCompletionChunk, ChatErrorResponse, ChunkChoice, ChunkDelta};
use super::response::usage_to_wire;
use crate::chat::CompletionChunk;
use crate::error::{ProxyError, Result};

pub const DONE_SENTINEL: &str = "[DONE]";

/// One server-sent event, ready to be written to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    fn data(data: String) -> Self {
        Self { event: None, data }
    }

    pub fn is_done(&self) -> bool {
        self.event.is_none() && self.data == DONE_SENTINEL
    }

    pub fn is_error(&self) -> bool {
        self.event.as_deref() == Some("error")
    }
}

/// Per-stream framing state.
///
/// Usage:
///   let mut translator = StreamTranslator::new("chatcmpl-1", "granite", created);
///   for chunk in chunks {
///       let frame = translator.chunk_frame(&chunk);
///       // write frame
///   }
///   let done = translator.done_frame();
#[derive(Debug)]
pub struct StreamTranslator {
    id: String,
    model: String,
    created: i64,
    sent_role: bool,
    frames: u64,
    terminated: bool,
}

impl StreamTranslator {
    pub fn new(id: impl Into<String>, model: impl Into<String>, created: i64) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            created,
            sent_role: false,
            frames: 0,
            terminated: false,
        }
    }

    /// Number of chunk frames produced so far.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn chunk_frame(&mut self, chunk: &CompletionChunk) -> SseFrame {
        let role = if self.sent_role {
            None
        } else {
            self.sent_role = true;
            Some("assistant".to_string())
        };

        let wire = ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta {
                    role,
                    content: Some(chunk.content.clone()),
                },
                finish_reason: chunk.finish_reason.map(|r| r.as_str().to_string()),
            }],
            usage: chunk.usage.map(usage_to_wire),
        };

        self.frames += 1;
        SseFrame::data(to_json(&wire))
    }

    /// Error frame for a stream that was cut short. Returns `None` once the
    /// stream has already been terminated.
    pub fn error_frame(&mut self, err: &ProxyError) -> Option<SseFrame> {
        if self.terminated {
            return None;
        }
        Some(SseFrame {
            event: Some("error".to_string()),
            data: to_json(&ChatErrorResponse::from(err)),
        })
    }

    /// The `[DONE]` sentinel, produced at most once.
    pub fn done_frame(&mut self) -> Option<SseFrame> {
        if self.terminated {
            return None;
        }
        self.terminated = true;
        Some(SseFrame::data(DONE_SENTINEL.to_string()))
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> String {
    // Our own wire types only hold strings, numbers and maps.
    serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
}

/// Frame a chunk sequence. Items are pulled one at a time, so chunk *i* is
/// emitted before chunk *i + 1* is requested from the source.
pub fn frame_stream<S>(
    chunks: S,
    mut translator: StreamTranslator,
) -> impl Stream<Item = SseFrame> + Send + 'static
where
    S: Stream<Item = Result<CompletionChunk>> + Send + 'static,
{
    async_stream::stream! {
        tokio::pin!(chunks);

        while let Some(item) = chunks.next().await {
            match item {
                Ok(chunk) => yield translator.chunk_frame(&chunk),
                Err(err) => {
                    tracing::warn!(
                        frames = translator.frames(),
                        error = %err,
                        "Stream truncated by upstream failure"
                    );
                    if let Some(frame) = translator.error_frame(&err) {
                        yield frame;
                    }
                    break;
                }
            }
        }

        if let Some(frame) = translator.done_frame() {
            yield frame;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::FinishReason;
    use futures::stream;

    fn parse(frame: &SseFrame) -> serde_json::Value {
        serde_json::from_str(&frame.data).unwrap()
    }

    #[test]
    fn test_first_frame_carries_role() {
        let mut translator = StreamTranslator::new("chatcmpl-1", "granite", 7);

        let first = parse(&translator.chunk_frame(&CompletionChunk::text(0, "Run ")));
        assert_eq!(first["id"], "chatcmpl-1");
        assert_eq!(first["object"], "chat.completion.chunk");
        assert_eq!(first["created"], 7);
        assert_eq!(first["choices"][0]["delta"]["role"], "assistant");
        assert_eq!(first["choices"][0]["delta"]["content"], "Run ");
        assert!(first["choices"][0]["finish_reason"].is_null());

        let second = parse(&translator.chunk_frame(
            &CompletionChunk::text(1, "now").with_finish(FinishReason::Stop),
        ));
        assert!(second["choices"][0]["delta"].get("role").is_none());
        assert_eq!(second["choices"][0]["finish_reason"], "stop");
        assert_eq!(second["id"], first["id"]);
    }

    #[test]
    fn test_done_emitted_once() {
        let mut translator = StreamTranslator::new("chatcmpl-1", "granite", 0);
        let done = translator.done_frame().unwrap();
        assert!(done.is_done());
        assert!(translator.done_frame().is_none());
        assert!(translator
            .error_frame(&ProxyError::upstream("late"))
            .is_none());
    }

    #[tokio::test]
    async fn test_three_chunks_three_frames_then_done() {
        let chunks = vec!["Run ", "`sed -i`", " on sshd_config"];
        let source = stream::iter(
            chunks
                .iter()
                .enumerate()
                .map(|(i, c)| Ok(CompletionChunk::text(i as u64, *c)))
                .collect::<Vec<_>>(),
        );

        let frames: Vec<SseFrame> =
            frame_stream(source, StreamTranslator::new("chatcmpl-1", "granite", 0))
                .collect()
                .await;

        assert_eq!(frames.len(), 4);
        for (frame, expected) in frames.iter().zip(&chunks) {
            assert_eq!(parse(frame)["choices"][0]["delta"]["content"], *expected);
        }
        assert!(frames[3].is_done());
    }

    #[tokio::test]
    async fn test_failure_after_two_chunks() {
        let source = stream::iter(vec![
            Ok(CompletionChunk::text(0, "Run ")),
            Ok(CompletionChunk::text(1, "`sed -i`")),
            Err(ProxyError::upstream("connection reset")),
            Ok(CompletionChunk::text(2, " never sent")),
        ]);

        let frames: Vec<SseFrame> =
            frame_stream(source, StreamTranslator::new("chatcmpl-1", "granite", 0))
                .collect()
                .await;

        assert_eq!(frames.len(), 4);
        assert_eq!(parse(&frames[0])["choices"][0]["delta"]["content"], "Run ");
        assert_eq!(parse(&frames[1])["choices"][0]["delta"]["content"], "`sed -i`");
        assert!(frames[2].is_error());
        let err = parse(&frames[2]);
        assert_eq!(err["error"]["type"], "upstream_error");
        assert!(err["error"]["message"]
            .as_str()
            .unwrap()
            .contains("connection reset"));
        assert!(frames[3].is_done());
    }

    #[tokio::test]
    async fn test_timeout_error_frame_type() {
        let source = stream::iter(vec![Err(ProxyError::timeout(
            std::time::Duration::from_secs(30),
        ))]);
        let frames: Vec<SseFrame> =
            frame_stream(source, StreamTranslator::new("chatcmpl-1", "granite", 0))
                .collect()
                .await;

        assert_eq!(frames.len(), 2);
        assert_eq!(parse(&frames[0])["error"]["type"], "timeout_error");
        assert!(frames[1].is_done());
    }

    #[tokio::test]
    async fn test_empty_stream_still_terminates() {
        let source = stream::iter(Vec::<Result<CompletionChunk>>::new());
        let frames: Vec<SseFrame> =
            frame_stream(source, StreamTranslator::new("chatcmpl-1", "granite", 0))
                .collect()
                .await;
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_done());
    }
}
