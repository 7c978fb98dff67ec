use super::openai_types::{
    ChatCompletionChunk, ChatCompletionResponse, ChatErrorResponse, ChatUsage, Choice,
    ChoiceMessage,
};
use crate::chat::{CompletionChunk, CompletionResult, FinishReason, TokenUsage};
use crate::error::{ProxyError, Result};

/// Parse a non-streaming backend body into a [`CompletionResult`].
pub fn parse_completion(body: &str) -> Result<CompletionResult> {
    let resp: ChatCompletionResponse = serde_json::from_str(body).map_err(|e| {
        ProxyError::upstream(format!(
            "Failed to parse backend response: {}. Body: {}",
            e,
            truncate(body, 300)
        ))
    })?;

    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProxyError::upstream("Backend response contained no choices"))?;

    Ok(CompletionResult {
        content: choice.message.content.unwrap_or_default(),
        finish_reason: choice
            .finish_reason
            .as_deref()
            .map_or(FinishReason::Stop, FinishReason::from_upstream),
        usage: resp.usage.map(usage_from_wire),
    })
}

/// Convert one backend stream chunk into our chunk type.
///
/// Returns `None` for chunks that carry no choice at all (the trailing
/// usage-only chunk); their usage is still reported through `usage_out`.
pub fn chunk_from_upstream(
    chunk: &ChatCompletionChunk,
    index: u64,
    usage_out: &mut Option<TokenUsage>,
) -> Option<CompletionChunk> {
    if let Some(usage) = chunk.usage {
        *usage_out = Some(usage_from_wire(usage));
    }

    let choice = chunk.choices.first()?;
    Some(CompletionChunk {
        index,
        content: choice.delta.content.clone().unwrap_or_default(),
        finish_reason: choice
            .finish_reason
            .as_deref()
            .map(FinishReason::from_upstream),
        usage: chunk.usage.map(usage_from_wire),
    })
}

/// Wrap a [`CompletionResult`] in the `chat.completion` envelope.
pub fn completion_response(
    result: &CompletionResult,
    id: &str,
    model: &str,
    created: i64,
) -> ChatCompletionResponse {
    ChatCompletionResponse {
        id: id.to_string(),
        object: "chat.completion".to_string(),
        created,
        model: model.to_string(),
        choices: vec![Choice {
            index: 0,
            message: ChoiceMessage {
                role: "assistant".to_string(),
                content: Some(result.content.clone()),
            },
            finish_reason: Some(result.finish_reason.as_str().to_string()),
        }],
        usage: result.usage.map(usage_to_wire),
    }
}

/// Parse one backend stream event.
///
/// Any JSON object with an `error` key is a backend failure, whether the value
/// is an OpenAI envelope or a bare string. Anything that is not a valid chunk
/// is a malformed payload.
pub fn parse_stream_event(data: &str) -> Result<ChatCompletionChunk> {
    let value: serde_json::Value = serde_json::from_str(data).map_err(|e| {
        ProxyError::upstream(format!(
            "Malformed backend chunk: {}. Data: {}",
            e,
            truncate(data, 300)
        ))
    })?;

    if let Some(err) = value.get("error") {
        let message = match err {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Object(obj) => match obj.get("message") {
                Some(serde_json::Value::String(s)) => s.clone(),
                _ => err.to_string(),
            },
            other => other.to_string(),
        };
        return Err(ProxyError::upstream(format!(
            "Backend reported an error mid-stream: {}",
            message
        )));
    }

    serde_json::from_value(value).map_err(|e| {
        ProxyError::upstream(format!(
            "Malformed backend chunk: {}. Data: {}",
            e,
            truncate(data, 300)
        ))
    })
}

/// Build the error for a non-2xx backend status, keeping the backend's own
/// message when it sent an OpenAI error envelope.
pub fn upstream_status_error(status: u16, body: &str) -> ProxyError {
    match serde_json::from_str::<ChatErrorResponse>(body) {
        Ok(err) => ProxyError::upstream_status(
            status,
            format!("Backend returned status {}: {}", status, err.error.message),
        ),
        Err(_) => ProxyError::upstream_status(
            status,
            format!("Backend returned status {}: {}", status, truncate(body, 500)),
        ),
    }
}

pub fn usage_from_wire(usage: ChatUsage) -> TokenUsage {
    TokenUsage {
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: usage.total_tokens,
    }
}

pub fn usage_to_wire(usage: TokenUsage) -> ChatUsage {
    ChatUsage {
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: usage.total_tokens,
    }
}

pub(crate) fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
