//! Validate inbound OpenAI chat requests and build the body sent to the backend.
//!
//! Normalization works on the raw JSON value rather than a derived struct so
//! that every rejection carries a precise message and unknown fields can be
//! ignored without a catch-all map.

use std::collections::HashMap;
use std::hash::BuildHasher;

use serde_json::{Map, Value};

use super::openai_types::{ChatCompletionRequest, StreamOptions};
use crate::chat::{ChatMessage, ChatRequest, Role};
use crate::config::BackendConfig;
use crate::error::{ProxyError, Result};

/// OpenAI generation parameters captured from the client body and forwarded.
pub const GENERATION_PARAMS: &[&str] = &[
    "temperature",
    "top_p",
    "max_tokens",
    "max_completion_tokens",
    "stop",
    "presence_penalty",
    "frequency_penalty",
    "seed",
    "n",
    "user",
    "logit_bias",
    "response_format",
];

/// Parse a raw request body into a [`ChatRequest`].
pub fn parse_body(body: &[u8]) -> Result<ChatRequest> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| ProxyError::validation(format!("Request body is not valid JSON: {}", e)))?;
    normalize(&value)
}

/// Validate a JSON-decoded request body and convert it into a [`ChatRequest`].
pub fn normalize(body: &Value) -> Result<ChatRequest> {
    let obj = body
        .as_object()
        .ok_or_else(|| ProxyError::validation("Request body must be a JSON object"))?;

    let messages = match obj.get("messages") {
        None | Some(Value::Null) => {
            return Err(ProxyError::validation("'messages' is required"));
        }
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .map(|(i, item)| normalize_message(i, item))
            .collect::<Result<Vec<_>>>()?,
        Some(_) => return Err(ProxyError::validation("'messages' must be an array")),
    };

    if messages.is_empty() {
        return Err(ProxyError::validation("'messages' must not be empty"));
    }

    let stream = coerce_stream(obj.get("stream"))?;

    let model = match obj.get("model") {
        None | Some(Value::Null) => None,
        Some(Value::String(m)) => Some(m.clone()),
        Some(_) => return Err(ProxyError::validation("'model' must be a string")),
    };

    let params: Map<String, Value> = GENERATION_PARAMS
        .iter()
        .filter_map(|&key| match obj.get(key) {
            None | Some(Value::Null) => None,
            Some(v) => Some((key.to_string(), v.clone())),
        })
        .collect();

    Ok(ChatRequest {
        messages,
        stream,
        model,
        params,
    })
}

fn normalize_message(index: usize, item: &Value) -> Result<ChatMessage> {
    let msg = item.as_object().ok_or_else(|| {
        ProxyError::validation(format!("messages[{}] must be an object", index))
    })?;

    let role = match msg.get("role") {
        None | Some(Value::Null) => {
            return Err(ProxyError::validation(format!(
                "messages[{}] is missing 'role'",
                index
            )))
        }
        Some(Value::String(name)) => Role::from_name(name).ok_or_else(|| {
            ProxyError::validation(format!(
                "messages[{}].role '{}' is not one of system, user, assistant",
                index, name
            ))
        })?,
        Some(_) => {
            return Err(ProxyError::validation(format!(
                "messages[{}].role must be a string",
                index
            )))
        }
    };

    let content = match msg.get("content") {
        None | Some(Value::Null) => {
            return Err(ProxyError::validation(format!(
                "messages[{}] is missing 'content'",
                index
            )))
        }
        Some(Value::String(text)) => text.clone(),
        Some(_) => {
            return Err(ProxyError::validation(format!(
                "messages[{}].content must be a string",
                index
            )))
        }
    };

    Ok(ChatMessage::new(role, content))
}

/// Absent or null means `false`. Numbers are truthy when non-zero, and the
/// strings "true"/"false"/"1"/"0" are accepted.
fn coerce_stream(value: Option<&Value>) -> Result<bool> {
    match value {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(b)) => Ok(*b),
        Some(Value::Number(n)) => Ok(n.as_f64().is_some_and(|f| f != 0.0)),
        Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" | "" => Ok(false),
            _ => Err(ProxyError::validation(format!(
                "'stream' must be a boolean, got \"{}\"",
                s
            ))),
        },
        Some(_) => Err(ProxyError::validation("'stream' must be a boolean")),
    }
}

/// Resolve the backend model name: explicit alias, then the name as given,
/// then the configured default.
pub fn resolve_model<S: BuildHasher>(
    requested: Option<&str>,
    model_map: &HashMap<String, String, S>,
    default_model: &str,
) -> String {
    match requested {
        Some(name) => model_map
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string()),
        None => default_model.to_string(),
    }
}

/// Build the OpenAI-shaped body sent to the backend.
pub fn to_upstream<S: BuildHasher>(
    req: &ChatRequest,
    backend: &BackendConfig,
    model_map: &HashMap<String, String, S>,
    drop: &[String],
) -> ChatCompletionRequest {
    let params = req
        .params
        .iter()
        .filter(|(key, _)| !drop.iter().any(|d| d == *key))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    ChatCompletionRequest {
        model: resolve_model(req.model.as_deref(), model_map, &backend.model),
        messages: req.messages.clone(),
        stream: req.stream,
        stream_options: req.stream.then_some(StreamOptions {
            include_usage: true,
        }),
        params,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn error_message(body: Value) -> String {
        match normalize(&body) {
            Err(ProxyError::Validation { message }) => message,
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_preserves_message_order() {
        let req = normalize(&json!({
            "messages": [
                {"role": "system", "content": "You are a RHEL assistant."},
                {"role": "user", "content": "first"},
                {"role": "assistant", "content": "second"},
                {"role": "user", "content": "third"}
            ]
        }))
        .unwrap();

        let contents: Vec<&str> = req.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(
            contents,
            vec!["You are a RHEL assistant.", "first", "second", "third"]
        );
        assert_eq!(req.messages[0].role, Role::System);
        assert_eq!(req.messages[2].role, Role::Assistant);
    }

    #[test]
    fn test_missing_or_empty_messages_rejected() {
        assert!(error_message(json!({"stream": false})).contains("required"));
        assert!(error_message(json!({"messages": null})).contains("required"));
        assert!(error_message(json!({"messages": []})).contains("empty"));
        assert!(error_message(json!({"messages": "hello"})).contains("array"));
    }

    #[test]
    fn test_bad_messages_rejected() {
        assert!(error_message(json!({"messages": [{"content": "x"}]})).contains("'role'"));
        assert!(error_message(json!({"messages": [{"role": "user"}]})).contains("'content'"));
        assert!(
            error_message(json!({"messages": [{"role": "tool", "content": "x"}]}))
                .contains("not one of")
        );
        assert!(error_message(json!({"messages": [42]})).contains("must be an object"));
        assert!(
            error_message(json!({"messages": [{"role": "user", "content": ["x"]}]}))
                .contains("must be a string")
        );
    }

    #[test]
    fn test_stream_defaults_to_false() {
        let absent = normalize(&json!({"messages": [{"role": "user", "content": "x"}]})).unwrap();
        let explicit = normalize(&json!({
            "messages": [{"role": "user", "content": "x"}],
            "stream": false
        }))
        .unwrap();
        let null = normalize(&json!({
            "messages": [{"role": "user", "content": "x"}],
            "stream": null
        }))
        .unwrap();

        assert_eq!(absent, explicit);
        assert_eq!(absent, null);
        assert!(!absent.stream);
    }

    #[test]
    fn test_stream_coercion() {
        let msgs = json!([{"role": "user", "content": "x"}]);
        for (raw, expected) in [
            (json!(true), true),
            (json!(1), true),
            (json!(0), false),
            (json!("true"), true),
            (json!("False"), false),
        ] {
            let req = normalize(&json!({"messages": msgs.clone(), "stream": raw})).unwrap();
            assert_eq!(req.stream, expected, "stream={}", raw);
        }
        assert!(error_message(json!({"messages": msgs.clone(), "stream": "maybe"})).contains("boolean"));
        assert!(error_message(json!({"messages": msgs.clone(), "stream": {}})).contains("boolean"));
    }

    #[test]
    fn test_unknown_fields_ignored_and_params_captured() {
        let req = normalize(&json!({
            "messages": [{"role": "user", "content": "x", "name": "ignored"}],
            "model": "gpt-4o",
            "temperature": 0.3,
            "max_tokens": 256,
            "tools": [{"type": "function"}],
            "x_custom": true
        }))
        .unwrap();

        assert_eq!(req.model.as_deref(), Some("gpt-4o"));
        assert_eq!(req.params.len(), 2);
        assert_eq!(req.params["temperature"], 0.3);
        assert!(!req.params.contains_key("tools"));
    }

    #[test]
    fn test_non_object_body_rejected() {
        assert!(error_message(json!([1, 2])).contains("JSON object"));
        assert!(matches!(
            parse_body(b"{not json"),
            Err(ProxyError::Validation { .. })
        ));
    }

    #[test]
    fn test_upstream_body() {
        let req = normalize(&json!({
            "messages": [{"role": "user", "content": "x"}],
            "model": "gpt-4o",
            "stream": true,
            "temperature": 0.1,
            "logit_bias": {"50256": -100}
        }))
        .unwrap();

        let mut model_map = HashMap::new();
        model_map.insert("gpt-4o".to_string(), "granite-3-8b".to_string());
        let backend = BackendConfig::default();

        let body = to_upstream(&req, &backend, &model_map, &["logit_bias".to_string()]);
        assert_eq!(body.model, "granite-3-8b");
        assert!(body.stream);
        assert!(body.stream_options.unwrap().include_usage);
        assert!(body.params.contains_key("temperature"));
        assert!(!body.params.contains_key("logit_bias"));
    }

    #[test]
    fn test_model_resolution() {
        let map: HashMap<String, String> = HashMap::new();
        assert_eq!(resolve_model(None, &map, "granite"), "granite");
        assert_eq!(resolve_model(Some("llama"), &map, "granite"), "llama");
    }
}
