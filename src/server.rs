use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::logging::{LogLevel, SharedLogger};
use crate::translate::openai_types::ChatErrorResponse;
use crate::translate::request::parse_body;
use crate::translate::response::completion_response;
use crate::translate::streaming::{frame_stream, SseFrame, StreamTranslator};
use crate::upstream::Upstream;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::stream::StreamExt;
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub config: ProxyConfig,
    pub upstream: Arc<dyn Upstream>,
    pub logger: SharedLogger,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/v1/chat/completions", post(handle_chat_completions))
        .route("/v1/models", get(handle_models))
        .route("/health", get(handle_health))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn error_response(err: &ProxyError) -> Response {
    (err.status_code(), Json(ChatErrorResponse::from(err))).into_response()
}

async fn handle_chat_completions(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let request_id = format!("chatcmpl-{}", uuid::Uuid::new_v4().simple());

    let req = match parse_body(&body) {
        Ok(r) => r,
        Err(e) => {
            state
                .logger
                .request(LogLevel::Warn, &request_id, "server", e.to_string());
            return error_response(&e);
        }
    };

    let model = req
        .model
        .clone()
        .unwrap_or_else(|| state.config.backend.model.clone());
    let created = chrono::Utc::now().timestamp();

    tracing::info!(
        id = %request_id,
        model = %model,
        stream = req.stream,
        messages = req.messages.len(),
        "Chat completion request"
    );
    state.logger.request_with_context(
        LogLevel::Info,
        &request_id,
        "server",
        "Request received",
        serde_json::json!({
            "model": model,
            "stream": req.stream,
            "messages": req.messages.len(),
        }),
    );

    if req.stream {
        let chunks = match state.upstream.stream(&req).await {
            Ok(s) => s,
            Err(e) => return fail_before_headers(&state, &request_id, &e),
        };

        let translator = StreamTranslator::new(request_id.clone(), model, created);
        let logger = state.logger.clone();
        let events = frame_stream(chunks, translator).map(move |frame| {
            if frame.is_error() {
                logger.request(LogLevel::Error, &request_id, "stream", frame.data.clone());
            } else if frame.is_done() {
                logger.request(LogLevel::Info, &request_id, "stream", "Stream completed");
            }
            Ok::<_, Infallible>(to_event(frame))
        });

        Sse::new(events)
            .keep_alive(KeepAlive::default())
            .into_response()
    } else {
        match state.upstream.complete(&req).await {
            Ok(result) => {
                state.logger.request(
                    LogLevel::Info,
                    &request_id,
                    "server",
                    format!(
                        "Completed: finish_reason={} chars={}",
                        result.finish_reason.as_str(),
                        result.content.len()
                    ),
                );
                Json(completion_response(&result, &request_id, &model, created)).into_response()
            }
            Err(e) => fail_before_headers(&state, &request_id, &e),
        }
    }
}

fn fail_before_headers(state: &AppState, request_id: &str, err: &ProxyError) -> Response {
    tracing::warn!(id = %request_id, error = %err, "Upstream call failed");
    state
        .logger
        .request(LogLevel::Error, request_id, "upstream", err.to_string());
    error_response(err)
}

fn to_event(frame: SseFrame) -> Event {
    let event = Event::default().data(frame.data);
    match frame.event {
        Some(name) => event.event(name),
        None => event,
    }
}

async fn handle_models(State(state): State<Arc<AppState>>) -> Response {
    match state.upstream.models().await {
        Ok(models) => Json(models).into_response(),
        Err(e) => {
            state
                .logger
                .error("server", format!("Model listing failed: {}", e));
            error_response(&e)
        }
    }
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
