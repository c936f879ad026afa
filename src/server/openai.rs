//! OpenAI-compatible completion endpoints.
//!
//! Minimal request/response shaping: id, object, created, choices, usage,
//! finish_reason, and the standard error body. Streaming responses are
//! SSE chunks terminated by `[DONE]`; a backend failure mid-stream is
//! reported as an explicit error payload, never a silent cutoff.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};

use crate::lifecycle::AcquireError;
use crate::router::{
    ChatMessage, ChatRole, GenerationParams, PromptInput, ServeError, StreamEvent, Usage,
};
use crate::Gateway;

fn default_max_tokens() -> u32 {
    256
}

fn default_temperature() -> f32 {
    0.7
}

fn default_top_p() -> f32 {
    0.9
}

/// Accepts both the string and list forms of the OpenAI `stop` field.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum StopField {
    One(String),
    Many(Vec<String>),
}

impl StopField {
    fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(s) => vec![s],
            Self::Many(v) => v,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessageInput>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default)]
    pub stop: Option<StopField>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Deserialize)]
pub struct ChatMessageInput {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub prompt: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default)]
    pub stop: Option<StopField>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Serialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    pub usage: Usage,
}

#[derive(Serialize)]
pub struct ChatChoice {
    pub index: u32,
    pub message: ChatMessageOutput,
    pub finish_reason: &'static str,
}

#[derive(Serialize)]
pub struct ChatMessageOutput {
    pub role: &'static str,
    pub content: String,
}

#[derive(Serialize)]
pub struct CompletionResponse {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    pub usage: Usage,
}

#[derive(Serialize)]
pub struct CompletionChoice {
    pub index: u32,
    pub text: String,
    pub finish_reason: &'static str,
}

#[derive(Serialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChatChoiceDelta>,
}

#[derive(Serialize)]
pub struct ChatChoiceDelta {
    pub index: u32,
    pub delta: Delta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<&'static str>,
}

#[derive(Serialize)]
pub struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub message: String,
    pub r#type: &'static str,
}

/// Map a core error onto an HTTP status and OpenAI error body.
pub fn error_response(err: &ServeError) -> (StatusCode, Json<ErrorResponse>) {
    let (status, kind) = match err {
        ServeError::Acquire(AcquireError::NotFound(_)) => {
            (StatusCode::NOT_FOUND, "invalid_request_error")
        }
        ServeError::Acquire(AcquireError::CapacityExceeded { .. }) => {
            (StatusCode::SERVICE_UNAVAILABLE, "server_error")
        }
        ServeError::Acquire(AcquireError::ModelLoadFailed { .. }) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "server_error")
        }
        ServeError::Acquire(AcquireError::EngineUnhealthy(_)) => {
            (StatusCode::SERVICE_UNAVAILABLE, "server_error")
        }
        ServeError::Acquire(AcquireError::Timeout(_)) => {
            (StatusCode::GATEWAY_TIMEOUT, "server_error")
        }
        ServeError::Generation(_) => (StatusCode::INTERNAL_SERVER_ERROR, "server_error"),
        ServeError::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, "server_error"),
    };
    (
        status,
        Json(ErrorResponse {
            error: ErrorDetail {
                message: err.to_string(),
                r#type: kind,
            },
        }),
    )
}

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn to_params(
    messages: Vec<ChatMessageInput>,
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
    stop: Option<StopField>,
) -> GenerationParams {
    let messages = messages
        .into_iter()
        .map(|m| ChatMessage {
            role: ChatRole::parse_lossy(&m.role),
            content: m.content,
        })
        .collect();
    GenerationParams {
        input: PromptInput::Messages(messages),
        max_tokens,
        temperature,
        top_p,
        stop: stop.map(StopField::into_vec).unwrap_or_default(),
    }
}

pub async fn chat_completions(
    State(gateway): State<Arc<Gateway>>,
    Json(request): Json<ChatCompletionRequest>,
) -> Response {
    let model = request.model.clone();
    let stream = request.stream;
    let params = to_params(
        request.messages,
        request.max_tokens,
        request.temperature,
        request.top_p,
        request.stop,
    );

    match gateway.serve(&model, params).await {
        Ok(generation) => {
            if stream {
                stream_chat_response(model, generation).into_response()
            } else {
                match generation.collect().await {
                    Ok(done) => Json(ChatCompletionResponse {
                        id: format!("chatcmpl-{}", done.session_id.simple()),
                        object: "chat.completion",
                        created: unix_now(),
                        model: done.model,
                        choices: vec![ChatChoice {
                            index: 0,
                            message: ChatMessageOutput {
                                role: "assistant",
                                content: done.text,
                            },
                            finish_reason: done.finish.as_str(),
                        }],
                        usage: done.usage,
                    })
                    .into_response(),
                    Err(e) => {
                        tracing::error!(model = %model, error = %e, "chat completion failed");
                        error_response(&e).into_response()
                    }
                }
            }
        }
        Err(e) => {
            tracing::warn!(model = %model, error = %e, "request rejected");
            error_response(&e).into_response()
        }
    }
}

pub async fn completions(
    State(gateway): State<Arc<Gateway>>,
    Json(request): Json<CompletionRequest>,
) -> Response {
    let model = request.model.clone();
    let params = GenerationParams {
        input: PromptInput::Raw(request.prompt),
        max_tokens: request.max_tokens,
        temperature: request.temperature,
        top_p: request.top_p,
        stop: request.stop.map(StopField::into_vec).unwrap_or_default(),
    };

    match gateway.serve(&model, params).await {
        Ok(generation) => {
            if request.stream {
                stream_chat_response(model, generation).into_response()
            } else {
                match generation.collect().await {
                    Ok(done) => Json(CompletionResponse {
                        id: format!("cmpl-{}", done.session_id.simple()),
                        object: "text_completion",
                        created: unix_now(),
                        model: done.model,
                        choices: vec![CompletionChoice {
                            index: 0,
                            text: done.text,
                            finish_reason: done.finish.as_str(),
                        }],
                        usage: done.usage,
                    })
                    .into_response(),
                    Err(e) => {
                        tracing::error!(model = %model, error = %e, "completion failed");
                        error_response(&e).into_response()
                    }
                }
            }
        }
        Err(e) => {
            tracing::warn!(model = %model, error = %e, "request rejected");
            error_response(&e).into_response()
        }
    }
}

fn stream_chat_response(
    model: String,
    mut generation: crate::router::GenerationStream,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let id = format!("chatcmpl-{}", generation.session_id().simple());
    let created = unix_now();

    let stream = async_stream::stream! {
        // Opening chunk carries the assistant role.
        let first = ChatCompletionChunk {
            id: id.clone(),
            object: "chat.completion.chunk",
            created,
            model: model.clone(),
            choices: vec![ChatChoiceDelta {
                index: 0,
                delta: Delta { role: Some("assistant"), content: None },
                finish_reason: None,
            }],
        };
        yield Ok(sse_json(&first));

        while let Some(event) = generation.next_event().await {
            match event {
                StreamEvent::Token(text) => {
                    let chunk = ChatCompletionChunk {
                        id: id.clone(),
                        object: "chat.completion.chunk",
                        created,
                        model: model.clone(),
                        choices: vec![ChatChoiceDelta {
                            index: 0,
                            delta: Delta { role: None, content: Some(text) },
                            finish_reason: None,
                        }],
                    };
                    yield Ok(sse_json(&chunk));
                }
                StreamEvent::Done { finish, .. } => {
                    let chunk = ChatCompletionChunk {
                        id: id.clone(),
                        object: "chat.completion.chunk",
                        created,
                        model: model.clone(),
                        choices: vec![ChatChoiceDelta {
                            index: 0,
                            delta: Delta { role: None, content: None },
                            finish_reason: Some(finish.as_str()),
                        }],
                    };
                    yield Ok(sse_json(&chunk));
                }
                StreamEvent::Error { message } => {
                    tracing::error!(error = %message, "stream terminated by backend failure");
                    let payload = ErrorResponse {
                        error: ErrorDetail { message, r#type: "server_error" },
                    };
                    yield Ok(sse_json(&payload));
                }
            }
        }

        yield Ok(Event::default().data("[DONE]"));
    };

    Sse::new(stream)
}

fn sse_json<T: Serialize>(payload: &T) -> Event {
    match serde_json::to_string(payload) {
        Ok(body) => Event::default().data(body),
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize sse payload");
            Event::default().data("{}")
        }
    }
}
