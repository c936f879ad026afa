//! Generation router: drives one generation per acquired handle.
//!
//! Sits between the request surface and the engine adapters. Acquires a
//! lease from the lifecycle manager, starts the adapter's token stream,
//! maps backend-native stop conditions onto the uniform finish vocabulary,
//! and guarantees the lease is released exactly once however the session
//! ends: completion, backend error, or client disconnect.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::engine::{FinishReason, GenerationRequest, TokenEvent};
use crate::lifecycle::{AcquireError, LifecycleManager, ModelLease};
use crate::shutdown::SessionGuard;

/// Errors surfaced by [`GenerationRouter::serve`].
#[derive(Debug, Error)]
pub enum ServeError {
    #[error(transparent)]
    Acquire(#[from] AcquireError),

    #[error("generation failed: {0}")]
    Generation(String),

    #[error("gateway is shutting down")]
    ShuttingDown,
}

/// Chat roles understood by the prompt renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatRole {
    /// Map a wire-format role string; unknown roles act as user turns.
    pub fn parse_lossy(s: &str) -> Self {
        match s {
            "system" => Self::System,
            "assistant" => Self::Assistant,
            _ => Self::User,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

/// Request input: a raw prompt or a chat transcript.
#[derive(Debug, Clone)]
pub enum PromptInput {
    Raw(String),
    Messages(Vec<ChatMessage>),
}

impl PromptInput {
    /// Render to the flat prompt the adapters consume.
    pub fn render(&self) -> String {
        match self {
            Self::Raw(prompt) => prompt.clone(),
            Self::Messages(messages) => {
                let mut parts = Vec::with_capacity(messages.len() + 1);
                for message in messages {
                    let prefix = match message.role {
                        ChatRole::System => "System",
                        ChatRole::User => "User",
                        ChatRole::Assistant => "Assistant",
                    };
                    parts.push(format!("{}: {}", prefix, message.content));
                }
                parts.push("Assistant:".to_string());
                parts.join("\n")
            }
        }
    }
}

/// Sampling and shaping parameters for one request.
#[derive(Debug, Clone)]
pub struct GenerationParams {
    pub input: PromptInput,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub stop: Vec<String>,
}

impl GenerationParams {
    pub fn from_prompt(prompt: impl Into<String>) -> Self {
        Self {
            input: PromptInput::Raw(prompt.into()),
            max_tokens: 256,
            temperature: 0.7,
            top_p: 0.9,
            stop: Vec::new(),
        }
    }

    pub fn from_messages(messages: Vec<ChatMessage>) -> Self {
        Self {
            input: PromptInput::Messages(messages),
            max_tokens: 256,
            temperature: 0.7,
            top_p: 0.9,
            stop: Vec::new(),
        }
    }
}

/// Token accounting for one session.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// One item of a generation stream, as seen by the request surface.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Token(String),
    Done { finish: FinishReason, usage: Usage },
    Error { message: String },
}

/// Result of buffering a full non-streaming generation.
#[derive(Debug, Clone)]
pub struct CompletedGeneration {
    pub session_id: Uuid,
    pub model: String,
    pub text: String,
    pub finish: FinishReason,
    pub usage: Usage,
}

/// A live generation session bound to one model lease.
///
/// The lease (and the shutdown guard, when attached) is dropped exactly
/// once: on the terminal event, or on drop if the client disconnects
/// mid-stream. Dropping the stream also closes the adapter channel, which
/// stops the producer cooperatively.
#[derive(Debug)]
pub struct GenerationStream {
    session_id: Uuid,
    model: String,
    lease: Option<ModelLease>,
    shutdown_guard: Option<SessionGuard>,
    rx: mpsc::Receiver<TokenEvent>,
    prompt_tokens: u32,
    completion_tokens: u32,
    finish: Option<FinishReason>,
    done: bool,
}

impl GenerationStream {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish
    }

    pub fn usage(&self) -> Usage {
        Usage {
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
            total_tokens: self.prompt_tokens + self.completion_tokens,
        }
    }

    pub(crate) fn attach_shutdown_guard(&mut self, guard: SessionGuard) {
        self.shutdown_guard = Some(guard);
    }

    /// Next stream event; `None` after the terminal event has been
    /// delivered. A producer that vanishes without a terminal event is
    /// reported as a backend error, never a silent cutoff.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        if self.done {
            return None;
        }

        match self.rx.recv().await {
            Some(TokenEvent::Token(text)) => {
                self.completion_tokens += 1;
                Some(StreamEvent::Token(text))
            }
            Some(TokenEvent::Done {
                finish,
                completion_tokens,
            }) => {
                self.completion_tokens = completion_tokens;
                self.finish = Some(finish);
                self.close();
                Some(StreamEvent::Done {
                    finish,
                    usage: self.usage(),
                })
            }
            Some(TokenEvent::Error(message)) => {
                self.finish = Some(FinishReason::Error);
                self.close();
                Some(StreamEvent::Error { message })
            }
            None => {
                self.finish = Some(FinishReason::Error);
                self.close();
                Some(StreamEvent::Error {
                    message: "backend stream ended unexpectedly".to_string(),
                })
            }
        }
    }

    /// Buffer the whole sequence for a non-streaming response.
    pub async fn collect(mut self) -> Result<CompletedGeneration, ServeError> {
        let mut text = String::new();
        while let Some(event) = self.next_event().await {
            match event {
                StreamEvent::Token(piece) => text.push_str(&piece),
                StreamEvent::Done { finish, usage } => {
                    return Ok(CompletedGeneration {
                        session_id: self.session_id,
                        model: self.model.clone(),
                        text,
                        finish,
                        usage,
                    });
                }
                StreamEvent::Error { message } => {
                    return Err(ServeError::Generation(message));
                }
            }
        }
        Err(ServeError::Generation(
            "stream closed without a finish event".to_string(),
        ))
    }

    fn close(&mut self) {
        self.done = true;
        // Release the reference and the admission slot exactly here; Drop
        // covers the cancellation path.
        self.lease.take();
        self.shutdown_guard.take();
    }
}

/// Routes generations onto leased model instances.
pub struct GenerationRouter {
    manager: Arc<LifecycleManager>,
}

impl GenerationRouter {
    pub fn new(manager: Arc<LifecycleManager>) -> Self {
        Self { manager }
    }

    /// Acquire a handle for `model` and start one generation on it.
    ///
    /// Blocks while the model is mid-load, up to the manager's acquire
    /// timeout. The returned stream yields tokens lazily; restarting means
    /// re-issuing the request.
    pub async fn serve(
        &self,
        model: &str,
        params: GenerationParams,
    ) -> Result<GenerationStream, ServeError> {
        let lease = self.manager.acquire(model).await?;
        let instance = lease.instance().clone();

        let adapter = self
            .manager
            .engines()
            .get(instance.engine_kind())
            .ok_or_else(|| {
                ServeError::Generation(format!(
                    "no adapter installed for {} engine",
                    instance.engine_kind()
                ))
            })?;

        let prompt = params.input.render();
        let prompt_tokens = estimate_prompt_tokens(&prompt);
        let request = GenerationRequest {
            prompt,
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            top_p: params.top_p,
            stop: params.stop,
        };

        let session_id = Uuid::new_v4();
        tracing::debug!(
            session = %session_id,
            model,
            engine = %instance.engine_kind(),
            max_tokens = request.max_tokens,
            "starting generation"
        );

        match adapter.generate(instance.handle(), request).await {
            Ok(rx) => Ok(GenerationStream {
                session_id,
                model: model.to_string(),
                lease: Some(lease),
                shutdown_guard: None,
                rx,
                prompt_tokens,
                completion_tokens: 0,
                finish: None,
                done: false,
            }),
            Err(e) => {
                // Lease drops here, returning the reference.
                Err(ServeError::Generation(e.to_string()))
            }
        }
    }
}

/// Coarse whitespace token estimate for usage reporting; backends do not
/// expose their prompt tokenization through the adapter contract.
fn estimate_prompt_tokens(prompt: &str) -> u32 {
    prompt.split_whitespace().count() as u32
}
