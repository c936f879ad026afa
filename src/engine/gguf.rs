//! llama-cpp-2 wrapper shared by the native engine adapters.
//!
//! One `GgufModel` owns one loaded set of weights plus the llama backend
//! that serves it. Generation runs on a blocking thread and pushes decoded
//! text fragments through the adapter's token channel; a dropped receiver
//! stops the loop cooperatively.

use std::num::NonZeroU32;
use std::path::Path;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;
use tokio::sync::mpsc;

use super::{EngineError, FinishReason, GenerationRequest, TokenEvent};

/// Backend creation parameters resolved by the owning adapter.
#[derive(Debug, Clone)]
pub struct GgufParams {
    pub n_ctx: u32,
    pub n_threads: u32,
    /// Layers offloaded to the device; 0 keeps everything on the CPU.
    pub n_gpu_layers: u32,
}

/// A loaded GGUF model and its llama backend.
pub struct GgufModel {
    backend: LlamaBackend,
    model: LlamaModel,
    n_ctx: u32,
    n_threads: i32,
}

// SAFETY: LlamaModel and LlamaBackend are Send+Sync in llama-cpp-2.
unsafe impl Send for GgufModel {}
unsafe impl Sync for GgufModel {}

impl GgufModel {
    /// Load weights from a GGUF file.
    pub fn load(path: &Path, params: &GgufParams) -> Result<Self, EngineError> {
        let backend = LlamaBackend::init()
            .map_err(|e| EngineError::LoadFailed(format!("backend init: {e}")))?;
        let model_params = LlamaModelParams::default().with_n_gpu_layers(params.n_gpu_layers);
        let model = LlamaModel::load_from_file(&backend, path, &model_params)
            .map_err(|e| EngineError::LoadFailed(format!("load {}: {e}", path.display())))?;
        Ok(Self {
            backend,
            model,
            n_ctx: params.n_ctx,
            n_threads: resolve_threads(params.n_threads),
        })
    }

    /// Weight memory reported by llama.cpp.
    pub fn size_bytes(&self) -> u64 {
        self.model.size() as u64
    }

    /// Run one generation on the calling (blocking) thread, pushing events
    /// into `tx`. Returns when the sequence finishes, the backend fails,
    /// or the receiver is dropped.
    pub fn generate_blocking(&self, request: &GenerationRequest, tx: &mpsc::Sender<TokenEvent>) {
        if let Err(message) = self.run_sample_loop(request, tx) {
            // Best effort: the receiver may already be gone.
            let _ = tx.blocking_send(TokenEvent::Error(message));
        }
    }

    fn run_sample_loop(
        &self,
        request: &GenerationRequest,
        tx: &mpsc::Sender<TokenEvent>,
    ) -> Result<(), String> {
        let tokens = self
            .model
            .str_to_token(&request.prompt, AddBos::Always)
            .map_err(|e| format!("tokenize: {e}"))?;

        let mut ctx = self.create_context().map_err(|e| e.to_string())?;
        let mut batch = LlamaBatch::new(tokens.len().max(1), 1);
        add_seq(&mut batch, &tokens).map_err(|e| e.to_string())?;
        decode(&mut ctx, &mut batch).map_err(|e| e.to_string())?;

        let mut sampler = build_sampler(request);
        sampler.accept_many(tokens.iter().copied());

        let mut decoder = encoding_rs::UTF_8.new_decoder();
        let mut accumulated = String::new();
        let mut emitted = 0usize;
        let mut generated = 0u32;
        let mut pos = tokens.len() as i32;

        loop {
            if generated >= request.max_tokens {
                let _ = tx.blocking_send(TokenEvent::Done {
                    finish: FinishReason::Length,
                    completion_tokens: generated,
                });
                return Ok(());
            }

            // -1 samples from the last token that had logits computed.
            let tok = sampler.sample(&ctx, -1);
            sampler.accept(tok);

            if self.model.is_eog_token(tok) {
                let _ = tx.blocking_send(TokenEvent::Done {
                    finish: FinishReason::Stop,
                    completion_tokens: generated,
                });
                return Ok(());
            }

            let piece = self
                .model
                .token_to_piece(tok, &mut decoder, false, None)
                .map_err(|e| format!("detokenize: {e}"))?;
            generated += 1;
            accumulated.push_str(&piece);

            // Stop-string check runs on the accumulated text so matches
            // split across token boundaries are still caught.
            if let Some(idx) = earliest_stop_match(&accumulated, &request.stop) {
                if idx > emitted {
                    let _ = tx.blocking_send(TokenEvent::Token(accumulated[emitted..idx].to_string()));
                }
                let _ = tx.blocking_send(TokenEvent::Done {
                    finish: FinishReason::Stop,
                    completion_tokens: generated,
                });
                return Ok(());
            }

            if tx.blocking_send(TokenEvent::Token(piece)).is_err() {
                // Receiver dropped: the session was cancelled.
                return Ok(());
            }
            emitted = accumulated.len();

            batch.clear();
            add_one(&mut batch, tok, pos).map_err(|e| e.to_string())?;
            decode(&mut ctx, &mut batch).map_err(|e| e.to_string())?;
            pos += 1;
        }
    }

    fn create_context(&self) -> Result<LlamaContext<'_>, EngineError> {
        let p = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(self.n_ctx))
            .with_n_threads(self.n_threads)
            .with_n_threads_batch(self.n_threads);
        self.model
            .new_context(&self.backend, p)
            .map_err(|e| EngineError::Generation(format!("context: {e}")))
    }
}

/// Byte index of the earliest stop-sequence match, if any.
fn earliest_stop_match(text: &str, stops: &[String]) -> Option<usize> {
    stops
        .iter()
        .filter(|s| !s.is_empty())
        .filter_map(|s| text.find(s.as_str()))
        .min()
}

fn add_seq(batch: &mut LlamaBatch, tokens: &[LlamaToken]) -> Result<(), EngineError> {
    // Only the last prompt token needs logits; the rest are prefill.
    let n = tokens.len();
    for (i, &tok) in tokens.iter().enumerate() {
        let logits = i + 1 == n;
        batch
            .add(tok, i as i32, &[0], logits)
            .map_err(|e| EngineError::Generation(format!("batch: {e}")))?;
    }
    Ok(())
}

fn add_one(batch: &mut LlamaBatch, tok: LlamaToken, pos: i32) -> Result<(), EngineError> {
    batch
        .add(tok, pos, &[0], true)
        .map_err(|e| EngineError::Generation(format!("batch: {e}")))
}

fn decode(ctx: &mut LlamaContext<'_>, batch: &mut LlamaBatch) -> Result<(), EngineError> {
    ctx.decode(batch)
        .map_err(|e| EngineError::Generation(format!("decode: {e}")))
}

fn build_sampler(request: &GenerationRequest) -> LlamaSampler {
    let mut chain = Vec::new();
    chain.push(LlamaSampler::top_p(request.top_p, 1));
    chain.push(LlamaSampler::temp(request.temperature));
    chain.push(LlamaSampler::dist(42));
    LlamaSampler::chain_simple(chain)
}

fn resolve_threads(n: u32) -> i32 {
    if n == 0 {
        // Memory-bound workload; cap to avoid diminishing returns on
        // high-core machines.
        let optimal = num_cpus::get().max(1).min(16);
        i32::try_from(optimal).unwrap_or(4)
    } else {
        i32::try_from(n).unwrap_or(4)
    }
}
