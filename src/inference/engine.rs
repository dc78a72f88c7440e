//! Native engine contract
//!
//! [`Engine`] mirrors the llama.cpp entry points this crate consumes, one
//! method per foreign function. Everything above it (batch staging, the
//! generation loop, the worker) is written against the trait, so the same
//! code drives the real shared library ([`NativeEngine`]) or an in-process
//! stand-in.
//!
//! # Architecture
//!
//! Integer and pointer results are passed through unchanged: negative
//! "required size" returns from `tokenize`/`token_to_piece`, non-zero decode
//! codes and null handles are interpreted by the callers, which turn them
//! into [`EngineError`] values.
//!
//! [`NativeEngine`]: crate::inference::native::NativeEngine

use thiserror::Error;

use crate::inference::ffi::{
    llama_batch, llama_context_params, llama_model_params, llama_token, ContextPtr, ModelPtr,
    VocabPtr,
};
use crate::inference::model::ModelError;

/// Errors that can occur while driving the native engine
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    /// The shared library or one of its symbols could not be resolved.
    #[error("Failed to bind native engine ({target}): {reason}")]
    EngineBinding { target: String, reason: String },

    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Failed to create context: {0}")]
    ContextCreate(String),

    #[error("Tokenizer needed {required} slots after retrying with {capacity}")]
    TokenizeBufferTooSmall { capacity: usize, required: usize },

    #[error("Prompt is {tokens} tokens but the batch holds {capacity}")]
    PromptTooLong { tokens: usize, capacity: usize },

    #[error("Prompt produced no tokens")]
    EmptyPrompt,

    #[error("Failed to detokenize token {token}: needed {required} bytes")]
    Detokenize { token: llama_token, required: usize },

    #[error("Batch allocation failed: {0}")]
    Allocation(String),

    #[error("Decode failed at position {position} (code {code})")]
    Decode { code: i32, position: u32 },

    #[error("No logits available at position {position}")]
    MissingLogits { position: u32 },

    #[error("Sampler returned no token at position {position}")]
    Sampling { position: u32 },

    #[error("Worker thread error: {0}")]
    Worker(String),
}

impl From<ModelError> for EngineError {
    fn from(e: ModelError) -> Self {
        EngineError::ModelLoad(e.to_string())
    }
}

/// The foreign entry points of the inference engine.
///
/// Implementations forward straight to native code; handles must come from
/// the same engine and must not be used after their free call.
pub trait Engine: Send + Sync {
    /// Initializes the compute backend. Must be idempotent: only the first
    /// call reaches the engine.
    fn backend_init(&self);

    fn model_default_params(&self) -> llama_model_params;

    /// Returns `None` when the engine hands back a null model.
    fn load_model_from_file(&self, path: &std::ffi::CStr, params: llama_model_params)
        -> Option<ModelPtr>;

    fn free_model(&self, model: ModelPtr);

    fn model_vocab(&self, model: ModelPtr) -> Option<VocabPtr>;

    fn context_default_params(&self) -> llama_context_params;

    /// Returns `None` when the engine hands back a null context.
    fn new_context(&self, model: ModelPtr, params: llama_context_params) -> Option<ContextPtr>;

    fn free_context(&self, ctx: ContextPtr);

    fn vocab_n_tokens(&self, vocab: VocabPtr) -> i32;

    fn vocab_eos(&self, vocab: VocabPtr) -> llama_token;

    /// Writes at most `out.len()` ids. Returns the count written, or the
    /// negated required size when `out` is too small.
    fn tokenize(
        &self,
        vocab: VocabPtr,
        text: &[u8],
        out: &mut [llama_token],
        add_special: bool,
        parse_special: bool,
    ) -> i32;

    /// Writes at most `out.len()` bytes. Returns the count written, or the
    /// negated required size when `out` is too small.
    fn token_to_piece(
        &self,
        vocab: VocabPtr,
        token: llama_token,
        out: &mut [u8],
        lstrip: i32,
        special: bool,
    ) -> i32;

    fn batch_init(&self, n_tokens: i32, embd: i32, n_seq_max: i32) -> llama_batch;

    fn batch_free(&self, batch: llama_batch);

    /// 0 on success.
    fn decode(&self, ctx: ContextPtr, batch: llama_batch) -> i32;

    /// Logits of the most recent logits-flagged slot, `n_vocab` floats.
    /// Null when the last decode produced none.
    fn logits(&self, ctx: ContextPtr) -> *const f32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_error_converts_to_load_failure() {
        let err: EngineError = ModelError::FileTooSmall.into();
        assert!(matches!(err, EngineError::ModelLoad(_)));
        assert!(err.to_string().contains("too small"));
    }

    #[test]
    fn test_decode_error_message() {
        let err = EngineError::Decode {
            code: 1,
            position: 7,
        };
        assert_eq!(err.to_string(), "Decode failed at position 7 (code 1)");
    }
}
