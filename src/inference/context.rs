//! Per-request compute context

use crate::inference::batch::Batch;
use crate::inference::engine::{Engine, EngineError};
use crate::inference::ffi::{ContextPtr, ModelPtr};

/// Context sizing and threading for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextOptions {
    /// Context window, also used as the logical batch size
    pub n_ctx: u32,
    pub n_threads: i32,
    pub n_threads_batch: i32,
}

/// Owns one native context; freed on drop.
pub struct Context<'e> {
    engine: &'e dyn Engine,
    ptr: ContextPtr,
}

impl<'e> Context<'e> {
    pub fn create(
        engine: &'e dyn Engine,
        model: ModelPtr,
        options: ContextOptions,
    ) -> Result<Self, EngineError> {
        let mut params = engine.context_default_params();
        params.n_ctx = options.n_ctx;
        // the whole prompt goes through one decode call
        params.n_batch = options.n_ctx;
        params.n_threads = options.n_threads;
        params.n_threads_batch = options.n_threads_batch;

        let ptr = engine.new_context(model, params).ok_or_else(|| {
            EngineError::ContextCreate(format!(
                "engine returned no context (n_ctx = {})",
                options.n_ctx
            ))
        })?;

        tracing::debug!(
            n_ctx = options.n_ctx,
            n_threads = options.n_threads,
            "context created"
        );
        Ok(Self { engine, ptr })
    }

    /// Runs one forward pass over `batch`.
    pub fn decode(&mut self, batch: &Batch<'_>, position: u32) -> Result<(), EngineError> {
        match self.engine.decode(self.ptr, batch.raw()) {
            0 => Ok(()),
            code => Err(EngineError::Decode { code, position }),
        }
    }

    /// Logits row of the last flagged slot; `None` if the engine has none.
    pub fn logits(&self, n_vocab: usize) -> Option<&[f32]> {
        let ptr = self.engine.logits(self.ptr);
        if ptr.is_null() {
            return None;
        }
        // SAFETY: the engine keeps `n_vocab` floats behind the pointer until
        // the next decode, which needs `&mut self`.
        Some(unsafe { std::slice::from_raw_parts(ptr, n_vocab) })
    }
}

impl Drop for Context<'_> {
    fn drop(&mut self) {
        self.engine.free_context(self.ptr);
    }
}
