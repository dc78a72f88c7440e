//! Decode batch staging
//!
//! [`Batch`] owns one engine-allocated `llama_batch` and frees it on drop,
//! whichever way the request ends.

use crate::inference::engine::{Engine, EngineError};
use crate::inference::ffi::{llama_batch, llama_pos, llama_token};

pub struct Batch<'e> {
    engine: &'e dyn Engine,
    raw: llama_batch,
    capacity: usize,
}

impl<'e> Batch<'e> {
    /// Allocates storage for `capacity` token slots.
    ///
    /// `embd > 0` asks for embedding storage instead of token ids; such a
    /// batch cannot be filled with tokens.
    pub fn allocate(
        engine: &'e dyn Engine,
        capacity: usize,
        embd: usize,
        n_seq_max: usize,
    ) -> Result<Self, EngineError> {
        let n_tokens = i32::try_from(capacity)
            .ok()
            .filter(|&n| n > 0)
            .ok_or_else(|| EngineError::Allocation(format!("invalid capacity {capacity}")))?;
        let embd_dim = i32::try_from(embd)
            .map_err(|_| EngineError::Allocation(format!("invalid embedding size {embd}")))?;
        let n_seq = i32::try_from(n_seq_max.max(1)).unwrap_or(1);

        let batch = Self {
            engine,
            raw: engine.batch_init(n_tokens, embd_dim, n_seq),
            capacity,
        };

        let raw = &batch.raw;
        let storage_missing = if embd > 0 {
            raw.embd.is_null()
        } else {
            raw.token.is_null()
        };
        if storage_missing
            || raw.pos.is_null()
            || raw.n_seq_id.is_null()
            || raw.seq_id.is_null()
            || raw.logits.is_null()
        {
            // `batch` drops here, which still hands the struct back to the engine
            return Err(EngineError::Allocation(format!(
                "engine returned no storage for {capacity} slots"
            )));
        }

        Ok(batch)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Logical length (`n_tokens`)
    pub fn len(&self) -> usize {
        self.raw.n_tokens as usize
    }

    pub fn is_empty(&self) -> bool {
        self.raw.n_tokens == 0
    }

    pub(crate) fn raw(&self) -> llama_batch {
        self.raw
    }

    fn ensure_tokens(&self) -> Result<(), EngineError> {
        if self.raw.token.is_null() {
            return Err(EngineError::Allocation(
                "batch holds embeddings, not token ids".to_string(),
            ));
        }
        Ok(())
    }

    /// # Safety
    ///
    /// `i < capacity` and the batch holds token storage.
    unsafe fn write_slot(&mut self, i: usize, token: llama_token, pos: llama_pos, logits: bool) {
        *self.raw.token.add(i) = token;
        *self.raw.pos.add(i) = pos;
        *self.raw.n_seq_id.add(i) = 1;
        *(*self.raw.seq_id.add(i)) = 0;
        *self.raw.logits.add(i) = i8::from(logits);
    }

    /// Stages the whole prompt: position = index, sequence 0, logits only for
    /// the last slot.
    pub fn fill_prefill(&mut self, tokens: &[llama_token]) -> Result<(), EngineError> {
        self.ensure_tokens()?;
        if tokens.len() > self.capacity {
            return Err(EngineError::PromptTooLong {
                tokens: tokens.len(),
                capacity: self.capacity,
            });
        }

        let last = tokens.len().saturating_sub(1);
        for (i, &token) in tokens.iter().enumerate() {
            // SAFETY: i < tokens.len() <= capacity
            unsafe { self.write_slot(i, token, i as llama_pos, i == last) };
        }
        self.raw.n_tokens = tokens.len() as i32;
        Ok(())
    }

    /// Stages a single token at slot 0 with logits requested.
    pub fn fill_step(&mut self, token: llama_token, pos: llama_pos) -> Result<(), EngineError> {
        self.ensure_tokens()?;
        // SAFETY: capacity >= 1 is checked at allocation
        unsafe { self.write_slot(0, token, pos, true) };
        self.raw.n_tokens = 1;
        Ok(())
    }
}

impl Drop for Batch<'_> {
    fn drop(&mut self) {
        self.engine.batch_free(self.raw);
    }
}
