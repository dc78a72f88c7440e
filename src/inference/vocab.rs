//! Tokenizer entry points
//!
//! Both `llama_tokenize` and `llama_token_to_piece` report a too-small output
//! buffer as a negative count whose magnitude is the size they need.

use crate::inference::engine::{Engine, EngineError};
use crate::inference::ffi::{llama_token, VocabPtr};

/// A model's vocabulary, borrowed for the duration of a request.
#[derive(Clone, Copy)]
pub struct Vocab<'e> {
    engine: &'e dyn Engine,
    ptr: VocabPtr,
}

impl<'e> Vocab<'e> {
    pub fn new(engine: &'e dyn Engine, ptr: VocabPtr) -> Self {
        Self { engine, ptr }
    }

    pub fn n_tokens(&self) -> i32 {
        self.engine.vocab_n_tokens(self.ptr)
    }

    pub fn eos(&self) -> llama_token {
        self.engine.vocab_eos(self.ptr)
    }

    /// Tokenizes `text` into a buffer of `capacity` ids.
    ///
    /// A too-small buffer is retried exactly once with the size the engine
    /// asked for; if that still is not enough the call fails with
    /// [`EngineError::TokenizeBufferTooSmall`].
    pub fn tokenize(
        &self,
        text: &str,
        capacity: usize,
        add_special: bool,
        parse_special: bool,
    ) -> Result<Vec<llama_token>, EngineError> {
        let mut tokens = vec![0; capacity];
        let n = self.engine.tokenize(
            self.ptr,
            text.as_bytes(),
            &mut tokens,
            add_special,
            parse_special,
        );

        let written = if n < 0 {
            let required = n.unsigned_abs() as usize;
            tracing::debug!(capacity, required, "token buffer too small, retrying");

            tokens = vec![0; required];
            let retried = self.engine.tokenize(
                self.ptr,
                text.as_bytes(),
                &mut tokens,
                add_special,
                parse_special,
            );
            if retried < 0 {
                return Err(EngineError::TokenizeBufferTooSmall {
                    capacity: required,
                    required: retried.unsigned_abs() as usize,
                });
            }
            retried as usize
        } else {
            n as usize
        };

        tokens.truncate(written);
        Ok(tokens)
    }

    /// Raw bytes of one token. Probes with an empty buffer first, then decodes
    /// into a buffer of exactly the reported size. An empty piece is valid.
    ///
    /// Pieces are bytes, not text: a multi-byte character may be split across
    /// consecutive tokens.
    pub fn piece(&self, token: llama_token, render_special: bool) -> Result<Vec<u8>, EngineError> {
        let probe = self
            .engine
            .token_to_piece(self.ptr, token, &mut [], 0, render_special);
        if probe >= 0 {
            return Ok(Vec::new());
        }

        let mut bytes = vec![0u8; probe.unsigned_abs() as usize];
        let n = self
            .engine
            .token_to_piece(self.ptr, token, &mut bytes, 0, render_special);
        if n < 0 {
            return Err(EngineError::Detokenize {
                token,
                required: n.unsigned_abs() as usize,
            });
        }

        bytes.truncate(n as usize);
        Ok(bytes)
    }
}
