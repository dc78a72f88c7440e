//! Token generation loop
//!
//! [`Generation`] is a synchronous state machine over one request:
//!
//! ```text
//! Init ──> Prefill ──> Decoding ──┬──> Completed  (end-of-sequence or max length)
//!                                 ├──> Cancelled  (flag seen before a step)
//!                                 └──> Failed     (any engine error)
//! ```
//!
//! Each call to [`Generation::next_fragment`] runs the machine until it has
//! one fragment to hand out or reaches a terminal state. Context and batch
//! are released as soon as a terminal state is entered; the model never is.
//!
//! A sampled token is emitted first and decoded at the start of the next
//! call, so the engine only runs while someone is pulling fragments.

use crate::inference::batch::Batch;
use crate::inference::context::{Context, ContextOptions};
use crate::inference::engine::{Engine, EngineError};
use crate::inference::ffi::{llama_pos, llama_token, ModelPtr};
use crate::inference::sampler::Sampler;
use crate::inference::streaming::CancelHandle;
use crate::inference::vocab::Vocab;
use crate::storage::settings::BridgeSettings;

/// Final fragment of a cancelled request.
pub const CANCELLED_MARKER: &str = "[stopped by user]";

/// Why a generation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndOfSequence,
    MaxLength,
    Cancelled,
    Failed,
}

impl StopReason {
    /// True for the two natural endings.
    pub fn is_completed(&self) -> bool {
        matches!(self, StopReason::EndOfSequence | StopReason::MaxLength)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationState {
    Init,
    Prefill,
    Decoding,
    Completed,
    Cancelled,
    Failed,
}

impl GenerationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GenerationState::Completed | GenerationState::Cancelled | GenerationState::Failed
        )
    }
}

/// Per-request knobs, derived from [`BridgeSettings`].
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationConfig {
    pub context: ContextOptions,
    /// Upper bound on `prompt + generated` tokens, at most `context.n_ctx`
    pub max_length: u32,
    pub add_special: bool,
    pub parse_special: bool,
    pub render_special: bool,
}

fn available_threads() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

impl From<&BridgeSettings> for GenerationConfig {
    fn from(settings: &BridgeSettings) -> Self {
        let n_threads = settings
            .threads
            .map(|t| t as i32)
            .unwrap_or_else(available_threads);
        let n_threads_batch = settings
            .batch_threads
            .map(|t| t as i32)
            .unwrap_or(n_threads);
        let n_ctx = settings.context_size;

        Self {
            context: ContextOptions {
                n_ctx,
                n_threads,
                n_threads_batch,
            },
            max_length: settings.max_length.unwrap_or(n_ctx).min(n_ctx),
            add_special: settings.add_special,
            parse_special: settings.parse_special,
            render_special: settings.render_special,
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self::from(&BridgeSettings::default())
    }
}

// Field order is drop order: batch before context.
struct Active<'e> {
    batch: Batch<'e>,
    context: Context<'e>,
    vocab: Vocab<'e>,
    n_vocab: usize,
    eos: llama_token,
}

enum Step {
    Emit(String),
    Stop(StopReason),
}

/// One generation request over a loaded model.
///
/// The model behind `model` must outlive the generation.
pub struct Generation<'e> {
    engine: &'e dyn Engine,
    model: ModelPtr,
    prompt: String,
    config: GenerationConfig,
    sampler: Box<dyn Sampler + 'e>,
    cancel: CancelHandle,
    state: GenerationState,
    stop_reason: Option<StopReason>,
    active: Option<Active<'e>>,
    position: u32,
    generated: u32,
    pending_token: Option<llama_token>,
    utf8: Vec<u8>,
    // terminal item queued behind a flushed partial character
    deferred: Option<Result<String, EngineError>>,
}

impl<'e> Generation<'e> {
    pub fn new(
        engine: &'e dyn Engine,
        model: ModelPtr,
        prompt: impl Into<String>,
        config: GenerationConfig,
        sampler: Box<dyn Sampler + 'e>,
        cancel: CancelHandle,
    ) -> Self {
        Self {
            engine,
            model,
            prompt: prompt.into(),
            config,
            sampler,
            cancel,
            state: GenerationState::Init,
            stop_reason: None,
            active: None,
            position: 0,
            generated: 0,
            pending_token: None,
            utf8: Vec::new(),
            deferred: None,
        }
    }

    pub fn state(&self) -> GenerationState {
        self.state
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason
    }

    /// Tokens processed so far (prompt included)
    pub fn position(&self) -> u32 {
        self.position
    }

    pub fn generated_tokens(&self) -> u32 {
        self.generated
    }

    /// Produces the next fragment.
    ///
    /// `None` once a terminal state is reached. A failure is returned once as
    /// `Some(Err(_))`; a cancellation ends with [`CANCELLED_MARKER`].
    pub fn next_fragment(&mut self) -> Option<Result<String, EngineError>> {
        loop {
            if self.state.is_terminal() {
                return self.deferred.take();
            }
            match self.state {
                GenerationState::Init => match self.init() {
                    Ok(()) => self.state = GenerationState::Prefill,
                    Err(e) => return self.fail(e),
                },
                GenerationState::Prefill => match self.prefill() {
                    Ok(()) => self.state = GenerationState::Decoding,
                    Err(e) => return self.fail(e),
                },
                _ => {
                    return match self.advance() {
                        Ok(Step::Emit(fragment)) => Some(Ok(fragment)),
                        Ok(Step::Stop(StopReason::Cancelled)) => {
                            self.finish(StopReason::Cancelled);
                            self.flush_then(Some(Ok(CANCELLED_MARKER.to_string())))
                        }
                        Ok(Step::Stop(reason)) => {
                            self.finish(reason);
                            self.flush_then(None)
                        }
                        Err(e) => self.fail(e),
                    };
                }
            }
        }
    }

    fn init(&mut self) -> Result<(), EngineError> {
        let vocab_ptr = self
            .engine
            .model_vocab(self.model)
            .ok_or_else(|| EngineError::ModelLoad("model has no vocabulary".to_string()))?;
        let vocab = Vocab::new(self.engine, vocab_ptr);
        let n_vocab = usize::try_from(vocab.n_tokens())
            .ok()
            .filter(|&n| n > 0)
            .ok_or_else(|| EngineError::ModelLoad("model reports an empty vocabulary".to_string()))?;
        let eos = vocab.eos();

        let context = Context::create(self.engine, self.model, self.config.context)?;
        let batch = Batch::allocate(self.engine, self.config.context.n_ctx as usize, 0, 1)?;

        self.active = Some(Active {
            batch,
            context,
            vocab,
            n_vocab,
            eos,
        });
        Ok(())
    }

    fn prefill(&mut self) -> Result<(), EngineError> {
        let active = self.active.as_mut().ok_or_else(missing_resources)?;

        let tokens = active.vocab.tokenize(
            &self.prompt,
            active.batch.capacity(),
            self.config.add_special,
            self.config.parse_special,
        )?;
        if tokens.is_empty() {
            return Err(EngineError::EmptyPrompt);
        }

        active.batch.fill_prefill(&tokens)?;
        active.context.decode(&active.batch, 0)?;

        self.position = tokens.len() as u32;
        tracing::info!(prompt_tokens = tokens.len(), "prefill complete");
        Ok(())
    }

    fn advance(&mut self) -> Result<Step, EngineError> {
        let active = self.active.as_mut().ok_or_else(missing_resources)?;

        if let Some(token) = self.pending_token.take() {
            active.batch.fill_step(token, self.position as llama_pos)?;
            active.context.decode(&active.batch, self.position)?;
            self.position += 1;
        }

        if self.position >= self.config.max_length {
            return Ok(Step::Stop(StopReason::MaxLength));
        }
        if self.cancel.is_cancelled() {
            return Ok(Step::Stop(StopReason::Cancelled));
        }

        let position = self.position;
        let logits = active
            .context
            .logits(active.n_vocab)
            .ok_or(EngineError::MissingLogits { position })?;
        let token = self
            .sampler
            .sample(logits)
            .ok_or(EngineError::Sampling { position })?;

        if token == active.eos {
            return Ok(Step::Stop(StopReason::EndOfSequence));
        }

        let piece = active.vocab.piece(token, self.config.render_special)?;
        tracing::debug!(token, position, bytes = piece.len(), "sampled token");

        self.pending_token = Some(token);
        self.generated += 1;
        Ok(Step::Emit(self.push_piece(&piece)))
    }

    /// Appends a piece and returns the longest complete UTF-8 prefix, holding
    /// back the tail of a character split across tokens.
    fn push_piece(&mut self, piece: &[u8]) -> String {
        self.utf8.extend_from_slice(piece);

        let mut text = String::new();
        loop {
            let (consumed, done) = match std::str::from_utf8(&self.utf8) {
                Ok(_) => (self.utf8.len(), true),
                // incomplete sequence at the end: wait for more bytes
                Err(e) if e.error_len().is_none() => (e.valid_up_to(), true),
                // invalid bytes never complete; replace them and look again
                Err(e) => (e.valid_up_to() + e.error_len().unwrap_or(1), false),
            };
            text.push_str(&String::from_utf8_lossy(&self.utf8[..consumed]));
            self.utf8.drain(..consumed);
            if done {
                return text;
            }
        }
    }

    /// Emits held-back bytes lossily, queueing `last` behind them.
    fn flush_then(
        &mut self,
        last: Option<Result<String, EngineError>>,
    ) -> Option<Result<String, EngineError>> {
        let rest = std::mem::take(&mut self.utf8);
        if rest.is_empty() {
            return last;
        }
        self.deferred = last;
        Some(Ok(String::from_utf8_lossy(&rest).into_owned()))
    }

    fn finish(&mut self, reason: StopReason) {
        self.state = match reason {
            StopReason::EndOfSequence | StopReason::MaxLength => GenerationState::Completed,
            StopReason::Cancelled => GenerationState::Cancelled,
            StopReason::Failed => GenerationState::Failed,
        };
        self.stop_reason = Some(reason);
        self.pending_token = None;
        self.active = None;

        tracing::info!(
            reason = ?reason,
            generated = self.generated,
            position = self.position,
            "generation finished"
        );
    }

    fn fail(&mut self, error: EngineError) -> Option<Result<String, EngineError>> {
        tracing::warn!("Generation failed: {}", error);
        self.finish(StopReason::Failed);
        self.flush_then(Some(Err(error)))
    }
}

fn missing_resources() -> EngineError {
    EngineError::Worker("generation resources already released".to_string())
}

impl Iterator for Generation<'_> {
    type Item = Result<String, EngineError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_fragment()
    }
}
