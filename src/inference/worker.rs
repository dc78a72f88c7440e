//! Generation worker thread
//!
//! Every request runs on its own OS thread so the native engine never blocks
//! the caller. The thread owns the [`Generation`] and feeds a one-way channel;
//! the caller only reads the channel and flips the cancel flag.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use tokio::sync::mpsc::{self, UnboundedSender};
use uuid::Uuid;

use crate::inference::engine::EngineError;
use crate::inference::generation::{Generation, GenerationConfig, StopReason};
use crate::inference::model::Model;
use crate::inference::sampler::Sampler;
use crate::inference::streaming::{CancelHandle, StreamMessage, TokenStream};

/// Starts generating `prompt` on a new worker thread.
///
/// The returned stream yields fragments as they are produced. The worker keeps
/// its own clone of `model` until the request ends. If the thread cannot be
/// started, the stream carries that error and closes.
pub fn spawn(
    model: Model,
    prompt: String,
    config: GenerationConfig,
    sampler: Box<dyn Sampler>,
) -> TokenStream {
    spawn_with(model, prompt, config, sampler, CancelHandle::new())
}

pub(crate) fn spawn_with(
    model: Model,
    prompt: String,
    config: GenerationConfig,
    sampler: Box<dyn Sampler>,
    cancel: CancelHandle,
) -> TokenStream {
    let id = Uuid::new_v4();
    let (tx, rx) = mpsc::unbounded_channel();
    let worker_cancel = cancel.clone();
    let failure_tx = tx.clone();

    let spawned = thread::Builder::new()
        .name(format!("llama-gen-{}", &id.simple().to_string()[..8]))
        .spawn(move || worker_main(id, model, prompt, config, sampler, worker_cancel, tx));

    match spawned {
        Ok(_) => tracing::debug!(request = %id, "generation worker started"),
        Err(e) => {
            tracing::error!(request = %id, "Failed to spawn generation worker: {}", e);
            close_with_error(
                &failure_tx,
                EngineError::Worker(format!("failed to spawn worker thread: {e}")),
            );
        }
    }
    TokenStream::new(id, rx, cancel)
}

/// Ends a request that never ran: one error, then `Done(Failed)`.
fn close_with_error(tx: &UnboundedSender<StreamMessage>, error: EngineError) {
    let _ = tx.send(StreamMessage::Error(error));
    let _ = tx.send(StreamMessage::Done(StopReason::Failed));
}

/// Worker thread main
///
/// Always ends the channel with `Done`, panics included.
fn worker_main(
    id: Uuid,
    model: Model,
    prompt: String,
    config: GenerationConfig,
    sampler: Box<dyn Sampler>,
    cancel: CancelHandle,
    tx: UnboundedSender<StreamMessage>,
) {
    let span = tracing::info_span!("generation", request = %id);
    let _entered = span.enter();

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        run_generation(model, &prompt, config, sampler, &cancel, &tx)
    }));

    let reason = match outcome {
        Ok(reason) => reason,
        Err(_) => {
            tracing::error!("Generation worker panicked");
            close_with_error(
                &tx,
                EngineError::Worker("generation worker panicked".to_string()),
            );
            return;
        }
    };

    let _ = tx.send(StreamMessage::Done(reason));
}

// Drops the generation and then the model before returning, so both are
// released by the time `Done` is sent.
fn run_generation(
    model: Model,
    prompt: &str,
    config: GenerationConfig,
    sampler: Box<dyn Sampler>,
    cancel: &CancelHandle,
    tx: &UnboundedSender<StreamMessage>,
) -> StopReason {
    let engine = Arc::clone(model.engine());
    engine.backend_init();

    let mut generation = Generation::new(
        engine.as_ref(),
        model.handle(),
        prompt,
        config,
        sampler,
        cancel.clone(),
    );

    while let Some(item) = generation.next_fragment() {
        let message = match item {
            Ok(fragment) => StreamMessage::Fragment(fragment),
            Err(e) => StreamMessage::Error(e),
        };
        if tx.send(message).is_err() && !cancel.is_cancelled() {
            // keep stepping so the loop reaches a terminal state and cleans up
            tracing::debug!("Receiver dropped, stopping generation");
            cancel.cancel();
        }
    }

    generation.stop_reason().unwrap_or(StopReason::Failed)
}
