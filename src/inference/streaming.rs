//! Streaming inference support
//!
//! The worker sends [`StreamMessage`]s over a one-directional channel; the
//! caller consumes them through a [`TokenStream`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

use crate::inference::engine::EngineError;
use crate::inference::generation::StopReason;

/// One message on the worker-to-caller channel.
///
/// `Done` is always the last message; an `Error` is always followed directly
/// by `Done`.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    /// A decoded text fragment, possibly empty
    Fragment(String),
    /// Generation failed; fragments already sent stay valid
    Error(EngineError),
    /// Generation finished
    Done(StopReason),
}

impl StreamMessage {
    pub fn is_fragment(&self) -> bool {
        matches!(self, StreamMessage::Fragment(_))
    }

    pub fn is_done(&self) -> bool {
        matches!(self, StreamMessage::Done(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, StreamMessage::Error(_))
    }

    pub fn as_fragment(&self) -> Option<&str> {
        match self {
            StreamMessage::Fragment(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&EngineError> {
        match self {
            StreamMessage::Error(e) => Some(e),
            _ => None,
        }
    }
}

/// Cooperative cancellation flag, polled once per decode step.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Everything a finished stream produced.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutput {
    pub text: String,
    pub stop_reason: StopReason,
    pub error: Option<EngineError>,
}

impl GenerationOutput {
    /// Generated text with the failure, if any, appended as an inline note.
    pub fn display_text(&self) -> String {
        match &self.error {
            Some(e) => format!("{}\n[error: {}]", self.text, e),
            None => self.text.clone(),
        }
    }
}

/// Lazy, finite sequence of text fragments from one generation request.
///
/// Dropping the stream cancels the request.
#[derive(Debug)]
pub struct TokenStream {
    id: Uuid,
    rx: UnboundedReceiver<StreamMessage>,
    cancel: CancelHandle,
    stop_reason: Option<StopReason>,
}

impl TokenStream {
    pub(crate) fn new(id: Uuid, rx: UnboundedReceiver<StreamMessage>, cancel: CancelHandle) -> Self {
        Self {
            id,
            rx,
            cancel,
            stop_reason: None,
        }
    }

    /// Request id, as recorded in the worker's tracing span
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Asks the worker to stop; takes effect before the next decode step.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Why the stream ended; `None` while it is still open.
    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason
    }

    pub fn is_finished(&self) -> bool {
        self.stop_reason.is_some()
    }

    /// Waits for the next fragment. `None` once the stream is exhausted.
    pub async fn next_fragment(&mut self) -> Option<Result<String, EngineError>> {
        if self.is_finished() {
            return None;
        }
        let message = self.rx.recv().await;
        self.accept(message)
    }

    /// Blocking variant of [`next_fragment`](Self::next_fragment).
    ///
    /// Panics if called from inside an async runtime.
    pub fn blocking_next_fragment(&mut self) -> Option<Result<String, EngineError>> {
        if self.is_finished() {
            return None;
        }
        let message = self.rx.blocking_recv();
        self.accept(message)
    }

    fn accept(&mut self, message: Option<StreamMessage>) -> Option<Result<String, EngineError>> {
        match message {
            Some(StreamMessage::Fragment(text)) => Some(Ok(text)),
            Some(StreamMessage::Error(e)) => Some(Err(e)),
            Some(StreamMessage::Done(reason)) => {
                self.stop_reason = Some(reason);
                None
            }
            None => {
                self.stop_reason = Some(StopReason::Failed);
                Some(Err(EngineError::Worker(
                    "generation worker exited without completing".to_string(),
                )))
            }
        }
    }

    /// Drains the stream, keeping the partial text if it fails.
    pub async fn collect_output(mut self) -> GenerationOutput {
        let mut text = String::new();
        let mut error = None;
        while let Some(item) = self.next_fragment().await {
            match item {
                Ok(fragment) => text.push_str(&fragment),
                Err(e) => error = Some(e),
            }
        }
        GenerationOutput {
            text,
            stop_reason: self.stop_reason.unwrap_or(StopReason::Failed),
            error,
        }
    }
}

/// Blocking iteration; same restriction as
/// [`blocking_next_fragment`](TokenStream::blocking_next_fragment).
impl Iterator for TokenStream {
    type Item = Result<String, EngineError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.blocking_next_fragment()
    }
}

impl Drop for TokenStream {
    fn drop(&mut self) {
        if !self.is_finished() {
            self.cancel.cancel();
        }
    }
}
