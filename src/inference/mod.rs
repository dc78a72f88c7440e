//! LLM inference engine
//!
//! This module handles all interaction with llama.cpp: binding the shared
//! library, loading models and streaming generations off the caller's thread.

pub mod batch;
pub mod context;
pub mod engine;
pub mod ffi;
pub mod generation;
pub mod model;
pub mod native;
pub mod sampler;
pub mod session;
pub mod streaming;
pub mod vocab;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main types for convenience
pub use engine::{Engine, EngineError};
pub use generation::{
    Generation, GenerationConfig, GenerationState, StopReason, CANCELLED_MARKER,
};
pub use model::{validate_gguf, GgufMetadata, Model, ModelError, GGUF_MAGIC};
pub use native::NativeEngine;
pub use sampler::{sample_greedy, Greedy, Sampler};
pub use session::{ModelInfo, Session};
pub use streaming::{CancelHandle, GenerationOutput, StreamMessage, TokenStream};
