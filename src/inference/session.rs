//! Session façade
//!
//! [`Session`] is the entry point callers use: bind the engine, load a model,
//! start generations. Everything it returns is safe to move across threads.

use std::ffi::CString;
use std::path::Path;
use std::sync::Arc;

use crate::inference::engine::{Engine, EngineError};
use crate::inference::ffi::llama_token;
use crate::inference::generation::GenerationConfig;
use crate::inference::model::{validate_gguf, Model};
use crate::inference::native::NativeEngine;
use crate::inference::sampler::{Greedy, Sampler};
use crate::inference::streaming::TokenStream;
use crate::inference::worker;
use crate::storage::settings::BridgeSettings;

/// Vocabulary facts about a loaded model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelInfo {
    pub vocab_size: i32,
    pub eos: llama_token,
}

pub struct Session {
    engine: Arc<dyn Engine>,
    settings: BridgeSettings,
}

impl Session {
    pub fn new(engine: Arc<dyn Engine>, settings: BridgeSettings) -> Self {
        Self { engine, settings }
    }

    /// Binds the shared library named in `settings` (or the platform default).
    pub fn native(settings: BridgeSettings) -> Result<Self, EngineError> {
        let engine = NativeEngine::open(settings.library_path.as_deref())?;
        Ok(Self::new(Arc::new(engine), settings))
    }

    pub fn settings(&self) -> &BridgeSettings {
        &self.settings
    }

    /// Initializes the compute backend; repeated calls are no-ops.
    pub fn initialize_engine(&self) {
        self.engine.backend_init();
    }

    /// Loads a GGUF model file.
    pub fn load_model(&self, path: impl AsRef<Path>) -> Result<Model, EngineError> {
        let path = path.as_ref();
        self.initialize_engine();

        if self.settings.verify_gguf_header {
            let metadata = validate_gguf(path)?;
            tracing::debug!(
                version = metadata.version,
                tensors = metadata.tensor_count,
                "GGUF validation passed for {:?}",
                path
            );
        }

        let c_path = CString::new(path.as_os_str().as_encoded_bytes()).map_err(|_| {
            EngineError::ModelLoad(format!("path contains a NUL byte: {}", path.display()))
        })?;

        let mut params = self.engine.model_default_params();
        params.use_mmap = self.settings.use_mmap;
        params.n_gpu_layers = i32::try_from(self.settings.gpu_layers).unwrap_or(i32::MAX);

        let ptr = self
            .engine
            .load_model_from_file(&c_path, params)
            .ok_or_else(|| {
                EngineError::ModelLoad(format!("engine could not load {}", path.display()))
            })?;

        tracing::info!(
            gpu_layers = self.settings.gpu_layers,
            "Model loaded: {}",
            path.display()
        );
        Ok(Model::new(Arc::clone(&self.engine), ptr, path.to_path_buf()))
    }

    /// Releases this handle. The native model is freed now, or when the last
    /// in-flight generation using it finishes.
    pub fn close_model(&self, model: Model) {
        if model.holders() > 1 {
            tracing::debug!(
                holders = model.holders(),
                "Model still in use, release deferred: {}",
                model.path().display()
            );
        }
        drop(model);
    }

    pub fn model_info(&self, model: &Model) -> Result<ModelInfo, EngineError> {
        let vocab = self
            .engine
            .model_vocab(model.handle())
            .ok_or_else(|| EngineError::ModelLoad("model has no vocabulary".to_string()))?;
        Ok(ModelInfo {
            vocab_size: self.engine.vocab_n_tokens(vocab),
            eos: self.engine.vocab_eos(vocab),
        })
    }

    /// Starts greedy generation on a worker thread and returns at once.
    ///
    /// Every failure, including one starting the worker, arrives through the
    /// stream.
    pub fn generate(&self, model: &Model, prompt: impl Into<String>) -> TokenStream {
        self.generate_with(model, prompt, Box::new(Greedy))
    }

    pub fn generate_with(
        &self,
        model: &Model,
        prompt: impl Into<String>,
        sampler: Box<dyn Sampler>,
    ) -> TokenStream {
        let config = GenerationConfig::from(&self.settings);
        worker::spawn(model.clone(), prompt.into(), config, sampler)
    }
}
