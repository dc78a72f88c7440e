//! Runtime binding to the llama.cpp shared library
//!
//! Symbols are resolved once when the library is opened; a missing library
//! or symbol surfaces as [`EngineError::EngineBinding`] instead of a link
//! failure. One [`NativeEngine`] is meant to be opened per process and shared
//! (`Arc`) with every worker.

use std::ffi::{c_char, c_float, c_int, c_void, CStr};
use std::path::{Path, PathBuf};

use libloading::Library;
use once_cell::sync::OnceCell;

use crate::inference::engine::{Engine, EngineError};
use crate::inference::ffi::{
    llama_batch, llama_context_params, llama_model_params, llama_token, ContextPtr, ModelPtr,
    VocabPtr,
};

type BackendInitFn = unsafe extern "C" fn();
type ModelDefaultParamsFn = unsafe extern "C" fn() -> llama_model_params;
type ModelLoadFromFileFn = unsafe extern "C" fn(*const c_char, llama_model_params) -> *mut c_void;
type ModelFreeFn = unsafe extern "C" fn(*mut c_void);
type ModelGetVocabFn = unsafe extern "C" fn(*const c_void) -> *const c_void;
type ContextDefaultParamsFn = unsafe extern "C" fn() -> llama_context_params;
type InitFromModelFn = unsafe extern "C" fn(*mut c_void, llama_context_params) -> *mut c_void;
type FreeFn = unsafe extern "C" fn(*mut c_void);
type VocabNTokensFn = unsafe extern "C" fn(*const c_void) -> i32;
type VocabEosFn = unsafe extern "C" fn(*const c_void) -> llama_token;
type TokenizeFn = unsafe extern "C" fn(
    *const c_void,
    *const c_char,
    i32,
    *mut llama_token,
    i32,
    bool,
    bool,
) -> i32;
type TokenToPieceFn =
    unsafe extern "C" fn(*const c_void, llama_token, *mut c_char, i32, i32, bool) -> i32;
type BatchInitFn = unsafe extern "C" fn(i32, i32, i32) -> llama_batch;
type BatchFreeFn = unsafe extern "C" fn(llama_batch);
type DecodeFn = unsafe extern "C" fn(*mut c_void, llama_batch) -> c_int;
type GetLogitsFn = unsafe extern "C" fn(*mut c_void) -> *mut c_float;

struct Symbols {
    backend_init: BackendInitFn,
    model_default_params: ModelDefaultParamsFn,
    model_load_from_file: ModelLoadFromFileFn,
    model_free: ModelFreeFn,
    model_get_vocab: ModelGetVocabFn,
    context_default_params: ContextDefaultParamsFn,
    init_from_model: InitFromModelFn,
    free: FreeFn,
    vocab_n_tokens: VocabNTokensFn,
    vocab_eos: VocabEosFn,
    tokenize: TokenizeFn,
    token_to_piece: TokenToPieceFn,
    batch_init: BatchInitFn,
    batch_free: BatchFreeFn,
    decode: DecodeFn,
    get_logits: GetLogitsFn,
}

impl Symbols {
    /// # Safety
    ///
    /// `library` must be a llama.cpp build whose exported signatures match
    /// the function types above.
    unsafe fn resolve(library: &Library) -> Result<Self, EngineError> {
        Ok(Self {
            backend_init: symbol(library, "llama_backend_init")?,
            model_default_params: symbol(library, "llama_model_default_params")?,
            model_load_from_file: symbol(library, "llama_model_load_from_file")?,
            model_free: symbol(library, "llama_model_free")?,
            model_get_vocab: symbol(library, "llama_model_get_vocab")?,
            context_default_params: symbol(library, "llama_context_default_params")?,
            init_from_model: symbol(library, "llama_init_from_model")?,
            free: symbol(library, "llama_free")?,
            vocab_n_tokens: symbol(library, "llama_vocab_n_tokens")?,
            vocab_eos: symbol(library, "llama_vocab_eos")?,
            tokenize: symbol(library, "llama_tokenize")?,
            token_to_piece: symbol(library, "llama_token_to_piece")?,
            batch_init: symbol(library, "llama_batch_init")?,
            batch_free: symbol(library, "llama_batch_free")?,
            decode: symbol(library, "llama_decode")?,
            get_logits: symbol(library, "llama_get_logits")?,
        })
    }
}

unsafe fn symbol<T: Copy>(library: &Library, name: &str) -> Result<T, EngineError> {
    library
        .get::<T>(name.as_bytes())
        .map(|s| *s)
        .map_err(|e| EngineError::EngineBinding {
            target: name.to_string(),
            reason: e.to_string(),
        })
}

/// Platform file name of the engine library (`libllama.so`, `libllama.dylib`,
/// `llama.dll`), resolved through the loader's search path.
pub fn default_library_path() -> PathBuf {
    PathBuf::from(libloading::library_filename("llama"))
}

/// llama.cpp loaded from a shared library at runtime.
pub struct NativeEngine {
    symbols: Symbols,
    backend: OnceCell<()>,
    // Dropped last: the function pointers in `symbols` point into it.
    _library: Library,
}

impl NativeEngine {
    /// Opens the engine library. `None` uses [`default_library_path`].
    pub fn open(path: Option<&Path>) -> Result<Self, EngineError> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(default_library_path);

        // SAFETY: loading runs the library's initializers; llama.cpp has none
        // with preconditions on the host.
        let library = unsafe { Library::new(&path) }.map_err(|e| EngineError::EngineBinding {
            target: path.display().to_string(),
            reason: e.to_string(),
        })?;

        // SAFETY: the symbol types above follow llama.h.
        let symbols = unsafe { Symbols::resolve(&library)? };

        tracing::info!("Bound native engine from {}", path.display());

        Ok(Self {
            symbols,
            backend: OnceCell::new(),
            _library: library,
        })
    }
}

fn clamp_len(len: usize) -> i32 {
    i32::try_from(len).unwrap_or(i32::MAX)
}

impl Engine for NativeEngine {
    fn backend_init(&self) {
        self.backend.get_or_init(|| {
            unsafe { (self.symbols.backend_init)() };
            tracing::debug!("llama backend initialized");
        });
    }

    fn model_default_params(&self) -> llama_model_params {
        unsafe { (self.symbols.model_default_params)() }
    }

    fn load_model_from_file(&self, path: &CStr, params: llama_model_params) -> Option<ModelPtr> {
        unsafe {
            let ptr = (self.symbols.model_load_from_file)(path.as_ptr(), params);
            ModelPtr::from_raw(ptr)
        }
    }

    fn free_model(&self, model: ModelPtr) {
        unsafe { (self.symbols.model_free)(model.as_ptr()) }
    }

    fn model_vocab(&self, model: ModelPtr) -> Option<VocabPtr> {
        unsafe {
            let ptr = (self.symbols.model_get_vocab)(model.as_ptr());
            VocabPtr::from_raw(ptr as *mut c_void)
        }
    }

    fn context_default_params(&self) -> llama_context_params {
        unsafe { (self.symbols.context_default_params)() }
    }

    fn new_context(&self, model: ModelPtr, params: llama_context_params) -> Option<ContextPtr> {
        unsafe {
            let ptr = (self.symbols.init_from_model)(model.as_ptr(), params);
            ContextPtr::from_raw(ptr)
        }
    }

    fn free_context(&self, ctx: ContextPtr) {
        unsafe { (self.symbols.free)(ctx.as_ptr()) }
    }

    fn vocab_n_tokens(&self, vocab: VocabPtr) -> i32 {
        unsafe { (self.symbols.vocab_n_tokens)(vocab.as_ptr()) }
    }

    fn vocab_eos(&self, vocab: VocabPtr) -> llama_token {
        unsafe { (self.symbols.vocab_eos)(vocab.as_ptr()) }
    }

    fn tokenize(
        &self,
        vocab: VocabPtr,
        text: &[u8],
        out: &mut [llama_token],
        add_special: bool,
        parse_special: bool,
    ) -> i32 {
        unsafe {
            (self.symbols.tokenize)(
                vocab.as_ptr(),
                text.as_ptr() as *const c_char,
                clamp_len(text.len()),
                out.as_mut_ptr(),
                clamp_len(out.len()),
                add_special,
                parse_special,
            )
        }
    }

    fn token_to_piece(
        &self,
        vocab: VocabPtr,
        token: llama_token,
        out: &mut [u8],
        lstrip: i32,
        special: bool,
    ) -> i32 {
        unsafe {
            (self.symbols.token_to_piece)(
                vocab.as_ptr(),
                token,
                out.as_mut_ptr() as *mut c_char,
                clamp_len(out.len()),
                lstrip,
                special,
            )
        }
    }

    fn batch_init(&self, n_tokens: i32, embd: i32, n_seq_max: i32) -> llama_batch {
        unsafe { (self.symbols.batch_init)(n_tokens, embd, n_seq_max) }
    }

    fn batch_free(&self, batch: llama_batch) {
        unsafe { (self.symbols.batch_free)(batch) }
    }

    fn decode(&self, ctx: ContextPtr, batch: llama_batch) -> i32 {
        unsafe { (self.symbols.decode)(ctx.as_ptr(), batch) }
    }

    fn logits(&self, ctx: ContextPtr) -> *const f32 {
        unsafe { (self.symbols.get_logits)(ctx.as_ptr()) as *const f32 }
    }
}
