//! Scripted in-process engine for tests
//!
//! Implements [`Engine`] with plain Rust allocations: prompts tokenize to a
//! fixed id list, every logits-flagged decode puts the next scripted token at
//! the top of the logits row, and every create/free is counted.

use std::collections::{HashMap, VecDeque};
use std::ffi::{c_void, CStr};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::inference::engine::Engine;
use crate::inference::ffi::{
    llama_batch, llama_context_params, llama_model_params, llama_token, ContextPtr, ModelPtr,
    VocabPtr,
};
use crate::inference::streaming::CancelHandle;

const MODEL_ADDR: usize = 0x1000;
const CONTEXT_ADDR: usize = 0x2000;
const VOCAB_ADDR: usize = 0x3000;

#[derive(Debug, Clone)]
pub(crate) struct Script {
    pub prompt_tokens: Vec<llama_token>,
    /// Sampled tokens, in order; `filler` once exhausted
    pub responses: Vec<llama_token>,
    pub filler: llama_token,
    pub pieces: HashMap<llama_token, Vec<u8>>,
    pub n_vocab: i32,
    pub eos: llama_token,
    /// Decode call index (0 = prefill) that returns a non-zero code
    pub fail_decode_at: Option<usize>,
    pub panic_on_decode: Option<usize>,
    /// Sets the flag while decode call N runs
    pub cancel_on_decode: Option<(usize, CancelHandle)>,
    pub fail_model_load: bool,
    pub fail_context: bool,
    pub fail_batch: bool,
    pub null_logits: bool,
    /// Tokenizer always asks for one more slot than it was given
    pub unstable_token_count: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            prompt_tokens: vec![1, 2, 3],
            responses: Vec::new(),
            filler: 1,
            pieces: HashMap::new(),
            n_vocab: 64,
            eos: 0,
            fail_decode_at: None,
            panic_on_decode: None,
            cancel_on_decode: None,
            fail_model_load: false,
            fail_context: false,
            fail_batch: false,
            null_logits: false,
            unstable_token_count: false,
        }
    }
}

impl Script {
    pub fn with_piece(self, token: llama_token, text: &str) -> Self {
        self.with_bytes(token, text.as_bytes())
    }

    pub fn with_bytes(mut self, token: llama_token, bytes: &[u8]) -> Self {
        self.pieces.insert(token, bytes.to_vec());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Stats {
    pub backend_inits: usize,
    pub init_calls: usize,
    pub models_loaded: usize,
    pub models_freed: usize,
    pub contexts_created: usize,
    pub contexts_freed: usize,
    pub batches_allocated: usize,
    pub batches_freed: usize,
}

#[derive(Debug, Clone)]
pub(crate) struct TokenizeCall {
    pub capacity: usize,
    pub add_special: bool,
    pub parse_special: bool,
}

/// What one `decode` call saw in the batch.
#[derive(Debug, Clone)]
pub(crate) struct DecodeCall {
    pub tokens: Vec<llama_token>,
    pub positions: Vec<i32>,
    pub seq_ids: Vec<i32>,
    pub logits: Vec<bool>,
}

struct State {
    script: Script,
    responses: VecDeque<llama_token>,
    stats: Stats,
    logits: Vec<f32>,
    batches: HashMap<usize, (usize, usize)>,
    tokenize_calls: Vec<TokenizeCall>,
    piece_capacities: Vec<usize>,
    decode_calls: Vec<DecodeCall>,
    model_params: Option<llama_model_params>,
    context_params: Option<llama_context_params>,
    model_path: Option<String>,
}

// `llama_*_params` carry null pointers only
unsafe impl Send for State {}

pub(crate) struct ScriptedEngine {
    state: Mutex<State>,
}

fn leak<T>(values: Vec<T>) -> *mut T {
    Box::into_raw(values.into_boxed_slice()) as *mut T
}

/// # Safety
///
/// `ptr` must come from [`leak`] with a vector of exactly `len` elements.
unsafe fn reclaim<T>(ptr: *mut T, len: usize) {
    drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(ptr, len)));
}

impl ScriptedEngine {
    pub fn new(script: Script) -> Self {
        let logits = vec![0.0; script.n_vocab.max(0) as usize];
        let responses = script.responses.iter().copied().collect();
        Self {
            state: Mutex::new(State {
                script,
                responses,
                stats: Stats::default(),
                logits,
                batches: HashMap::new(),
                tokenize_calls: Vec::new(),
                piece_capacities: Vec::new(),
                decode_calls: Vec::new(),
                model_params: None,
                context_params: None,
                model_path: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn model_handle(&self) -> ModelPtr {
        unsafe { ModelPtr::from_raw(MODEL_ADDR as *mut c_void) }.unwrap()
    }

    pub fn vocab_handle(&self) -> VocabPtr {
        unsafe { VocabPtr::from_raw(VOCAB_ADDR as *mut c_void) }.unwrap()
    }

    pub fn stats(&self) -> Stats {
        self.lock().stats.clone()
    }

    pub fn tokenize_calls(&self) -> Vec<TokenizeCall> {
        self.lock().tokenize_calls.clone()
    }

    pub fn piece_capacities(&self) -> Vec<usize> {
        self.lock().piece_capacities.clone()
    }

    pub fn decode_calls(&self) -> Vec<DecodeCall> {
        self.lock().decode_calls.clone()
    }

    pub fn model_params(&self) -> Option<llama_model_params> {
        self.lock().model_params
    }

    pub fn context_params(&self) -> Option<llama_context_params> {
        self.lock().context_params
    }

    pub fn model_path(&self) -> Option<String> {
        self.lock().model_path.clone()
    }
}

impl Engine for ScriptedEngine {
    fn backend_init(&self) {
        let mut state = self.lock();
        state.stats.init_calls += 1;
        if state.stats.backend_inits == 0 {
            state.stats.backend_inits = 1;
        }
    }

    fn model_default_params(&self) -> llama_model_params {
        let mut params = llama_model_params::zeroed();
        params.n_gpu_layers = 999;
        params
    }

    fn load_model_from_file(&self, path: &CStr, params: llama_model_params) -> Option<ModelPtr> {
        let mut state = self.lock();
        state.model_params = Some(params);
        state.model_path = Some(path.to_string_lossy().into_owned());
        if state.script.fail_model_load {
            return None;
        }
        state.stats.models_loaded += 1;
        Some(self.model_handle())
    }

    fn free_model(&self, _model: ModelPtr) {
        self.lock().stats.models_freed += 1;
    }

    fn model_vocab(&self, _model: ModelPtr) -> Option<VocabPtr> {
        Some(self.vocab_handle())
    }

    fn context_default_params(&self) -> llama_context_params {
        let mut params = llama_context_params::zeroed();
        params.n_ctx = 512;
        params.n_batch = 512;
        params.n_threads = 1;
        params.n_threads_batch = 1;
        params
    }

    fn new_context(&self, _model: ModelPtr, params: llama_context_params) -> Option<ContextPtr> {
        let mut state = self.lock();
        state.context_params = Some(params);
        if state.script.fail_context {
            return None;
        }
        state.stats.contexts_created += 1;
        unsafe { ContextPtr::from_raw(CONTEXT_ADDR as *mut c_void) }
    }

    fn free_context(&self, _ctx: ContextPtr) {
        self.lock().stats.contexts_freed += 1;
    }

    fn vocab_n_tokens(&self, _vocab: VocabPtr) -> i32 {
        self.lock().script.n_vocab
    }

    fn vocab_eos(&self, _vocab: VocabPtr) -> llama_token {
        self.lock().script.eos
    }

    fn tokenize(
        &self,
        _vocab: VocabPtr,
        _text: &[u8],
        out: &mut [llama_token],
        add_special: bool,
        parse_special: bool,
    ) -> i32 {
        let mut state = self.lock();
        state.tokenize_calls.push(TokenizeCall {
            capacity: out.len(),
            add_special,
            parse_special,
        });

        if state.script.unstable_token_count {
            return -((out.len() + 1) as i32);
        }

        let tokens = &state.script.prompt_tokens;
        if out.len() < tokens.len() {
            return -(tokens.len() as i32);
        }
        out[..tokens.len()].copy_from_slice(tokens);
        tokens.len() as i32
    }

    fn token_to_piece(
        &self,
        _vocab: VocabPtr,
        token: llama_token,
        out: &mut [u8],
        _lstrip: i32,
        _special: bool,
    ) -> i32 {
        let mut state = self.lock();
        state.piece_capacities.push(out.len());

        let piece = state.script.pieces.get(&token).cloned().unwrap_or_default();
        if out.len() < piece.len() {
            return -(piece.len() as i32);
        }
        out[..piece.len()].copy_from_slice(&piece);
        piece.len() as i32
    }

    fn batch_init(&self, n_tokens: i32, _embd: i32, n_seq_max: i32) -> llama_batch {
        let mut state = self.lock();
        state.stats.batches_allocated += 1;

        if state.script.fail_batch {
            return llama_batch {
                n_tokens: 0,
                token: std::ptr::null_mut(),
                embd: std::ptr::null_mut(),
                pos: std::ptr::null_mut(),
                n_seq_id: std::ptr::null_mut(),
                seq_id: std::ptr::null_mut(),
                logits: std::ptr::null_mut(),
            };
        }

        let capacity = n_tokens.max(0) as usize;
        let n_seq = n_seq_max.max(1) as usize;
        let rows: Vec<*mut i32> = (0..capacity).map(|_| leak(vec![0i32; n_seq])).collect();
        let batch = llama_batch {
            n_tokens: 0,
            token: leak(vec![0; capacity]),
            embd: std::ptr::null_mut(),
            pos: leak(vec![0; capacity]),
            n_seq_id: leak(vec![0; capacity]),
            seq_id: leak(rows),
            logits: leak(vec![0i8; capacity]),
        };
        state.batches.insert(batch.token as usize, (capacity, n_seq));
        batch
    }

    fn batch_free(&self, batch: llama_batch) {
        let mut state = self.lock();
        state.stats.batches_freed += 1;

        let Some((capacity, n_seq)) = state.batches.remove(&(batch.token as usize)) else {
            return;
        };
        unsafe {
            for i in 0..capacity {
                reclaim(*batch.seq_id.add(i), n_seq);
            }
            reclaim(batch.seq_id, capacity);
            reclaim(batch.token, capacity);
            reclaim(batch.pos, capacity);
            reclaim(batch.n_seq_id, capacity);
            reclaim(batch.logits, capacity);
        }
    }

    fn decode(&self, _ctx: ContextPtr, batch: llama_batch) -> i32 {
        let mut state = self.lock();
        let index = state.decode_calls.len();
        let n = batch.n_tokens.max(0) as usize;

        let call = unsafe {
            DecodeCall {
                tokens: std::slice::from_raw_parts(batch.token, n).to_vec(),
                positions: std::slice::from_raw_parts(batch.pos, n).to_vec(),
                seq_ids: (0..n).map(|i| **batch.seq_id.add(i)).collect(),
                logits: std::slice::from_raw_parts(batch.logits, n)
                    .iter()
                    .map(|&flag| flag != 0)
                    .collect(),
            }
        };
        let wants_logits = call.logits.iter().any(|&flag| flag);
        state.decode_calls.push(call);

        if let Some((at, cancel)) = &state.script.cancel_on_decode {
            if *at == index {
                cancel.cancel();
            }
        }
        if state.script.panic_on_decode == Some(index) {
            drop(state);
            panic!("scripted decode panic");
        }
        if state.script.fail_decode_at == Some(index) {
            return 1;
        }

        if wants_logits {
            let filler = state.script.filler;
            let next = state.responses.pop_front().unwrap_or(filler);
            state.logits.iter_mut().for_each(|l| *l = 0.0);
            if let Some(slot) = state.logits.get_mut(next as usize) {
                *slot = 1.0;
            }
        }
        0
    }

    fn logits(&self, _ctx: ContextPtr) -> *const f32 {
        let state = self.lock();
        if state.script.null_logits {
            std::ptr::null()
        } else {
            // The vector is never resized, so the pointer stays valid.
            state.logits.as_ptr()
        }
    }
}
