//! Raw llama.cpp ABI
//!
//! `#[repr(C)]` mirrors of the structs exchanged with the native engine, plus
//! the typed handles the rest of the crate uses instead of bare pointers.
//!
//! The layouts below are pinned to one llama.cpp header revision (the one
//! that introduced `flash_attn_type` and the backend sampler slots in
//! `llama_context_params`). They are a binary contract: when the shared
//! library is upgraded, re-check every field and its order against `llama.h`.

#![allow(non_camel_case_types)]

use std::ffi::{c_float, c_int, c_uint, c_void};
use std::ptr::NonNull;

pub type llama_token = i32;
pub type llama_pos = i32;
pub type llama_seq_id = i32;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct llama_model_params {
    pub devices: *mut c_void,
    pub tensor_buft_overrides: *mut c_void,
    pub n_gpu_layers: c_int,
    pub split_mode: c_int,
    pub main_gpu: c_int,
    pub tensor_split: *mut c_float,
    pub progress_callback: *mut c_void,
    pub progress_callback_user_data: *mut c_void,
    pub kv_overrides: *mut c_void,
    // C `bool`, one byte each, kept together at the end
    pub vocab_only: bool,
    pub use_mmap: bool,
    pub use_direct_io: bool,
    pub use_mlock: bool,
    pub check_tensors: bool,
    pub use_extra_bufts: bool,
    pub no_host: bool,
    pub no_alloc: bool,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct llama_context_params {
    pub n_ctx: c_uint,
    pub n_batch: c_uint,
    pub n_ubatch: c_uint,
    pub n_seq_max: c_uint,
    pub n_threads: c_int,
    pub n_threads_batch: c_int,
    pub rope_scaling_type: c_int,
    pub pooling_type: c_int,
    pub attention_type: c_int,
    pub flash_attn_type: c_int,
    pub rope_freq_base: c_float,
    pub rope_freq_scale: c_float,
    pub yarn_ext_factor: c_float,
    pub yarn_attn_factor: c_float,
    pub yarn_beta_fast: c_float,
    pub yarn_beta_slow: c_float,
    pub yarn_orig_ctx: c_uint,
    pub defrag_thold: c_float,
    pub cb_eval: *mut c_void,
    pub cb_eval_user_data: *mut c_void,
    pub type_k: c_int,
    pub type_v: c_int,
    pub abort_callback: *mut c_void,
    pub abort_callback_data: *mut c_void,
    pub embeddings: bool,
    pub offload_kqv: bool,
    pub no_perf: bool,
    pub op_offload: bool,
    pub swa_full: bool,
    pub kv_unified: bool,
    pub samplers: *mut c_void,
    pub n_samplers: usize,
}

/// Input of one decode step. Passed by value; the arrays are owned by the
/// engine (`llama_batch_init` / `llama_batch_free`).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct llama_batch {
    pub n_tokens: i32,
    pub token: *mut llama_token,
    pub embd: *mut c_float,
    pub pos: *mut llama_pos,
    pub n_seq_id: *mut i32,
    pub seq_id: *mut *mut llama_seq_id,
    pub logits: *mut i8,
}

#[cfg(test)]
impl llama_model_params {
    pub(crate) fn zeroed() -> Self {
        // SAFETY: every field is a pointer, integer or bool; all-zero is valid.
        unsafe { std::mem::zeroed() }
    }
}

#[cfg(test)]
impl llama_context_params {
    pub(crate) fn zeroed() -> Self {
        // SAFETY: every field is a pointer, integer, float or bool.
        unsafe { std::mem::zeroed() }
    }
}

macro_rules! opaque_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(transparent)]
        pub struct $name(NonNull<c_void>);

        // The engine allows its objects to be used from any thread as long as
        // a single context is never driven concurrently; `Context` and `Batch`
        // enforce that by ownership.
        unsafe impl Send for $name {}
        unsafe impl Sync for $name {}

        impl $name {
            /// Wraps a pointer returned by the engine. Returns `None` for null.
            ///
            /// # Safety
            ///
            /// `ptr` must come from the engine entry point that creates this
            /// kind of object, and the handle must not be used after the
            /// matching free call.
            pub unsafe fn from_raw(ptr: *mut c_void) -> Option<Self> {
                NonNull::new(ptr).map(Self)
            }

            pub fn as_ptr(self) -> *mut c_void {
                self.0.as_ptr()
            }
        }
    };
}

opaque_handle!(
    /// Loaded weights. Valid until `llama_model_free`.
    ModelPtr
);
opaque_handle!(
    /// Per-request compute state (KV cache, thread pool config).
    ContextPtr
);
opaque_handle!(
    /// Vocabulary owned by a model; lives exactly as long as the model.
    VocabPtr
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_batch_layout() {
        // n_tokens + padding, then six pointers
        assert_eq!(std::mem::size_of::<llama_batch>(), 56);
        assert_eq!(std::mem::align_of::<llama_batch>(), 8);
    }

    #[test]
    fn test_bool_fields_are_one_byte() {
        assert_eq!(std::mem::size_of::<bool>(), 1);
    }

    #[test]
    fn test_handle_rejects_null() {
        let handle = unsafe { ModelPtr::from_raw(std::ptr::null_mut()) };
        assert!(handle.is_none());

        let handle = unsafe { ContextPtr::from_raw(0x10 as *mut c_void) }.unwrap();
        assert_eq!(handle.as_ptr() as usize, 0x10);
    }
}
