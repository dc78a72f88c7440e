//! llama-bridge Library
//!
//! Thin bridge to a llama.cpp shared library: load a GGUF model, run greedy
//! generation on a worker thread and stream the text back.

pub mod inference;
pub mod storage;
