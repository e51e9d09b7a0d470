//! # llama-engine
//!
//! The native boundary of llama-runloop. Defines the [`NativeEngine`] trait: the
//! primitive operations the coordinator drives, and the opaque handle types
//! those operations hand out. Bindings (FFI, JNI-style shims, test doubles)
//! implement the trait; the coordinator never depends on how the calls cross
//! into native code.
//!
//! ## Design Notes
//!
//! ### Non-reentrancy
//! Every method takes `&mut self`. An engine is moved onto a single worker
//! thread and driven from there, so an implementation never observes two calls
//! at once. The trait only requires `Send`, not `Sync`.
//!
//! ### Handle ownership
//! Handles are neither `Clone` nor `Copy`. Each one is produced by exactly one
//! constructor (`load_model`, `new_context`, `new_batch`, `new_sampler`) and
//! consumed by exactly one matching `free_*` call, so use-after-free and
//! double-free cannot be written against this API. A null native pointer is
//! represented as `None`.

mod handle;
pub mod mock;
mod utf8;

use std::path::Path;

pub use handle::{BatchHandle, ContextHandle, ModelHandle, SamplerHandle};
pub use mock::{Call, Ledger, MockEngine};
pub use utf8::PieceBuffer;

/// Geometry of a decode batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchParams {
    /// Maximum number of tokens the batch can hold.
    pub n_tokens: usize,
    /// Embedding width; 0 means the batch carries token ids.
    pub embd: usize,
    /// Maximum number of sequences per token.
    pub n_seq_max: usize,
}

impl Default for BatchParams {
    fn default() -> Self {
        Self {
            n_tokens: 512,
            embd: 0,
            n_seq_max: 1,
        }
    }
}

/// Primitive operations exposed by a native inference engine.
///
/// Constructors return `None` when the native side signals failure (a null
/// handle). `completion_step` returns `None` at end of generation.
pub trait NativeEngine: Send + 'static {
    /// Route the engine's own log output into the host logger.
    fn init_logging(&mut self);

    /// One-time backend initialization.
    fn init_backend(&mut self);

    /// Human-readable capability string (SIMD flags, threads, backends).
    fn system_info(&mut self) -> String;

    /// Backend teardown, called once when the worker shuts down.
    fn free_backend(&mut self) {}

    /// Load model weights from `path`.
    fn load_model(&mut self, path: &Path) -> Option<ModelHandle>;

    fn free_model(&mut self, model: ModelHandle);

    /// Create an inference context (KV cache, threads) for `model`.
    fn new_context(&mut self, model: &ModelHandle) -> Option<ContextHandle>;

    fn free_context(&mut self, context: ContextHandle);

    fn new_batch(&mut self, params: BatchParams) -> Option<BatchHandle>;

    fn free_batch(&mut self, batch: BatchHandle);

    fn new_sampler(&mut self) -> Option<SamplerHandle>;

    fn free_sampler(&mut self, sampler: SamplerHandle);

    /// Tokenize and evaluate `prompt`, returning the initial cursor (the
    /// number of prompt tokens placed in the batch).
    fn completion_init(
        &mut self,
        context: &ContextHandle,
        batch: &BatchHandle,
        prompt: &str,
        n_len: usize,
    ) -> Option<usize>;

    /// Sample one token at `cursor`, decode it, and return its text.
    ///
    /// Returns `None` on end-of-generation. A fragment may be empty while a
    /// multi-byte character is still incomplete.
    fn completion_step(
        &mut self,
        context: &ContextHandle,
        batch: &BatchHandle,
        sampler: &SamplerHandle,
        n_len: usize,
        cursor: usize,
    ) -> Option<String>;

    /// Drop cached decode state (KV cache) held by `context`.
    fn clear_cache(&mut self, context: &ContextHandle);
}

impl<E: NativeEngine + ?Sized> NativeEngine for Box<E> {
    fn init_logging(&mut self) {
        (**self).init_logging()
    }

    fn init_backend(&mut self) {
        (**self).init_backend()
    }

    fn system_info(&mut self) -> String {
        (**self).system_info()
    }

    fn free_backend(&mut self) {
        (**self).free_backend()
    }

    fn load_model(&mut self, path: &Path) -> Option<ModelHandle> {
        (**self).load_model(path)
    }

    fn free_model(&mut self, model: ModelHandle) {
        (**self).free_model(model)
    }

    fn new_context(&mut self, model: &ModelHandle) -> Option<ContextHandle> {
        (**self).new_context(model)
    }

    fn free_context(&mut self, context: ContextHandle) {
        (**self).free_context(context)
    }

    fn new_batch(&mut self, params: BatchParams) -> Option<BatchHandle> {
        (**self).new_batch(params)
    }

    fn free_batch(&mut self, batch: BatchHandle) {
        (**self).free_batch(batch)
    }

    fn new_sampler(&mut self) -> Option<SamplerHandle> {
        (**self).new_sampler()
    }

    fn free_sampler(&mut self, sampler: SamplerHandle) {
        (**self).free_sampler(sampler)
    }

    fn completion_init(
        &mut self,
        context: &ContextHandle,
        batch: &BatchHandle,
        prompt: &str,
        n_len: usize,
    ) -> Option<usize> {
        (**self).completion_init(context, batch, prompt, n_len)
    }

    fn completion_step(
        &mut self,
        context: &ContextHandle,
        batch: &BatchHandle,
        sampler: &SamplerHandle,
        n_len: usize,
        cursor: usize,
    ) -> Option<String> {
        (**self).completion_step(context, batch, sampler, n_len, cursor)
    }

    fn clear_cache(&mut self, context: &ContextHandle) {
        (**self).clear_cache(context)
    }
}
