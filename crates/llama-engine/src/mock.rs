//! Deterministic in-memory engine.
//!
//! [`MockEngine`] hands out sequential raw handles and records every call in a
//! shared [`Ledger`], including the name of the thread the call arrived on.
//! The ledger flags use of a dead handle and double frees as violations
//! instead of crashing, so tests can assert on them.
//!
//! Generation either replays a fixed script of byte pieces or, by default,
//! echoes the prompt word by word.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use crate::{
    BatchHandle, BatchParams, ContextHandle, ModelHandle, NativeEngine, PieceBuffer,
    SamplerHandle,
};

/// One recorded engine call. Handles are recorded by raw value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    InitLogging,
    InitBackend,
    SystemInfo,
    FreeBackend,
    LoadModel(PathBuf),
    FreeModel(u64),
    NewContext { model: u64 },
    FreeContext(u64),
    NewBatch(BatchParams),
    FreeBatch(u64),
    NewSampler,
    FreeSampler(u64),
    CompletionInit { context: u64, n_len: usize },
    CompletionStep { context: u64, cursor: usize },
    ClearCache(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Model,
    Context,
    Batch,
    Sampler,
}

#[derive(Debug, Default)]
struct LedgerState {
    calls: Vec<(String, Call)>,
    live: HashMap<u64, Kind>,
    violations: Vec<String>,
}

/// Shared record of everything a [`MockEngine`] was asked to do.
///
/// Cloning is cheap; all clones observe the same record.
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    inner: Arc<Mutex<LedgerState>>,
}

impl Ledger {
    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// All calls in the order they were made.
    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.iter().map(|(_, c)| c.clone()).collect()
    }

    /// Names of every thread that called into the engine.
    pub fn threads(&self) -> HashSet<String> {
        self.lock().calls.iter().map(|(t, _)| t.clone()).collect()
    }

    /// Number of recorded calls matching `pred`.
    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.lock().calls.iter().filter(|(_, c)| pred(c)).count()
    }

    /// Number of handles allocated and not yet freed.
    pub fn live_handles(&self) -> usize {
        self.lock().live.len()
    }

    /// Whether the raw handle is currently allocated.
    pub fn is_live(&self, raw: u64) -> bool {
        self.lock().live.contains_key(&raw)
    }

    /// Handle misuse observed so far (double free, use after free).
    pub fn violations(&self) -> Vec<String> {
        self.lock().violations.clone()
    }

    fn record(&self, call: Call) {
        let name = thread::current()
            .name()
            .unwrap_or("<unnamed>")
            .to_string();
        self.lock().calls.push((name, call));
    }

    fn allocate(&self, raw: u64, kind: Kind) {
        self.lock().live.insert(raw, kind);
    }

    fn release(&self, raw: u64, kind: Kind) {
        let mut state = self.lock();
        if state.live.get(&raw) == Some(&kind) {
            state.live.remove(&raw);
        } else {
            state
                .violations
                .push(format!("free of dead {kind:?} handle {raw}"));
        }
    }

    fn check(&self, raw: u64, kind: Kind, op: &str) {
        let mut state = self.lock();
        if state.live.get(&raw) != Some(&kind) {
            state
                .violations
                .push(format!("{op} used dead {kind:?} handle {raw}"));
        }
    }
}

struct ContextState {
    pending: VecDeque<Vec<u8>>,
    buffer: PieceBuffer,
}

/// In-memory [`NativeEngine`] with configurable failures.
pub struct MockEngine {
    ledger: Ledger,
    next_raw: u64,
    script: Option<Vec<Vec<u8>>>,
    respect_n_len: bool,
    fail_loads: HashSet<PathBuf>,
    fail_contexts: HashSet<PathBuf>,
    panic_loads: HashSet<PathBuf>,
    panic_init: bool,
    panic_step: bool,
    panic_clear: bool,
    fail_batch: bool,
    fail_sampler: bool,
    models: HashMap<u64, PathBuf>,
    contexts: HashMap<u64, ContextState>,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            ledger: Ledger::default(),
            next_raw: 1,
            script: None,
            respect_n_len: true,
            fail_loads: HashSet::new(),
            fail_contexts: HashSet::new(),
            panic_loads: HashSet::new(),
            panic_init: false,
            panic_step: false,
            panic_clear: false,
            fail_batch: false,
            fail_sampler: false,
            models: HashMap::new(),
            contexts: HashMap::new(),
        }
    }

    /// Replay these byte pieces on every completion instead of echoing.
    pub fn with_script<I, P>(mut self, pieces: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Vec<u8>>,
    {
        self.script = Some(pieces.into_iter().map(Into::into).collect());
        self
    }

    /// Keep producing pieces past `n_len`, leaving the bound to the caller.
    pub fn ignore_n_len(mut self) -> Self {
        self.respect_n_len = false;
        self
    }

    /// Make `load_model` return null for `path`.
    pub fn fail_load(mut self, path: impl Into<PathBuf>) -> Self {
        self.fail_loads.insert(path.into());
        self
    }

    /// Make `new_context` return null for models loaded from `path`.
    pub fn fail_context(mut self, path: impl Into<PathBuf>) -> Self {
        self.fail_contexts.insert(path.into());
        self
    }

    /// Make `load_model` panic for `path`.
    pub fn panic_on_load(mut self, path: impl Into<PathBuf>) -> Self {
        self.panic_loads.insert(path.into());
        self
    }

    /// Make the first `init_backend` panic. Later calls succeed.
    pub fn panic_on_first_init(mut self) -> Self {
        self.panic_init = true;
        self
    }

    /// Make every `completion_step` panic.
    pub fn panic_on_step(mut self) -> Self {
        self.panic_step = true;
        self
    }

    /// Make every `clear_cache` panic.
    pub fn panic_on_clear_cache(mut self) -> Self {
        self.panic_clear = true;
        self
    }

    /// Make every `new_batch` return null.
    pub fn fail_batch(mut self) -> Self {
        self.fail_batch = true;
        self
    }

    /// Make every `new_sampler` return null.
    pub fn fail_sampler(mut self) -> Self {
        self.fail_sampler = true;
        self
    }

    /// Shared view of the calls this engine receives.
    pub fn ledger(&self) -> Ledger {
        self.ledger.clone()
    }

    fn next(&mut self, kind: Kind) -> u64 {
        let raw = self.next_raw;
        self.next_raw += 1;
        self.ledger.allocate(raw, kind);
        raw
    }

    fn prompt_pieces(&self, prompt: &str) -> VecDeque<Vec<u8>> {
        match &self.script {
            Some(script) => script.iter().cloned().collect(),
            None => prompt
                .split_whitespace()
                .enumerate()
                .map(|(i, word)| {
                    if i == 0 {
                        word.as_bytes().to_vec()
                    } else {
                        format!(" {word}").into_bytes()
                    }
                })
                .collect(),
        }
    }
}

impl NativeEngine for MockEngine {
    fn init_logging(&mut self) {
        self.ledger.record(Call::InitLogging);
    }

    fn init_backend(&mut self) {
        self.ledger.record(Call::InitBackend);
        if self.panic_init {
            self.panic_init = false;
            panic!("mock engine crashed in init_backend");
        }
    }

    fn system_info(&mut self) -> String {
        self.ledger.record(Call::SystemInfo);
        "MOCK = 1 | THREADS = 1".to_string()
    }

    fn free_backend(&mut self) {
        self.ledger.record(Call::FreeBackend);
    }

    fn load_model(&mut self, path: &Path) -> Option<ModelHandle> {
        self.ledger.record(Call::LoadModel(path.to_path_buf()));
        if self.panic_loads.contains(path) {
            panic!("mock engine crashed loading {}", path.display());
        }
        if self.fail_loads.contains(path) {
            return None;
        }
        let raw = self.next(Kind::Model);
        self.models.insert(raw, path.to_path_buf());
        ModelHandle::from_raw(raw)
    }

    fn free_model(&mut self, model: ModelHandle) {
        let raw = model.as_raw();
        self.ledger.record(Call::FreeModel(raw));
        self.ledger.release(raw, Kind::Model);
        self.models.remove(&raw);
    }

    fn new_context(&mut self, model: &ModelHandle) -> Option<ContextHandle> {
        let raw_model = model.as_raw();
        self.ledger.record(Call::NewContext { model: raw_model });
        self.ledger.check(raw_model, Kind::Model, "new_context");
        if let Some(path) = self.models.get(&raw_model) {
            if self.fail_contexts.contains(path) {
                return None;
            }
        }
        let raw = self.next(Kind::Context);
        self.contexts.insert(
            raw,
            ContextState {
                pending: VecDeque::new(),
                buffer: PieceBuffer::new(),
            },
        );
        ContextHandle::from_raw(raw)
    }

    fn free_context(&mut self, context: ContextHandle) {
        let raw = context.as_raw();
        self.ledger.record(Call::FreeContext(raw));
        self.ledger.release(raw, Kind::Context);
        self.contexts.remove(&raw);
    }

    fn new_batch(&mut self, params: BatchParams) -> Option<BatchHandle> {
        self.ledger.record(Call::NewBatch(params));
        if self.fail_batch || params.n_tokens == 0 {
            return None;
        }
        BatchHandle::from_raw(self.next(Kind::Batch))
    }

    fn free_batch(&mut self, batch: BatchHandle) {
        let raw = batch.as_raw();
        self.ledger.record(Call::FreeBatch(raw));
        self.ledger.release(raw, Kind::Batch);
    }

    fn new_sampler(&mut self) -> Option<SamplerHandle> {
        self.ledger.record(Call::NewSampler);
        if self.fail_sampler {
            return None;
        }
        SamplerHandle::from_raw(self.next(Kind::Sampler))
    }

    fn free_sampler(&mut self, sampler: SamplerHandle) {
        let raw = sampler.as_raw();
        self.ledger.record(Call::FreeSampler(raw));
        self.ledger.release(raw, Kind::Sampler);
    }

    fn completion_init(
        &mut self,
        context: &ContextHandle,
        batch: &BatchHandle,
        prompt: &str,
        n_len: usize,
    ) -> Option<usize> {
        let raw = context.as_raw();
        self.ledger.record(Call::CompletionInit { context: raw, n_len });
        self.ledger.check(raw, Kind::Context, "completion_init");
        self.ledger.check(batch.as_raw(), Kind::Batch, "completion_init");

        let n_prompt = prompt.split_whitespace().count();
        if n_prompt == 0 {
            return None;
        }
        let pieces = self.prompt_pieces(prompt);
        let state = self.contexts.get_mut(&raw)?;
        state.pending = pieces;
        state.buffer.clear();
        Some(n_prompt)
    }

    fn completion_step(
        &mut self,
        context: &ContextHandle,
        batch: &BatchHandle,
        sampler: &SamplerHandle,
        n_len: usize,
        cursor: usize,
    ) -> Option<String> {
        let raw = context.as_raw();
        self.ledger.record(Call::CompletionStep {
            context: raw,
            cursor,
        });
        self.ledger.check(raw, Kind::Context, "completion_step");
        self.ledger.check(batch.as_raw(), Kind::Batch, "completion_step");
        self.ledger
            .check(sampler.as_raw(), Kind::Sampler, "completion_step");
        if self.panic_step {
            panic!("mock engine crashed at cursor {cursor}");
        }

        if self.respect_n_len && cursor >= n_len {
            return None;
        }
        let state = self.contexts.get_mut(&raw)?;
        let piece = state.pending.pop_front()?;
        Some(state.buffer.push(&piece))
    }

    fn clear_cache(&mut self, context: &ContextHandle) {
        let raw = context.as_raw();
        self.ledger.record(Call::ClearCache(raw));
        self.ledger.check(raw, Kind::Context, "clear_cache");
        if self.panic_clear {
            panic!("mock engine crashed clearing cache");
        }
        if let Some(state) = self.contexts.get_mut(&raw) {
            state.pending.clear();
            state.buffer.clear();
        }
    }
}
