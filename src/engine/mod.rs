//! Native-call sequencing for the run loop.
//!
//! A [`Worker`] owns the native engine, the resource state, and every open
//! generation session's batch and sampler. It lives on the run loop thread
//! (see [`actor`]) and is only reachable through submitted jobs, so native
//! calls are totally ordered and never overlap.
//!
//! Handles never leave the worker. Sessions are addressed by id; the caller
//! side only holds a [`Uuid`].

pub(crate) mod actor;

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use llama_engine::{BatchHandle, BatchParams, NativeEngine, SamplerHandle};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{LlamaError, Result};
use crate::gate::QuiescenceGate;
use crate::state::{LoadedModel, ResourceState};

/// Per-session native resources and loop position.
struct SessionSlot {
    batch: BatchHandle,
    sampler: SamplerHandle,
    /// Epoch of the model the session was opened against.
    epoch: u64,
    n_len: usize,
    cursor: usize,
    fragments: usize,
    started: Instant,
}

/// State confined to the run loop thread.
pub(crate) struct Worker {
    engine: Box<dyn NativeEngine>,
    state: ResourceState,
    sessions: HashMap<Uuid, SessionSlot>,
    gate: Arc<QuiescenceGate>,
    last_epoch: u64,
    initialized: bool,
}

impl Worker {
    pub fn new(engine: Box<dyn NativeEngine>, gate: Arc<QuiescenceGate>) -> Self {
        Self {
            engine,
            state: ResourceState::Empty,
            sessions: HashMap::new(),
            gate,
            last_epoch: 0,
            initialized: false,
        }
    }

    /// One-time engine setup, run before the first call.
    ///
    /// Only marked done once every step has returned, so a panicking init is
    /// attempted again by the next call.
    pub fn ensure_initialized(&mut self) {
        if self.initialized {
            return;
        }
        self.engine.init_logging();
        self.engine.init_backend();
        let info = self.engine.system_info();
        self.initialized = true;
        info!(system_info = %info, "native backend initialized");
    }

    /// Replace the loaded model with one read from `path`.
    ///
    /// The new model and context are built first; the previous ones are only
    /// released once both exist, so a failed load leaves the old model usable.
    pub fn load_model(&mut self, path: &Path) -> Result<()> {
        let model = self.engine.load_model(path).ok_or_else(|| {
            LlamaError::EngineInit(format!("load_model({}) failed", path.display()))
        })?;

        let context = match self.engine.new_context(&model) {
            Some(context) => context,
            None => {
                self.engine.free_model(model);
                return Err(LlamaError::EngineInit(format!(
                    "new_context() failed for {}",
                    path.display()
                )));
            }
        };

        if let Some(previous) = self.state.take() {
            info!(path = %previous.path.display(), "releasing previous model");
            self.release_model(previous);
        }

        self.last_epoch += 1;
        self.state = ResourceState::Loaded(LoadedModel {
            model,
            context,
            path: path.to_path_buf(),
            epoch: self.last_epoch,
        });
        info!(path = %path.display(), epoch = self.last_epoch, "loaded model");
        Ok(())
    }

    pub fn unload_model(&mut self) {
        if let Some(loaded) = self.state.take() {
            info!(path = %loaded.path.display(), "unloading model");
            self.release_model(loaded);
        }
    }

    pub fn loaded_path(&self) -> Option<PathBuf> {
        self.state.path().map(Path::to_path_buf)
    }

    /// Context before model, reverse of creation.
    fn release_model(&mut self, loaded: LoadedModel) {
        self.engine.free_context(loaded.context);
        self.engine.free_model(loaded.model);
    }

    /// Allocate a session's batch and sampler and evaluate its prompt.
    ///
    /// Once the slot is registered, every later failure leaves cleanup to
    /// [`close_session`](Self::close_session).
    pub fn open_session(
        &mut self,
        id: Uuid,
        prompt: &str,
        n_len: usize,
        params: BatchParams,
    ) -> Result<()> {
        let epoch = self
            .state
            .loaded()
            .map(|l| l.epoch)
            .ok_or(LlamaError::ModelNotLoaded)?;

        let batch = self.engine.new_batch(params).ok_or_else(|| {
            LlamaError::ResourceExhausted(format!(
                "new_batch({}, {}, {}) failed",
                params.n_tokens, params.embd, params.n_seq_max
            ))
        })?;
        let sampler = match self.engine.new_sampler() {
            Some(sampler) => sampler,
            None => {
                self.engine.free_batch(batch);
                return Err(LlamaError::ResourceExhausted(
                    "new_sampler() failed".into(),
                ));
            }
        };

        self.sessions.insert(
            id,
            SessionSlot {
                batch,
                sampler,
                epoch,
                n_len,
                cursor: 0,
                fragments: 0,
                started: Instant::now(),
            },
        );
        debug!(session = %id, epoch, "session opened");

        let Some(slot) = self.sessions.get_mut(&id) else {
            return Err(LlamaError::RunLoop(format!("session {id} vanished")));
        };
        let Some(loaded) = self.state.loaded_at(epoch) else {
            return Err(LlamaError::ModelNotLoaded);
        };
        slot.cursor = self
            .engine
            .completion_init(&loaded.context, &slot.batch, prompt, n_len)
            .ok_or_else(|| LlamaError::EngineInit("completion_init() failed".into()))?;
        Ok(())
    }

    /// Run one completion step for `id`.
    ///
    /// `Ok(None)` ends the stream. A changed model or a pending transition
    /// cancels it.
    pub fn step_session(&mut self, id: Uuid) -> Result<Option<String>> {
        let slot = self
            .sessions
            .get_mut(&id)
            .ok_or_else(|| LlamaError::RunLoop(format!("session {id} is not open")))?;

        let Some(loaded) = self.state.loaded_at(slot.epoch) else {
            warn!(session = %id, "model changed under session, cancelling");
            return Err(LlamaError::Cancelled("model was unloaded".into()));
        };
        if self.gate.is_unloading() {
            warn!(session = %id, "transition pending, cancelling");
            return Err(LlamaError::Cancelled("model is unloading".into()));
        }
        if slot.cursor > slot.n_len {
            return Ok(None);
        }

        match self.engine.completion_step(
            &loaded.context,
            &slot.batch,
            &slot.sampler,
            slot.n_len,
            slot.cursor,
        ) {
            Some(piece) => {
                slot.cursor += 1;
                slot.fragments += 1;
                Ok(Some(piece))
            }
            None => Ok(None),
        }
    }

    /// Release a session's resources: clear cached decode state, then free
    /// the sampler and the batch. Unknown ids are ignored.
    pub fn close_session(&mut self, id: Uuid) {
        let Some(slot) = self.sessions.remove(&id) else {
            return;
        };
        let SessionSlot {
            batch,
            sampler,
            epoch,
            fragments,
            started,
            ..
        } = slot;

        // Each release runs even if an earlier one panics.
        release_step(id, "clear_cache", || {
            if let Some(loaded) = self.state.loaded_at(epoch) {
                self.engine.clear_cache(&loaded.context);
            }
        });
        release_step(id, "free_sampler", || self.engine.free_sampler(sampler));
        release_step(id, "free_batch", || self.engine.free_batch(batch));

        let elapsed = started.elapsed();
        debug!(
            session = %id,
            fragments,
            elapsed_ms = elapsed.as_secs_f64() * 1000.0,
            "session closed"
        );
    }

    /// Release everything before the run loop exits.
    pub fn shutdown(&mut self) {
        let open: Vec<Uuid> = self.sessions.keys().copied().collect();
        for id in open {
            self.close_session(id);
        }
        self.unload_model();
        if self.initialized {
            self.engine.free_backend();
        }
        debug!("run loop worker shut down");
    }
}

fn release_step(session: Uuid, op: &str, f: impl FnOnce()) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
        error!(
            %session,
            op,
            panic = %actor::panic_message(&*payload),
            "native release panicked"
        );
    }
}
