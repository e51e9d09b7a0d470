//! The public entry point: load, unload, and send.
//!
//! A [`Coordinator`] is constructed once per process and shared (typically in
//! an `Arc`) with everything that needs the model. It is not a global; pass it
//! where it is needed.
//!
//! # Lifecycle protocol
//!
//! `load` and `unload` each:
//! 1. raise the unload intent, so new sessions are refused;
//! 2. wait, polling, until no session is in flight;
//! 3. run the transition as a single job on the run loop;
//! 4. clear the intent, on every exit path.
//!
//! The wait happens on the caller's task, leaving the run loop free to
//! process the cleanup of sessions that are still winding down.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use llama_engine::NativeEngine;
use tokio::sync::Mutex;
use tracing::warn;

use crate::config::RunloopConfig;
use crate::engine::actor::RunLoop;
use crate::engine::Worker;
use crate::error::Result;
use crate::gate::QuiescenceGate;
use crate::session::GenerationStream;

/// Model lifecycle and generation coordinator.
pub struct Coordinator {
    run_loop: Arc<RunLoop>,
    gate: Arc<QuiescenceGate>,
    /// Serializes lifecycle transitions against each other.
    lifecycle: Mutex<()>,
    config: RunloopConfig,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("gate", &self.gate)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    /// Validate `config` and start the run loop thread for `engine`.
    ///
    /// The engine is initialized lazily, on the run loop, before the first
    /// operation.
    pub fn new(engine: impl NativeEngine, config: RunloopConfig) -> Result<Self> {
        config.validate()?;
        let gate = QuiescenceGate::new();
        let worker = Worker::new(Box::new(engine), Arc::clone(&gate));
        let run_loop = Arc::new(RunLoop::spawn(worker, &config.thread_name)?);
        Ok(Self {
            run_loop,
            gate,
            lifecycle: Mutex::new(()),
            config,
        })
    }

    /// Load the model at `path`, replacing the current one.
    ///
    /// On failure the previously loaded model, if any, stays loaded.
    pub async fn load(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref().to_path_buf();
        let _lifecycle = self.lifecycle.lock().await;
        let _transition = self.gate.begin_transition();
        self.gate.drain(self.config.drain_poll_interval()).await;
        self.run_loop
            .call(move |worker| worker.load_model(&path))
            .await
    }

    /// Release the current model. A no-op when nothing is loaded.
    pub async fn unload(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let _transition = self.gate.begin_transition();
        self.gate.drain(self.config.drain_poll_interval()).await;
        self.run_loop
            .call(|worker| {
                worker.unload_model();
                Ok(())
            })
            .await
    }

    /// Start generating a completion for `prompt`.
    ///
    /// Fails immediately with `ModelUnloading` while a transition is pending.
    /// Every other failure (`ModelNotLoaded`, `ResourceExhausted`,
    /// `EngineInit`, `Cancelled`) arrives as an item of the returned stream,
    /// after which the stream ends.
    pub fn send(&self, prompt: impl Into<String>) -> Result<GenerationStream> {
        let ticket = match self.gate.try_enter() {
            Ok(ticket) => ticket,
            Err(e) => {
                warn!("send rejected: lifecycle transition in progress");
                return Err(e);
            }
        };
        Ok(GenerationStream::new(
            Arc::clone(&self.run_loop),
            ticket,
            prompt.into(),
            self.config.n_len,
            self.config.batch_params(),
        ))
    }

    /// Path of the loaded model, if any.
    pub async fn loaded_model(&self) -> Result<Option<PathBuf>> {
        self.run_loop.call(|worker| Ok(worker.loaded_path())).await
    }

    /// Sessions currently holding the gate.
    pub fn in_flight(&self) -> usize {
        self.gate.in_flight()
    }

    /// Whether a load or unload is pending or running.
    pub fn is_unloading(&self) -> bool {
        self.gate.is_unloading()
    }

    pub fn config(&self) -> &RunloopConfig {
        &self.config
    }
}
