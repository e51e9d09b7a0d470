//! The run loop: one dedicated OS thread for every native call.
//!
//! The native engine is non-reentrant and must not be touched from more than
//! one thread. The run loop owns the [`Worker`] on a named thread and executes
//! submitted jobs one at a time, in submission order.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐   crossbeam FIFO    ┌───────────────────────┐
//! │ Coordinator /    │ ─── Job ──────────> │ Run loop thread        │
//! │ GenerationStream │ <── oneshot reply ─ │  Owns: Worker (engine, │
//! │ (any task)       │                     │  state, sessions)      │
//! └──────────────────┘                     └───────────────────────┘
//! ```
//!
//! The queue is unbounded so that posting from `Drop` never blocks. A job
//! that panics is reported to its submitter as [`LlamaError::RunLoop`]; the
//! thread keeps serving later jobs.
//!
//! Engine initialization runs lazily inside the first [`RunLoop::call`], under
//! the same panic guard as the job. A panicking init fails that call and is
//! retried by the next one. Fire-and-forget jobs only release sessions, which
//! cannot exist before a call has initialized the engine.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tokio::sync::oneshot;

use crate::engine::Worker;
use crate::error::{LlamaError, Result};

type Job = Box<dyn FnOnce(&mut Worker) + Send>;

/// Commands sent to the run loop thread.
enum Command {
    /// Execute a job against the worker.
    Run(Job),

    /// Release all native resources and exit.
    Shutdown,
}

/// Handle to the run loop thread.
///
/// Dropping the last handle shuts the thread down and joins it.
pub(crate) struct RunLoop {
    cmd_tx: Sender<Command>,
    thread: Option<thread::JoinHandle<()>>,
}

impl RunLoop {
    /// Spawn the run loop on a thread called `name`.
    pub fn spawn(worker: Worker, name: &str) -> Result<Self> {
        let (cmd_tx, cmd_rx) = unbounded::<Command>();

        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_loop(worker, cmd_rx))?;

        Ok(RunLoop {
            cmd_tx,
            thread: Some(thread),
        })
    }

    /// Queue a job without waiting for it.
    pub fn post<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce(&mut Worker) + Send + 'static,
    {
        self.cmd_tx
            .send(Command::Run(Box::new(job)))
            .map_err(|_| LlamaError::RunLoop("run loop has shut down".into()))
    }

    /// Queue a job and wait for its result.
    pub async fn call<T, F>(&self, job: F) -> Result<T>
    where
        F: FnOnce(&mut Worker) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.post(move |worker| {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                worker.ensure_initialized();
                job(worker)
            }))
            .unwrap_or_else(|payload| {
                let message = panic_message(&*payload);
                tracing::error!(panic = %message, "run loop call panicked");
                Err(LlamaError::RunLoop(message))
            });
            let _ = reply_tx.send(outcome);
        })?;
        reply_rx
            .await
            .map_err(|_| LlamaError::RunLoop("run loop dropped the submission".into()))?
    }
}

impl Drop for RunLoop {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
        if let Some(thread) = self.thread.take() {
            // The last handle can be released by a job on the run loop itself.
            if thread.thread().id() != thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}

/// The main loop running on the dedicated native thread.
fn run_loop(mut worker: Worker, cmd_rx: Receiver<Command>) {
    loop {
        match cmd_rx.recv() {
            Ok(Command::Run(job)) => {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| job(&mut worker))) {
                    tracing::error!(panic = %panic_message(&*payload), "run loop job panicked");
                }
            }

            Ok(Command::Shutdown) | Err(_) => break,
        }
    }
    worker.shutdown();
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "job panicked".to_string()
    }
}
