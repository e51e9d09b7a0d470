//! Quiescence gate between lifecycle transitions and generation sessions.
//!
//! The unload intent and the in-flight count share one atomic word: the top
//! bit is the intent, the rest is the count. A session enters with a single
//! compare-and-swap that fails once the intent bit is set, so no session can
//! slip in between a transition raising its intent and draining.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{LlamaError, Result};

const INTENT: usize = 1 << (usize::BITS - 1);
const COUNT: usize = !INTENT;

/// Shared coordination flags.
#[derive(Debug, Default)]
pub struct QuiescenceGate {
    word: AtomicUsize,
}

impl QuiescenceGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a new session unless a transition is pending.
    ///
    /// The returned ticket decrements the count when dropped.
    pub fn try_enter(self: &Arc<Self>) -> Result<GateTicket> {
        self.word
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                if word & INTENT != 0 {
                    None
                } else {
                    Some(word + 1)
                }
            })
            .map_err(|_| LlamaError::ModelUnloading)?;
        Ok(GateTicket {
            gate: Arc::clone(self),
        })
    }

    /// Raise the unload intent. New sessions are refused until the returned
    /// guard is dropped.
    pub fn begin_transition(self: &Arc<Self>) -> TransitionGuard {
        self.word.fetch_or(INTENT, Ordering::AcqRel);
        TransitionGuard {
            gate: Arc::clone(self),
        }
    }

    /// Sessions currently holding a ticket.
    pub fn in_flight(&self) -> usize {
        self.word.load(Ordering::Acquire) & COUNT
    }

    pub fn is_unloading(&self) -> bool {
        self.word.load(Ordering::Acquire) & INTENT != 0
    }

    /// Wait until every ticket has been returned, re-checking every `poll`.
    pub async fn drain(&self, poll: Duration) {
        let mut waited = 0u32;
        loop {
            let n = self.in_flight();
            if n == 0 {
                break;
            }
            if waited == 0 {
                tracing::debug!(in_flight = n, "draining sessions");
            }
            waited += 1;
            tokio::time::sleep(poll).await;
        }
        if waited > 0 {
            tracing::debug!(polls = waited, "drain complete");
        }
    }
}

/// Proof that a session is counted as in flight.
#[derive(Debug)]
pub struct GateTicket {
    gate: Arc<QuiescenceGate>,
}

impl Drop for GateTicket {
    fn drop(&mut self) {
        self.gate.word.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Holds the unload intent for one lifecycle transition.
#[derive(Debug)]
pub struct TransitionGuard {
    gate: Arc<QuiescenceGate>,
}

impl Drop for TransitionGuard {
    fn drop(&mut self) {
        self.gate.word.fetch_and(COUNT, Ordering::AcqRel);
    }
}
