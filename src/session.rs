//! Generation sessions.
//!
//! A [`GenerationStream`] is the caller's side of one `send`: a lazy,
//! single-consumer stream of text fragments. Each poll submits one completion
//! step to the run loop, so the consumer's pace drives generation.
//!
//! The stream owns a `SessionGuard`. Whether the stream finishes, fails, or
//! is dropped half way, the guard queues the session's cleanup on the run
//! loop and only returns its gate ticket after the native resources are gone.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_stream::try_stream;
use futures::stream::{FusedStream, Stream, StreamExt};
use llama_engine::BatchParams;
use uuid::Uuid;

use crate::engine::actor::RunLoop;
use crate::error::Result;
use crate::gate::GateTicket;

/// Releases a session when dropped.
struct SessionGuard {
    id: Uuid,
    run_loop: Arc<RunLoop>,
    ticket: Option<GateTicket>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let id = self.id;
        let ticket = self.ticket.take();
        // If the run loop is gone the job is dropped unrun, which still
        // returns the ticket; the worker released the session on shutdown.
        let _ = self.run_loop.post(move |worker| {
            worker.close_session(id);
            drop(ticket);
        });
    }
}

/// Lazy stream of generated text fragments.
///
/// Not restartable: once it has ended, every further poll yields `None`.
/// Generating again requires a new `send`.
pub struct GenerationStream {
    id: Uuid,
    inner: Pin<Box<dyn Stream<Item = Result<String>> + Send>>,
    done: bool,
}

impl GenerationStream {
    pub(crate) fn new(
        run_loop: Arc<RunLoop>,
        ticket: GateTicket,
        prompt: String,
        n_len: usize,
        params: BatchParams,
    ) -> Self {
        let id = Uuid::new_v4();
        let guard = SessionGuard {
            id,
            run_loop: Arc::clone(&run_loop),
            ticket: Some(ticket),
        };
        Self {
            id,
            inner: Box::pin(fragments(guard, run_loop, prompt, n_len, params)),
            done: false,
        }
    }

    /// Identifier used for this session in logs.
    pub fn session_id(&self) -> Uuid {
        self.id
    }

    /// Drain the stream into one string, stopping at the first error.
    pub async fn collect_text(mut self) -> Result<String> {
        let mut text = String::new();
        while let Some(piece) = self.next().await {
            text.push_str(&piece?);
        }
        Ok(text)
    }
}

fn fragments(
    guard: SessionGuard,
    run_loop: Arc<RunLoop>,
    prompt: String,
    n_len: usize,
    params: BatchParams,
) -> impl Stream<Item = Result<String>> + Send {
    try_stream! {
        let id = guard.id;
        // Keep guard alive for the lifetime of the stream.
        let _guard = guard;

        run_loop
            .call(move |worker| worker.open_session(id, &prompt, n_len, params))
            .await?;

        loop {
            let step = run_loop.call(move |worker| worker.step_session(id)).await?;
            match step {
                Some(piece) => yield piece,
                None => break,
            }
        }
    }
}

impl Stream for GenerationStream {
    type Item = Result<String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        let next = self.inner.as_mut().poll_next(cx);
        if let Poll::Ready(None) = next {
            self.done = true;
        }
        next
    }
}

impl FusedStream for GenerationStream {
    fn is_terminated(&self) -> bool {
        self.done
    }
}

impl std::fmt::Debug for GenerationStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationStream")
            .field("id", &self.id)
            .field("done", &self.done)
            .finish()
    }
}
