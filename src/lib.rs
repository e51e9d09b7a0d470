//! Model lifecycle and generation coordinator for native LLM engines.
//!
//! Native inference engines such as llama.cpp expose synchronous,
//! non-reentrant calls. This crate funnels every such call onto one dedicated
//! run loop thread, manages the lifetime of the engine's model, context,
//! batch, and sampler handles, and turns the engine's step-wise completion
//! loop into a cancellable stream of text fragments.
//!
//! ```no_run
//! use futures::StreamExt;
//! use llama_runloop::{Coordinator, RunloopConfig};
//! use llama_runloop::native::MockEngine;
//!
//! # async fn demo() -> llama_runloop::Result<()> {
//! let coordinator = Coordinator::new(MockEngine::new(), RunloopConfig::default())?;
//! coordinator.load("/models/tiny.gguf").await?;
//! let mut stream = coordinator.send("hello there")?;
//! while let Some(fragment) = stream.next().await {
//!     print!("{}", fragment?);
//! }
//! coordinator.unload().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod coordinator;
mod engine;
pub mod error;
mod gate;
pub mod session;
mod state;

pub use config::RunloopConfig;
pub use coordinator::Coordinator;
pub use error::{LlamaError, Result};
pub use llama_engine as native;
pub use session::GenerationStream;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
