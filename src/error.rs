//! Error types for the llama-runloop crate.

use thiserror::Error;

/// Top-level error type for coordinator operations.
#[derive(Error, Debug)]
pub enum LlamaError {
    /// A native constructor returned a null handle, or prompt evaluation failed.
    #[error("engine initialization failed: {0}")]
    EngineInit(String),

    #[error("model not loaded")]
    ModelNotLoaded,

    /// A load or unload is in progress; no new session may start.
    #[error("model is unloading, try again later")]
    ModelUnloading,

    /// Per-session batch or sampler allocation failed.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The stream was interrupted by a lifecycle transition.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// A submission panicked on the run loop, or the run loop is gone.
    #[error("run loop failure: {0}")]
    RunLoop(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LlamaError {
    /// Whether the failure is transient: the same request may succeed once the
    /// pending lifecycle transition completes.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LlamaError::ModelUnloading | LlamaError::Cancelled(_))
    }
}

pub type Result<T> = std::result::Result<T, LlamaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_class() {
        assert!(LlamaError::ModelUnloading.is_retryable());
        assert!(LlamaError::Cancelled("unload".into()).is_retryable());
        assert!(!LlamaError::ModelNotLoaded.is_retryable());
        assert!(!LlamaError::EngineInit("load_model() failed".into()).is_retryable());
        assert!(!LlamaError::ResourceExhausted("batch".into()).is_retryable());
    }

    #[test]
    fn display_messages() {
        assert_eq!(LlamaError::ModelNotLoaded.to_string(), "model not loaded");
        assert_eq!(
            LlamaError::EngineInit("new_context() failed".into()).to_string(),
            "engine initialization failed: new_context() failed"
        );
    }
}
