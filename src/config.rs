//! Configuration for the run loop and generation sessions.

use std::path::Path;
use std::time::Duration;

use llama_engine::BatchParams;
use serde::{Deserialize, Serialize};

use crate::error::{LlamaError, Result};

/// Coordinator configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunloopConfig {
    /// Generation bound passed to the completion loop.
    pub n_len: usize,

    /// Batch width for each session.
    pub batch_tokens: usize,

    /// Embedding width for each session's batch (0 = token ids).
    pub batch_embd: usize,

    /// Sequence width for each session's batch.
    pub batch_seq_max: usize,

    /// How often a lifecycle transition re-checks the in-flight count.
    pub drain_poll_interval_ms: u64,

    /// Name of the dedicated native thread.
    pub thread_name: String,
}

impl Default for RunloopConfig {
    fn default() -> Self {
        Self {
            n_len: 64,
            batch_tokens: 512,
            batch_embd: 0,
            batch_seq_max: 1,
            drain_poll_interval_ms: 50,
            thread_name: "llm-runloop".to_string(),
        }
    }
}

impl RunloopConfig {
    /// Create a new config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a config from a JSON file. Missing fields take their defaults.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Set the generation bound.
    pub fn with_n_len(mut self, n_len: usize) -> Self {
        self.n_len = n_len;
        self
    }

    /// Set the batch geometry.
    pub fn with_batch(mut self, params: BatchParams) -> Self {
        self.batch_tokens = params.n_tokens;
        self.batch_embd = params.embd;
        self.batch_seq_max = params.n_seq_max;
        self
    }

    /// Set the drain poll interval, rounded up to whole milliseconds.
    pub fn with_drain_poll_interval(mut self, interval: Duration) -> Self {
        let ms = interval.as_nanos().div_ceil(1_000_000);
        self.drain_poll_interval_ms = u64::try_from(ms).unwrap_or(u64::MAX);
        self
    }

    /// Set the worker thread name.
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    pub fn batch_params(&self) -> BatchParams {
        BatchParams {
            n_tokens: self.batch_tokens,
            embd: self.batch_embd,
            n_seq_max: self.batch_seq_max,
        }
    }

    pub fn drain_poll_interval(&self) -> Duration {
        Duration::from_millis(self.drain_poll_interval_ms)
    }

    /// Reject values the native layer cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.n_len == 0 {
            return Err(LlamaError::Config("n_len must be positive".into()));
        }
        if self.batch_tokens == 0 || self.batch_seq_max == 0 {
            return Err(LlamaError::Config(format!(
                "batch geometry {}x{} is empty",
                self.batch_tokens, self.batch_seq_max
            )));
        }
        if self.drain_poll_interval_ms == 0 {
            return Err(LlamaError::Config(
                "drain_poll_interval_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RunloopConfig::default();
        assert_eq!(config.n_len, 64);
        assert_eq!(config.batch_params(), BatchParams::default());
        assert_eq!(config.drain_poll_interval(), Duration::from_millis(50));
        assert_eq!(config.thread_name, "llm-runloop");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json() {
        let json = r#"{ "n_len": 128, "drain_poll_interval_ms": 10 }"#;
        let config: RunloopConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.n_len, 128);
        assert_eq!(config.drain_poll_interval_ms, 10);
        assert_eq!(config.batch_tokens, 512);
    }

    #[test]
    fn test_builder() {
        let config = RunloopConfig::new()
            .with_n_len(8)
            .with_drain_poll_interval(Duration::from_millis(5))
            .with_thread_name("native");
        assert_eq!(config.n_len, 8);
        assert_eq!(config.drain_poll_interval_ms, 5);
        assert_eq!(config.thread_name, "native");
    }

    #[test]
    fn test_sub_millisecond_interval_rounds_up() {
        let config = RunloopConfig::new().with_drain_poll_interval(Duration::from_micros(200));
        assert_eq!(config.drain_poll_interval_ms, 1);
        assert!(config.validate().is_ok());

        let config = RunloopConfig::new().with_drain_poll_interval(Duration::from_micros(1500));
        assert_eq!(config.drain_poll_interval_ms, 2);

        let config = RunloopConfig::new().with_drain_poll_interval(Duration::ZERO);
        assert!(matches!(config.validate(), Err(LlamaError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero() {
        assert!(RunloopConfig::new().with_n_len(0).validate().is_err());
        let mut config = RunloopConfig::new();
        config.batch_tokens = 0;
        assert!(matches!(config.validate(), Err(LlamaError::Config(_))));
        let mut config = RunloopConfig::new();
        config.drain_poll_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_json_file() {
        let path = std::env::temp_dir().join(format!("runloop-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{ "n_len": 16, "thread_name": "worker" }"#).unwrap();
        let config = RunloopConfig::from_json_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.n_len, 16);
        assert_eq!(config.thread_name, "worker");
    }
}
