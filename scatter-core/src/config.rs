use crate::error::{Result, ScatterError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Scattered mode keeps a primary and one backup copy of every entry.
pub const NUM_OWNERS: usize = 2;

/// When a node may read an entry locally without asking the primary owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BiasAcquisition {
    Never,
    #[default]
    OnRead,
    OnWrite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScatteredConfig {
    #[serde(default = "default_num_segments")]
    pub num_segments: u16,
    /// Pending invalidations are flushed once more than this many keys are queued.
    #[serde(default = "default_invalidation_batch_size")]
    pub invalidation_batch_size: usize,
    /// Upper bound on how long an invalidation waits in the queue.
    #[serde(default = "default_invalidation_flush_interval_ms")]
    pub invalidation_flush_interval_ms: u64,
    #[serde(default = "default_invalidation_retries")]
    pub invalidation_retries: usize,
    #[serde(default = "default_remote_timeout_ms")]
    pub remote_timeout_ms: u64,
    #[serde(default = "default_state_transfer_timeout_ms")]
    pub state_transfer_timeout_ms: u64,
    #[serde(default = "default_state_transfer_chunk_size")]
    pub state_transfer_chunk_size: usize,
    #[serde(default = "default_true")]
    pub fetch_in_memory_state: bool,
    #[serde(default)]
    pub bias_acquisition: BiasAcquisition,
    #[serde(default = "default_bias_lifespan_ms")]
    pub bias_lifespan_ms: u64,
    #[serde(default = "default_max_local_biases")]
    pub max_local_biases: usize,
    #[serde(default = "default_max_command_retries")]
    pub max_command_retries: usize,
}

fn default_num_segments() -> u16 {
    256
}

fn default_invalidation_batch_size() -> usize {
    128
}

fn default_invalidation_flush_interval_ms() -> u64 {
    100
}

fn default_invalidation_retries() -> usize {
    3
}

fn default_remote_timeout_ms() -> u64 {
    15_000
}

fn default_state_transfer_timeout_ms() -> u64 {
    60_000
}

fn default_state_transfer_chunk_size() -> usize {
    512
}

fn default_true() -> bool {
    true
}

fn default_bias_lifespan_ms() -> u64 {
    300_000
}

fn default_max_local_biases() -> usize {
    65_536
}

fn default_max_command_retries() -> usize {
    8
}

impl Default for ScatteredConfig {
    fn default() -> Self {
        Self {
            num_segments: default_num_segments(),
            invalidation_batch_size: default_invalidation_batch_size(),
            invalidation_flush_interval_ms: default_invalidation_flush_interval_ms(),
            invalidation_retries: default_invalidation_retries(),
            remote_timeout_ms: default_remote_timeout_ms(),
            state_transfer_timeout_ms: default_state_transfer_timeout_ms(),
            state_transfer_chunk_size: default_state_transfer_chunk_size(),
            fetch_in_memory_state: true,
            bias_acquisition: BiasAcquisition::default(),
            bias_lifespan_ms: default_bias_lifespan_ms(),
            max_local_biases: default_max_local_biases(),
            max_command_retries: default_max_command_retries(),
        }
    }
}

impl ScatteredConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_segments == 0 {
            return Err(ScatterError::Config(
                "num_segments must be greater than zero".to_string(),
            ));
        }

        if self.invalidation_batch_size == 0 {
            return Err(ScatterError::Config(
                "invalidation_batch_size must be greater than zero".to_string(),
            ));
        }

        if self.state_transfer_chunk_size == 0 {
            return Err(ScatterError::Config(
                "state_transfer_chunk_size must be greater than zero".to_string(),
            ));
        }

        if self.remote_timeout_ms == 0 || self.state_transfer_timeout_ms == 0 {
            return Err(ScatterError::Config(
                "timeouts must be greater than zero".to_string(),
            ));
        }

        if self.remote_timeout_ms > self.state_transfer_timeout_ms {
            return Err(ScatterError::Config(format!(
                "remote_timeout_ms ({}) cannot exceed state_transfer_timeout_ms ({})",
                self.remote_timeout_ms, self.state_transfer_timeout_ms
            )));
        }

        if self.max_command_retries == 0 {
            return Err(ScatterError::Config(
                "max_command_retries must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    pub fn state_transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.state_transfer_timeout_ms)
    }

    pub fn invalidation_flush_interval(&self) -> Duration {
        Duration::from_millis(self.invalidation_flush_interval_ms)
    }

    pub fn bias_lifespan(&self) -> Duration {
        Duration::from_millis(self.bias_lifespan_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        ScatteredConfig::default().validate().unwrap();
    }

    #[test]
    fn test_rejects_remote_timeout_above_transfer_timeout() {
        let config = ScatteredConfig {
            remote_timeout_ms: 10_000,
            state_transfer_timeout_ms: 5_000,
            ..ScatteredConfig::default()
        };

        let error = config.validate().unwrap_err();
        assert!(matches!(error, ScatterError::Config(_)));
    }

    #[test]
    fn test_deserialize_fills_defaults() {
        let config: ScatteredConfig =
            serde_json::from_str(r#"{"num_segments": 16, "bias_acquisition": "on_write"}"#)
                .unwrap();
        assert_eq!(config.num_segments, 16);
        assert_eq!(config.bias_acquisition, BiasAcquisition::OnWrite);
        assert_eq!(config.invalidation_batch_size, 128);
    }
}
