//! Engine configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::error::{PipelineError, Result};
use crate::core::pool::BufferPoolConfig;

/// Configuration for a [`ProcessingContext`](crate::core::context::ProcessingContext).
///
/// Every field has a default, so `EngineConfig::default()` is a working
/// setup and TOML files only need to name what they change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Name given to the worker OS thread (visible in debuggers and
    /// profilers).
    pub worker_thread_name: String,
    pub pool: BufferPoolConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_thread_name: "framewire-worker".to_string(),
            pool: BufferPoolConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).map_err(|e| PipelineError::Configuration(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }
}
