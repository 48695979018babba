//! Execution backend capability.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use cnap_core::{ChatMessage, RunnerStatus};
use serde::{Deserialize, Serialize};

use crate::error::BackendError;

/// Configuration handed to [`ExecutionBackend::start`].
///
/// The runner passes it through untouched; only the backend interprets it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Container image reference (or executable, for process backends).
    pub image: String,

    /// Command-line arguments.
    pub args: Vec<String>,

    /// Environment variables.
    pub env: HashMap<String, String>,

    /// Working directory.
    pub workdir: Option<PathBuf>,
}

impl RunnerConfig {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    /// Builder method to add an argument.
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Builder method to add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Builder method to set the working directory.
    pub fn with_workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }
}

/// A sandboxed substrate (process, container, ...) a runner can drive.
///
/// Implementations manage their own interior state; the runner calls these
/// through a shared reference and may do so from any task.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Start the backend with the given configuration.
    async fn start(&self, config: &RunnerConfig) -> Result<(), BackendError>;

    /// Deliver a message to the running backend.
    async fn send(&self, message: &ChatMessage) -> Result<(), BackendError>;

    /// Report the backend's current status.
    async fn status(&self) -> Result<RunnerStatus, BackendError>;

    /// Stop the backend.
    async fn stop(&self) -> Result<(), BackendError>;
}
