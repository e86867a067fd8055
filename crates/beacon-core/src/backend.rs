//! Container backend adapter.
//!
//! Backends run containers on some runtime (Docker, Kubernetes pods, ...)
//! keyed by a handle chosen by the ledger. They know nothing about owners.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::container::BindMount;

/// Errors surfaced by a backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// Nothing exists for the handle. Expected before creation.
    #[error("container not found: {0}")]
    NotFound(String),

    /// Something already exists under the handle.
    #[error("container already exists: {0}")]
    AlreadyExists(String),

    /// The request was rejected; retrying will not help.
    #[error("client error: {0}")]
    Client(String),

    /// The runtime failed server-side.
    #[error("server error: {0}")]
    Server(String),

    /// The runtime could not be reached.
    #[error("transport error: {0}")]
    Transport(String),
}

impl BackendError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound(_))
    }

    /// Server-side and transport failures are transient; everything else is not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackendError::Server(_) | BackendError::Transport(_))
    }

    /// Classify an HTTP status code returned by a runtime API.
    pub fn from_status(status: u16, handle: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            404 => BackendError::NotFound(handle.to_string()),
            409 => BackendError::AlreadyExists(handle.to_string()),
            500.. => BackendError::Server(message),
            _ => BackendError::Client(message),
        }
    }
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// An input streamed into the container before its main process starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputFetch {
    pub name: String,
    pub source_uri: String,
    pub dest_path: String,
}

/// The runtime definition of a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerDefinition {
    pub handle: String,
    pub image: String,
    pub env: BTreeMap<String, String>,
    pub dir: Option<String>,
    pub inputs: Vec<InputFetch>,
    pub outputs: Vec<String>,
    pub bind_mounts: Vec<BindMount>,
    pub labels: BTreeMap<String, String>,
}

/// A physical container as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendContainer {
    pub handle: String,
    /// Runtime-specific identifier (container id, pod uid).
    pub backend_id: String,
}

/// A process to run inside an existing container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub path: String,
    pub args: Vec<String>,
    pub dir: Option<String>,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProcessOutput {
    pub exit_code: i64,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[async_trait]
pub trait ContainerBackend: Send + Sync {
    /// Name of this backend.
    fn name(&self) -> &'static str;

    /// Find the physical container for a handle.
    async fn lookup(&self, handle: &str) -> BackendResult<BackendContainer>;

    /// Create and start a container under the given handle. Fails with
    /// `AlreadyExists` when the handle is taken.
    async fn create(&self, definition: &ContainerDefinition) -> BackendResult<BackendContainer>;

    /// Run a process to completion inside a container, feeding it `stdin`.
    async fn run(
        &self,
        container: &BackendContainer,
        process: &ProcessSpec,
        stdin: Vec<u8>,
    ) -> BackendResult<ProcessOutput>;

    /// Remove the physical container. Removing a missing container is not an error.
    async fn destroy(&self, handle: &str) -> BackendResult<()>;
}
