//! Mapping workers to the backend that runs their containers.

use beacon_core::Result;
use beacon_core::backend::ContainerBackend;
use beacon_core::worker::Worker;
use std::sync::Arc;

pub trait Backends: Send + Sync {
    fn backend_for(&self, worker: &Worker) -> Result<Arc<dyn ContainerBackend>>;
}

/// Every worker is served by the same backend.
#[derive(Clone)]
pub struct SingleBackend {
    backend: Arc<dyn ContainerBackend>,
}

impl SingleBackend {
    pub fn new(backend: Arc<dyn ContainerBackend>) -> Self {
        Self { backend }
    }
}

impl Backends for SingleBackend {
    fn backend_for(&self, _worker: &Worker) -> Result<Arc<dyn ContainerBackend>> {
        Ok(self.backend.clone())
    }
}
