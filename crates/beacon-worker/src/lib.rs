//! Worker placement and container execution for beacon.
//!
//! - Placement strategies and the worker pool
//! - Container find-or-create against the ownership ledger
//! - Container backends: Kubernetes pods and local Docker
//! - Running the resource check protocol inside a container

pub mod backends;
pub mod client;
pub mod container;
pub mod docker;
pub mod image;
pub mod kubernetes;
pub mod placement;
pub mod pool;
pub mod resource;
pub mod retry;

#[cfg(test)]
pub(crate) mod testing;

pub use backends::{Backends, SingleBackend};
pub use client::{CheckStepRequest, CheckStepResult, WorkerClient};
pub use container::ContainerReconciler;
pub use docker::DockerBackend;
pub use kubernetes::KubernetesBackend;
pub use placement::{
    ContainerPlacementStrategy, FewestActiveContainers, FirstPlacement, RandomPlacement,
};
pub use pool::Pool;
