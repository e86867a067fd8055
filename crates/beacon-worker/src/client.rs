//! Running a check on the worker fleet.

use beacon_core::backend::BackendContainer;
use beacon_core::check::{Source, Version};
use beacon_core::container::{ContainerMetadata, ContainerSpec, WorkerSpec};
use beacon_core::owner::ContainerOwner;
use beacon_core::worker::Worker;
use beacon_core::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::backends::Backends;
use crate::container::ContainerReconciler;
use crate::placement::ContainerPlacementStrategy;
use crate::pool::Pool;
use crate::resource::{check_input, check_output, check_process};

/// One check run: where it may go, what it runs in, and what it checks.
#[derive(Debug, Clone)]
pub struct CheckStepRequest {
    pub owner: ContainerOwner,
    pub metadata: ContainerMetadata,
    pub container_spec: ContainerSpec,
    pub worker_spec: WorkerSpec,
    /// Evaluated source handed to the check script.
    pub source: Source,
    pub from_version: Option<Version>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckStepResult {
    pub worker: String,
    pub handle: String,
    pub versions: Vec<Version>,
}

pub struct WorkerClient {
    pool: Pool,
    reconciler: ContainerReconciler,
    backends: Arc<dyn Backends>,
}

impl WorkerClient {
    pub fn new(pool: Pool, reconciler: ContainerReconciler, backends: Arc<dyn Backends>) -> Self {
        Self {
            pool,
            reconciler,
            backends,
        }
    }

    /// Place the owner's container, reconcile it, and run the check script
    /// in it. The timeout bounds the script only.
    pub async fn run_check_step(
        &self,
        request: CheckStepRequest,
        strategy: &dyn ContainerPlacementStrategy,
        cancel: &CancellationToken,
    ) -> Result<CheckStepResult> {
        let worker = self
            .pool
            .find_or_choose_worker(&request.owner, &request.worker_spec, strategy)
            .await?;

        let container = self
            .reconciler
            .find_or_create(
                &worker,
                &request.owner,
                &request.metadata,
                &request.container_spec,
                &request.worker_spec.resource_types,
                cancel,
            )
            .await?;

        let stdin = check_input(&request.source, request.from_version.as_ref())?;
        let versions = self
            .run_check(&worker, &container, stdin, request.timeout, cancel)
            .await?;

        info!(
            worker = %worker.name,
            handle = %container.handle,
            versions = versions.len(),
            "check script finished"
        );

        Ok(CheckStepResult {
            worker: worker.name,
            handle: container.handle,
            versions,
        })
    }

    async fn run_check(
        &self,
        worker: &Worker,
        container: &BackendContainer,
        stdin: Vec<u8>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<Version>> {
        let backend = self.backends.backend_for(worker)?;
        let process = check_process();

        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = tokio::time::timeout(timeout, backend.run(container, &process, stdin)) => {
                match result {
                    Ok(output) => output?,
                    Err(_) => {
                        return Err(Error::Timeout(format!(
                            "check timed out after {}",
                            humanize(timeout)
                        )));
                    }
                }
            }
        };

        check_output(&output)
    }
}

fn humanize(duration: Duration) -> String {
    if duration.subsec_millis() == 0 {
        format!("{}s", duration.as_secs())
    } else {
        format!("{}ms", duration.as_millis())
    }
}
