//! Worker pool: selects the worker a container will live on.

use beacon_core::container::WorkerSpec;
use beacon_core::owner::ContainerOwner;
use beacon_core::worker::Worker;
use beacon_core::{Error, Result};
use beacon_db::{ContainerLedger, WorkerRegistry};
use std::sync::Arc;
use tracing::debug;

use crate::placement::ContainerPlacementStrategy;

pub struct Pool {
    registry: Arc<dyn WorkerRegistry>,
    ledger: Arc<dyn ContainerLedger>,
}

impl Pool {
    pub fn new(registry: Arc<dyn WorkerRegistry>, ledger: Arc<dyn ContainerLedger>) -> Self {
        Self { registry, ledger }
    }

    /// Running workers that satisfy `spec`. A team's own workers take
    /// precedence over global workers when the team has any eligible.
    pub async fn eligible_workers(&self, spec: &WorkerSpec) -> Result<Vec<Worker>> {
        let eligible: Vec<Worker> = self
            .registry
            .running_workers()
            .await?
            .into_iter()
            .filter(|w| w.satisfies(spec))
            .collect();

        if let Some(team) = spec.team_id {
            let (own, global): (Vec<Worker>, Vec<Worker>) = eligible
                .into_iter()
                .partition(|w| w.team_id == Some(team));
            if !own.is_empty() {
                return Ok(own);
            }
            return Ok(global);
        }

        Ok(eligible)
    }

    /// An eligible worker already holding a live container for `owner`, or
    /// the strategy's pick among all eligible workers.
    pub async fn find_or_choose_worker(
        &self,
        owner: &ContainerOwner,
        spec: &WorkerSpec,
        strategy: &dyn ContainerPlacementStrategy,
    ) -> Result<Worker> {
        let eligible = self.eligible_workers(spec).await?;
        if eligible.is_empty() {
            return Err(Error::NoEligibleWorker(describe(spec)));
        }

        let holders = self.ledger.workers_with_owner(owner).await?;
        if let Some(worker) = eligible.iter().find(|w| holders.contains(&w.name)) {
            debug!(worker = %worker.name, owner = %owner.key(), "reusing worker with live container");
            return Ok(worker.clone());
        }

        let worker = strategy
            .choose(&eligible)
            .cloned()
            .ok_or_else(|| Error::NoEligibleWorker(describe(spec)))?;

        debug!(
            worker = %worker.name,
            strategy = strategy.name(),
            candidates = eligible.len(),
            "worker chosen"
        );
        Ok(worker)
    }
}

fn describe(spec: &WorkerSpec) -> String {
    let mut parts = Vec::new();
    if let Some(rt) = &spec.resource_type {
        parts.push(format!("resource type '{}'", rt));
    }
    if !spec.tags.is_empty() {
        parts.push(format!("tags [{}]", spec.tags.join(", ")));
    }
    if let Some(team) = spec.team_id {
        parts.push(format!("team {}", team));
    }
    if parts.is_empty() {
        "no workers are running".to_string()
    } else {
        format!("no running worker satisfies {}", parts.join(", "))
    }
}
