//! Placement strategies: how one worker is picked among the eligible ones.
//!
//! Eligibility is decided by the pool before a strategy sees the candidates,
//! so strategies only break ties.

use beacon_core::worker::Worker;
use rand::seq::IndexedRandom;

pub trait ContainerPlacementStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Pick one of `candidates`, which are all eligible. `None` only when empty.
    fn choose<'a>(&self, candidates: &'a [Worker]) -> Option<&'a Worker>;
}

/// Prefer the worker with the fewest live containers; ties go to the lowest name.
#[derive(Debug, Default, Clone, Copy)]
pub struct FewestActiveContainers;

impl ContainerPlacementStrategy for FewestActiveContainers {
    fn name(&self) -> &'static str {
        "fewest-active-containers"
    }

    fn choose<'a>(&self, candidates: &'a [Worker]) -> Option<&'a Worker> {
        candidates
            .iter()
            .min_by(|a, b| {
                a.active_containers
                    .cmp(&b.active_containers)
                    .then_with(|| a.name.cmp(&b.name))
            })
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RandomPlacement;

impl ContainerPlacementStrategy for RandomPlacement {
    fn name(&self) -> &'static str {
        "random"
    }

    fn choose<'a>(&self, candidates: &'a [Worker]) -> Option<&'a Worker> {
        candidates.choose(&mut rand::rng())
    }
}

/// Always the first candidate in registry order.
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstPlacement;

impl ContainerPlacementStrategy for FirstPlacement {
    fn name(&self) -> &'static str {
        "first"
    }

    fn choose<'a>(&self, candidates: &'a [Worker]) -> Option<&'a Worker> {
        candidates.first()
    }
}
