//! Container owners: the logical reason a container exists.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::id::{BaseResourceTypeId, BuildId, ResourceConfigId, TeamId};

/// Reuse window of a session container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerOwnerExpiries {
    pub min: Duration,
    pub max: Duration,
}

impl ContainerOwnerExpiries {
    pub const DEFAULT_MIN: Duration = Duration::from_secs(5 * 60);
    pub const DEFAULT_MAX: Duration = Duration::from_secs(60 * 60);

    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    /// Pick an expiry uniformly in `[now + min, now + max)`.
    pub fn expires_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let min = self.min.min(self.max);
        let spread_ms = self.max.saturating_sub(min).as_millis() as u64;
        let jitter = if spread_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::rng().random_range(0..spread_ms))
        };
        let lifetime = chrono::Duration::from_std(min + jitter).unwrap_or(chrono::Duration::MAX);
        now.checked_add_signed(lifetime)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

impl Default for ContainerOwnerExpiries {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MIN, Self::DEFAULT_MAX)
    }
}

/// Stable key joining "what needs compute" to "what compute exists".
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerKey(String);

impl OwnerKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for OwnerKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContainerOwner {
    /// Tied to one build step and destroyed when the step ends.
    BuildStep {
        build_id: BuildId,
        plan_id: String,
        team_id: TeamId,
    },
    /// Reusable across checks of one resource config, within an expiry window.
    CheckSession {
        resource_config_id: ResourceConfigId,
        base_resource_type_id: BaseResourceTypeId,
        expiries: ContainerOwnerExpiries,
    },
}

impl ContainerOwner {
    pub fn check_session(
        resource_config_id: ResourceConfigId,
        base_resource_type_id: BaseResourceTypeId,
        expiries: ContainerOwnerExpiries,
    ) -> Self {
        ContainerOwner::CheckSession {
            resource_config_id,
            base_resource_type_id,
            expiries,
        }
    }

    pub fn build_step(build_id: BuildId, plan_id: impl Into<String>, team_id: TeamId) -> Self {
        ContainerOwner::BuildStep {
            build_id,
            plan_id: plan_id.into(),
            team_id,
        }
    }

    /// The ledger key. Expiries are not part of it.
    pub fn key(&self) -> OwnerKey {
        match self {
            ContainerOwner::BuildStep {
                build_id, plan_id, ..
            } => OwnerKey(format!("build:{}:{}", build_id, plan_id)),
            ContainerOwner::CheckSession {
                resource_config_id,
                base_resource_type_id,
                ..
            } => OwnerKey(format!(
                "check-session:{}:{}",
                resource_config_id, base_resource_type_id
            )),
        }
    }

    pub fn expiries(&self) -> Option<&ContainerOwnerExpiries> {
        match self {
            ContainerOwner::BuildStep { .. } => None,
            ContainerOwner::CheckSession { expiries, .. } => Some(expiries),
        }
    }

    /// When a container created now for this owner stops being reusable.
    pub fn expires_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.expiries().map(|e| e.expires_at(now))
    }

    pub fn team_id(&self) -> Option<TeamId> {
        match self {
            ContainerOwner::BuildStep { team_id, .. } => Some(*team_id),
            ContainerOwner::CheckSession { .. } => None,
        }
    }
}
