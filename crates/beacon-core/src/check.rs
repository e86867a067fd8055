//! Checks and check plans.
//!
//! A check is one attempt at polling a resource's source for new versions.
//! At most one check per resource config scope may be `started` at a time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::id::{BaseResourceTypeId, CheckId, PipelineId, ResourceConfigId, ScopeId, TeamId};
use crate::{Error, Result};

/// Schema tag written alongside every persisted plan.
pub const CHECK_SCHEMA: &str = "exec.v2";

/// Timeout used when a resource does not configure one.
pub const DEFAULT_CHECK_TIMEOUT: &str = "1m";

/// A resource source: arbitrary JSON, possibly containing `((var))` references.
pub type Source = serde_json::Map<String, serde_json::Value>;

/// A single version emitted by a check.
pub type Version = BTreeMap<String, String>;

/// Status of a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Started,
    Succeeded,
    Errored,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Started => "started",
            CheckStatus::Succeeded => "succeeded",
            CheckStatus::Errored => "errored",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, CheckStatus::Started)
    }
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "started" => Ok(CheckStatus::Started),
            "succeeded" => Ok(CheckStatus::Succeeded),
            "errored" => Ok(CheckStatus::Errored),
            other => Err(Error::Internal(format!("unknown check status: {}", other))),
        }
    }
}

/// A custom resource type together with the version its image should be pinned to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedResourceType {
    pub name: String,
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default)]
    pub source: Source,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub version: Option<Version>,
}

/// Everything needed to run one check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckPlan {
    pub name: String,
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default)]
    pub source: Source,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub timeout: String,
    #[serde(default)]
    pub from_version: Option<Version>,
    #[serde(default)]
    pub versioned_resource_types: Vec<VersionedResourceType>,
}

/// A persisted execution plan. Only the check step is modelled here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check: Option<CheckPlan>,
}

impl Plan {
    pub fn for_check(check: CheckPlan) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            check: Some(check),
        }
    }
}

/// Denormalized reporting data copied onto the check row.
///
/// Rows written without metadata load with every field at its zero value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckMetadata {
    pub team_id: Option<TeamId>,
    pub team_name: String,
    pub pipeline_id: Option<PipelineId>,
    pub pipeline_name: String,
    pub resource_config_id: Option<ResourceConfigId>,
    pub base_resource_type_id: Option<BaseResourceTypeId>,
}

/// A check record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Check {
    pub id: CheckId,
    pub scope_id: ScopeId,
    pub status: CheckStatus,
    pub schema: String,
    pub plan: Plan,
    pub manually_triggered: bool,
    pub create_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub check_error: Option<String>,
    pub metadata: CheckMetadata,
}

impl Check {
    /// The check plan, or an empty one if the row was persisted without it.
    pub fn check_plan(&self) -> CheckPlan {
        self.plan.check.clone().unwrap_or_default()
    }
}
