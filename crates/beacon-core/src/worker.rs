//! Registered workers and the eligibility rules placement applies to them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::container::WorkerSpec;
use crate::id::TeamId;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Running,
    Stalled,
    Landing,
    Retiring,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Running => "running",
            WorkerState::Stalled => "stalled",
            WorkerState::Landing => "landing",
            WorkerState::Retiring => "retiring",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(WorkerState::Running),
            "stalled" => Ok(WorkerState::Stalled),
            "landing" => Ok(WorkerState::Landing),
            "retiring" => Ok(WorkerState::Retiring),
            other => Err(Error::Internal(format!("unknown worker state: {}", other))),
        }
    }
}

/// A base resource type a worker can run, and the image that implements it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerResourceType {
    #[serde(rename = "type")]
    pub type_: String,
    pub image: String,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worker {
    pub name: String,
    /// Address other workers stream artifacts from.
    pub addr: Option<String>,
    /// Workers owned by a team only run that team's work.
    pub team_id: Option<TeamId>,
    pub tags: Vec<String>,
    pub resource_types: Vec<WorkerResourceType>,
    pub state: WorkerState,
    pub active_containers: i64,
    pub heartbeat_at: Option<DateTime<Utc>>,
}

impl Worker {
    pub fn base_resource_type(&self, name: &str) -> Option<&WorkerResourceType> {
        self.resource_types.iter().find(|rt| rt.type_ == name)
    }

    /// Untagged work only lands on untagged workers; tagged work needs every
    /// requested tag.
    pub fn satisfies_tags(&self, tags: &[String]) -> bool {
        if tags.is_empty() {
            return self.tags.is_empty();
        }
        tags.iter().all(|t| self.tags.contains(t))
    }

    /// Whether the requested type is supported, following custom types down
    /// to the base type they are ultimately built on.
    pub fn supports_resource_type(&self, spec: &WorkerSpec) -> bool {
        let Some(mut wanted) = spec.resource_type.as_deref() else {
            return true;
        };

        let mut visited: Vec<&str> = Vec::new();
        while let Some(custom) = spec
            .resource_types
            .iter()
            .find(|t| t.name == wanted && !visited.contains(&t.name.as_str()))
        {
            visited.push(&custom.name);
            wanted = &custom.type_;
        }

        self.base_resource_type(wanted).is_some()
    }

    /// Team workers accept their own team's work; global workers accept anyone's.
    pub fn satisfies_team(&self, team_id: Option<TeamId>) -> bool {
        match self.team_id {
            None => true,
            Some(owner) => team_id == Some(owner),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == WorkerState::Running
    }

    /// All eligibility rules combined.
    pub fn satisfies(&self, spec: &WorkerSpec) -> bool {
        self.is_running()
            && self.satisfies_team(spec.team_id)
            && self.satisfies_tags(&spec.tags)
            && self.supports_resource_type(spec)
    }
}
