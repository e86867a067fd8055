//! Container ledger records, the reconciliation state machine, and the
//! specifications used to place and build containers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::check::VersionedResourceType;
use crate::id::{PipelineId, TeamId};
use crate::owner::OwnerKey;
use crate::{Error, Result};

/// Persisted state of a container record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    /// Intent recorded; the physical object is not confirmed.
    Creating,
    /// The physical object is confirmed to exist.
    Created,
    /// Handed to garbage collection.
    Destroying,
    /// Creation failed; the record is awaiting cleanup.
    Failed,
}

impl ContainerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerState::Creating => "creating",
            ContainerState::Created => "created",
            ContainerState::Destroying => "destroying",
            ContainerState::Failed => "failed",
        }
    }

    /// Whether a record in this state still claims the owner key.
    pub fn is_live(&self) -> bool {
        matches!(self, ContainerState::Creating | ContainerState::Created)
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContainerState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "creating" => Ok(ContainerState::Creating),
            "created" => Ok(ContainerState::Created),
            "destroying" => Ok(ContainerState::Destroying),
            "failed" => Ok(ContainerState::Failed),
            other => Err(Error::Internal(format!("unknown container state: {}", other))),
        }
    }
}

/// A ledger record known to be in `creating`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatingContainer {
    pub handle: String,
    pub worker_name: String,
    pub owner_key: OwnerKey,
}

/// A ledger record known to be in `created`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedContainer {
    pub handle: String,
    pub worker_name: String,
    pub owner_key: OwnerKey,
}

/// What the ledger holds for an owner on a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerEntry {
    Absent,
    Creating(CreatingContainer),
    Created(CreatedContainer),
}

impl LedgerEntry {
    pub fn handle(&self) -> Option<&str> {
        match self {
            LedgerEntry::Absent => None,
            LedgerEntry::Creating(c) => Some(&c.handle),
            LedgerEntry::Created(c) => Some(&c.handle),
        }
    }
}

/// Whether the backend has a physical object for a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observed {
    Present,
    Missing,
}

/// What find-or-create must do next, given the ledger and the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconcile {
    /// No record yet: insert a `creating` record before anything else.
    Record,
    /// Recorded as creating with nothing physical: build the container.
    Create,
    /// Recorded as creating and physically present: confirm the record.
    Confirm,
    /// Recorded as created and physically present.
    Reuse,
    /// Recorded as created but physically missing.
    Fault,
}

/// The reconciliation transition function. Total over every combination.
pub fn reconcile(entry: &LedgerEntry, observed: Option<Observed>) -> Reconcile {
    match (entry, observed) {
        (LedgerEntry::Absent, _) => Reconcile::Record,
        (LedgerEntry::Creating(_), None | Some(Observed::Missing)) => Reconcile::Create,
        (LedgerEntry::Creating(_), Some(Observed::Present)) => Reconcile::Confirm,
        (LedgerEntry::Created(_), Some(Observed::Present)) => Reconcile::Reuse,
        (LedgerEntry::Created(_), None | Some(Observed::Missing)) => Reconcile::Fault,
    }
}

/// What kind of step a container serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerType {
    #[default]
    Check,
    Get,
    Put,
    Task,
}

/// Descriptive data stored on the ledger record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerMetadata {
    #[serde(rename = "type")]
    pub type_: ContainerType,
    pub step_name: String,
    pub pipeline_id: Option<PipelineId>,
    pub pipeline_name: String,
    pub team_id: Option<TeamId>,
    pub team_name: String,
}

/// Where a container's root filesystem comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageSpec {
    /// Use the image backing this (base or custom) resource type.
    ResourceType(String),
    /// Use this image reference verbatim.
    Url(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindMount {
    pub src_path: String,
    pub dst_path: String,
    pub read_only: bool,
}

impl BindMount {
    /// The host's CA certificates, mounted read-only.
    pub fn certs() -> Self {
        Self {
            src_path: "/etc/ssl/certs".to_string(),
            dst_path: "/etc/ssl/certs".to_string(),
            read_only: true,
        }
    }
}

/// Location of an upstream artifact on another worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactLocation {
    pub worker_addr: String,
    pub volume_handle: String,
}

impl ArtifactLocation {
    pub fn stream_out_uri(&self) -> String {
        format!(
            "http://{}/volumes/{}/stream-out",
            self.worker_addr, self.volume_handle
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInput {
    pub artifact: ArtifactLocation,
    pub dest_path: String,
}

/// What to build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub image: ImageSpec,
    pub bind_mounts: Vec<BindMount>,
    pub tags: Vec<String>,
    pub team_id: Option<TeamId>,
    pub env: BTreeMap<String, String>,
    pub dir: Option<String>,
    pub inputs: Vec<ContainerInput>,
    pub outputs: Vec<String>,
}

impl ContainerSpec {
    pub fn new(image: ImageSpec) -> Self {
        Self {
            image,
            bind_mounts: Vec::new(),
            tags: Vec::new(),
            team_id: None,
            env: BTreeMap::new(),
            dir: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }
}

/// Constraints a worker must satisfy to be chosen.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub resource_type: Option<String>,
    pub tags: Vec<String>,
    pub team_id: Option<TeamId>,
    pub resource_types: Vec<VersionedResourceType>,
}

/// A live ledger record as listed for reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub handle: String,
    pub worker_name: String,
    pub owner_key: OwnerKey,
    pub state: ContainerState,
    pub metadata: ContainerMetadata,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}
