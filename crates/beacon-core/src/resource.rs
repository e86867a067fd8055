//! Resources, resource types and resource config scopes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::check::{Source, Version, VersionedResourceType};
use crate::id::{
    BaseResourceTypeId, PipelineId, ResourceConfigId, ResourceId, ResourceTypeId, ScopeId, TeamId,
};
use crate::{Error, Result};

/// The versioned identity of "this source, polled by this base type".
/// Shared by every resource whose evaluated configuration is identical.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConfigScope {
    pub id: ScopeId,
    pub resource_config_id: ResourceConfigId,
    pub base_resource_type_id: BaseResourceTypeId,
}

/// A pipeline resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub name: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub source: Source,
    pub tags: Vec<String>,
    pub check_timeout: Option<String>,
    pub check_every: Option<String>,
    pub active: bool,
    pub pipeline_id: PipelineId,
    pub pipeline_name: String,
    pub team_id: TeamId,
    pub team_name: String,
    pub scope_id: Option<ScopeId>,
    pub last_check_end_time: Option<DateTime<Utc>>,
}

/// A custom resource type declared by a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceType {
    pub id: ResourceTypeId,
    pub name: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub source: Source,
    pub tags: Vec<String>,
    pub check_timeout: Option<String>,
    pub check_every: Option<String>,
    pub active: bool,
    pub pipeline_id: PipelineId,
    pub pipeline_name: String,
    pub team_id: TeamId,
    pub team_name: String,
    pub scope_id: Option<ScopeId>,
    /// Latest version discovered for this type, if any.
    pub version: Option<Version>,
    pub last_check_end_time: Option<DateTime<Utc>>,
}

impl ResourceType {
    pub fn versioned(&self) -> VersionedResourceType {
        VersionedResourceType {
            name: self.name.clone(),
            type_: self.type_.clone(),
            source: self.source.clone(),
            tags: self.tags.clone(),
            version: self.version.clone(),
        }
    }
}

/// Which row a checkable refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CheckTarget {
    Resource(ResourceId),
    ResourceType(ResourceTypeId),
}

/// Something whose versions can be discovered by a check.
pub trait Checkable: Send + Sync {
    fn target(&self) -> CheckTarget;
    fn name(&self) -> &str;
    fn type_name(&self) -> &str;
    fn source(&self) -> &Source;
    fn tags(&self) -> &[String];
    fn check_timeout(&self) -> Option<&str>;
    fn check_every(&self) -> Option<&str>;
    fn pipeline_id(&self) -> PipelineId;
    fn pipeline_name(&self) -> &str;
    fn team_id(&self) -> TeamId;
    fn team_name(&self) -> &str;
    fn last_check_end_time(&self) -> Option<DateTime<Utc>>;
}

macro_rules! impl_checkable {
    ($ty:ty, $target:expr) => {
        impl Checkable for $ty {
            fn target(&self) -> CheckTarget {
                $target(self.id)
            }
            fn name(&self) -> &str {
                &self.name
            }
            fn type_name(&self) -> &str {
                &self.type_
            }
            fn source(&self) -> &Source {
                &self.source
            }
            fn tags(&self) -> &[String] {
                &self.tags
            }
            fn check_timeout(&self) -> Option<&str> {
                self.check_timeout.as_deref()
            }
            fn check_every(&self) -> Option<&str> {
                self.check_every.as_deref()
            }
            fn pipeline_id(&self) -> PipelineId {
                self.pipeline_id
            }
            fn pipeline_name(&self) -> &str {
                &self.pipeline_name
            }
            fn team_id(&self) -> TeamId {
                self.team_id
            }
            fn team_name(&self) -> &str {
                &self.team_name
            }
            fn last_check_end_time(&self) -> Option<DateTime<Utc>> {
                self.last_check_end_time
            }
        }
    };
}

impl_checkable!(Resource, CheckTarget::Resource);
impl_checkable!(ResourceType, CheckTarget::ResourceType);

/// Walk the custom type chain of `checkable` through `types`.
///
/// Returns the chain nearest-parent first. An empty chain means the
/// checkable's type is a base type. Every custom type in the chain must
/// already have a version, otherwise its image cannot be located.
pub fn resolve_type_chain<'a>(
    checkable: &dyn Checkable,
    types: &'a [ResourceType],
) -> Result<Vec<&'a ResourceType>> {
    let mut chain: Vec<&ResourceType> = Vec::new();
    let mut wanted = checkable.type_name();
    let own_id = match checkable.target() {
        CheckTarget::ResourceType(id) => Some(id),
        CheckTarget::Resource(_) => None,
    };

    loop {
        let parent = types.iter().find(|t| {
            t.name == wanted
                && t.pipeline_id == checkable.pipeline_id()
                && Some(t.id) != own_id
                && !chain.iter().any(|seen| seen.id == t.id)
        });

        let Some(parent) = parent else {
            break;
        };

        if parent.version.is_none() {
            return Err(Error::Config(format!(
                "parent type '{}' has no version",
                parent.name
            )));
        }

        chain.push(parent);
        wanted = &parent.type_;
    }

    Ok(chain)
}

/// The base type at the bottom of a chain.
pub fn base_type_name<'a>(checkable: &'a dyn Checkable, chain: &[&'a ResourceType]) -> &'a str {
    chain
        .last()
        .map(|t| t.type_.as_str())
        .unwrap_or_else(|| checkable.type_name())
}
