//! Core domain types and traits for the beacon check scheduler.
//!
//! This crate contains:
//! - Typed identifiers and the error taxonomy
//! - Checks, check plans and versions
//! - Resources, resource types and the custom type chain
//! - Container owners, ledger records and the reconciliation state machine
//! - Worker records and placement eligibility
//! - The container backend adapter trait
//! - The credential resolution trait

pub mod backend;
pub mod check;
pub mod container;
pub mod creds;
pub mod error;
pub mod id;
pub mod owner;
pub mod resource;
pub mod worker;

pub use check::{Check, CheckMetadata, CheckPlan, CheckStatus, Plan, Source, Version};
pub use error::{Error, MultiError, Result, ResultExt};
pub use id::{
    BaseResourceTypeId, BuildId, CheckId, PipelineId, ResourceConfigId, ResourceId,
    ResourceTypeId, ScopeId, TeamId,
};
pub use owner::{ContainerOwner, ContainerOwnerExpiries, OwnerKey};
pub use resource::{Checkable, Resource, ResourceConfigScope, ResourceType};
pub use worker::Worker;
