//! In-memory store implementing every repository trait.
//!
//! Enforces the same uniqueness rules as the Postgres schema: one started
//! check per scope, and one live container per owner key on a worker.
//! Used by single-node runs and by tests.

use async_trait::async_trait;
use beacon_core::check::{CHECK_SCHEMA, Check, CheckStatus, Source, Version, VersionedResourceType};
use beacon_core::container::{
    ContainerMetadata, ContainerRecord, ContainerState, CreatedContainer, CreatingContainer,
    LedgerEntry,
};
use beacon_core::owner::ContainerOwner;
use beacon_core::resource::{CheckTarget, Resource, ResourceConfigScope, ResourceType};
use beacon_core::worker::Worker;
use beacon_core::{
    BaseResourceTypeId, CheckId, PipelineId, ResourceConfigId, ResourceId, ScopeId,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::repo::container::new_handle;
use crate::repo::resource::{source_hash, version_md5};
use crate::{
    CheckRepo, ContainerLedger, DbError, DbResult, NewCheck, ResourceRepo, WorkerRegistry,
};

struct Claim {
    claimer: String,
    expires_at: DateTime<Utc>,
}

fn lease_expiry(lease: Duration) -> DbResult<DateTime<Utc>> {
    chrono::Duration::from_std(lease)
        .ok()
        .and_then(|lease| Utc::now().checked_add_signed(lease))
        .ok_or_else(|| DbError::InvalidTransition(format!("claim lease {:?} out of range", lease)))
}

#[derive(Default)]
struct State {
    resources: Vec<Resource>,
    resource_types: Vec<ResourceType>,
    paused: HashSet<PipelineId>,
    gets: HashSet<ResourceId>,
    puts: HashSet<ResourceId>,

    base_types: HashMap<String, BaseResourceTypeId>,
    configs: HashMap<(BaseResourceTypeId, String), ResourceConfigId>,
    scopes: HashMap<ResourceConfigId, ScopeId>,
    versions: HashMap<ScopeId, Vec<(String, Version)>>,

    checks: Vec<Check>,
    claims: HashMap<CheckId, Claim>,

    workers: BTreeMap<String, Worker>,
    containers: Vec<ContainerRecord>,
}

impl State {
    fn latest_version(&self, scope_id: Option<ScopeId>) -> Option<Version> {
        scope_id
            .and_then(|id| self.versions.get(&id))
            .and_then(|versions| versions.last())
            .map(|(_, v)| v.clone())
    }

    fn live_container(&self, worker_name: &str, key: &str) -> Option<&ContainerRecord> {
        let now = Utc::now();
        self.containers.iter().find(|c| {
            c.worker_name == worker_name
                && c.owner_key.as_str() == key
                && c.state.is_live()
                && c.expires_at.is_none_or(|at| at > now)
        })
    }

    fn container_mut(&mut self, handle: &str) -> DbResult<&mut ContainerRecord> {
        self.containers
            .iter_mut()
            .find(|c| c.handle == handle)
            .ok_or_else(|| DbError::NotFound(format!("container {}", handle)))
    }
}

fn entry_for(record: &ContainerRecord) -> DbResult<LedgerEntry> {
    match record.state {
        ContainerState::Creating => Ok(LedgerEntry::Creating(CreatingContainer {
            handle: record.handle.clone(),
            worker_name: record.worker_name.clone(),
            owner_key: record.owner_key.clone(),
        })),
        ContainerState::Created => Ok(LedgerEntry::Created(CreatedContainer {
            handle: record.handle.clone(),
            worker_name: record.worker_name.clone(),
            owner_key: record.owner_key.clone(),
        })),
        other => Err(DbError::Corrupt(format!(
            "container {} is {} but was returned as live",
            record.handle, other
        ))),
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_resource(&self, resource: Resource) {
        self.state.lock().await.resources.push(resource);
    }

    pub async fn add_resource_type(&self, resource_type: ResourceType) {
        self.state.lock().await.resource_types.push(resource_type);
    }

    /// Declare a job reading `gets` and writing `puts`.
    pub async fn add_job(&self, gets: &[ResourceId], puts: &[ResourceId]) {
        let mut state = self.state.lock().await;
        state.gets.extend(gets.iter().copied());
        state.puts.extend(puts.iter().copied());
    }

    pub async fn set_paused(&self, pipeline_id: PipelineId, paused: bool) {
        let mut state = self.state.lock().await;
        if paused {
            state.paused.insert(pipeline_id);
        } else {
            state.paused.remove(&pipeline_id);
        }
    }

    pub async fn set_resource_active(&self, id: ResourceId, active: bool) {
        let mut state = self.state.lock().await;
        if let Some(r) = state.resources.iter_mut().find(|r| r.id == id) {
            r.active = active;
        }
    }

    /// Every check ever created, oldest first.
    pub async fn checks(&self) -> Vec<Check> {
        self.state.lock().await.checks.clone()
    }
}

#[async_trait]
impl CheckRepo for MemoryStore {
    async fn create_check(&self, new: NewCheck) -> DbResult<Option<Check>> {
        let mut state = self.state.lock().await;

        let in_flight = state
            .checks
            .iter()
            .any(|c| c.scope_id == new.scope_id && c.status == CheckStatus::Started);
        if in_flight {
            return Ok(None);
        }

        let check = Check {
            id: CheckId::new(),
            scope_id: new.scope_id,
            status: CheckStatus::Started,
            schema: CHECK_SCHEMA.to_string(),
            plan: new.plan,
            manually_triggered: new.manually_triggered,
            create_time: Utc::now(),
            start_time: None,
            end_time: None,
            check_error: None,
            metadata: new.metadata,
        };
        state.checks.push(check.clone());
        Ok(Some(check))
    }

    async fn get_check(&self, id: CheckId) -> DbResult<Option<Check>> {
        let state = self.state.lock().await;
        Ok(state.checks.iter().find(|c| c.id == id).cloned())
    }

    async fn started_checks(&self) -> DbResult<Vec<Check>> {
        let state = self.state.lock().await;
        Ok(state
            .checks
            .iter()
            .filter(|c| c.status == CheckStatus::Started)
            .cloned()
            .collect())
    }

    async fn claim_started_check(
        &self,
        claimer: &str,
        lease: Duration,
    ) -> DbResult<Option<Check>> {
        let expires_at = lease_expiry(lease)?;
        let mut state = self.state.lock().await;
        let now = Utc::now();

        let mut candidates: Vec<usize> = state
            .checks
            .iter()
            .enumerate()
            .filter(|(_, c)| {
                c.status == CheckStatus::Started
                    && state
                        .claims
                        .get(&c.id)
                        .is_none_or(|claim| claim.expires_at <= now)
            })
            .map(|(i, _)| i)
            .collect();
        candidates.sort_by_key(|&i| {
            let c = &state.checks[i];
            (!c.manually_triggered, c.create_time)
        });

        let Some(&index) = candidates.first() else {
            return Ok(None);
        };

        let check = &mut state.checks[index];
        check.start_time = Some(now);
        let check = check.clone();
        state.claims.insert(
            check.id,
            Claim {
                claimer: claimer.to_string(),
                expires_at,
            },
        );
        Ok(Some(check))
    }

    async fn renew_claim(&self, id: CheckId, claimer: &str, lease: Duration) -> DbResult<bool> {
        let expires_at = lease_expiry(lease)?;
        let mut state = self.state.lock().await;

        let started = state
            .checks
            .iter()
            .any(|c| c.id == id && c.status == CheckStatus::Started);
        match state.claims.get_mut(&id) {
            Some(claim) if started && claim.claimer == claimer => {
                claim.expires_at = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finish_check(
        &self,
        id: CheckId,
        status: CheckStatus,
        error: Option<&str>,
    ) -> DbResult<Check> {
        if !status.is_terminal() {
            return Err(DbError::InvalidTransition(format!(
                "check {} cannot finish as {}",
                id, status
            )));
        }

        let mut state = self.state.lock().await;
        let now = Utc::now();

        let check = state
            .checks
            .iter_mut()
            .find(|c| c.id == id && c.status == CheckStatus::Started)
            .ok_or_else(|| DbError::InvalidTransition(format!("check {} is not started", id)))?;
        check.status = status;
        check.check_error = error.map(str::to_string);
        check.end_time = Some(now);
        let check = check.clone();

        for r in state.resources.iter_mut() {
            if r.scope_id == Some(check.scope_id) {
                r.last_check_end_time = Some(now);
            }
        }
        for t in state.resource_types.iter_mut() {
            if t.scope_id == Some(check.scope_id) {
                t.last_check_end_time = Some(now);
            }
        }

        Ok(check)
    }
}

#[async_trait]
impl ResourceRepo for MemoryStore {
    async fn resources(&self) -> DbResult<Vec<Resource>> {
        let state = self.state.lock().await;
        Ok(state
            .resources
            .iter()
            .filter(|r| r.active && !state.paused.contains(&r.pipeline_id) && state.gets.contains(&r.id))
            .cloned()
            .collect())
    }

    async fn resource_types(&self) -> DbResult<Vec<ResourceType>> {
        let state = self.state.lock().await;
        Ok(state
            .resource_types
            .iter()
            .filter(|t| t.active)
            .map(|t| ResourceType {
                version: state.latest_version(t.scope_id),
                ..t.clone()
            })
            .collect())
    }

    async fn find_resource(&self, pipeline: &str, name: &str) -> DbResult<Option<Resource>> {
        let state = self.state.lock().await;
        Ok(state
            .resources
            .iter()
            .find(|r| r.pipeline_name == pipeline && r.name == name)
            .cloned())
    }

    async fn find_resource_type(
        &self,
        pipeline: &str,
        name: &str,
    ) -> DbResult<Option<ResourceType>> {
        let state = self.state.lock().await;
        Ok(state
            .resource_types
            .iter()
            .find(|t| t.pipeline_name == pipeline && t.name == name)
            .map(|t| ResourceType {
                version: state.latest_version(t.scope_id),
                ..t.clone()
            }))
    }

    async fn set_resource_config(
        &self,
        target: CheckTarget,
        base_type: &str,
        source: &Source,
        resource_types: &[VersionedResourceType],
    ) -> DbResult<ResourceConfigScope> {
        let hash = source_hash(source, resource_types)?;
        let mut state = self.state.lock().await;

        let base_id = *state
            .base_types
            .entry(base_type.to_string())
            .or_insert_with(BaseResourceTypeId::new);
        let config_id = *state
            .configs
            .entry((base_id, hash))
            .or_insert_with(ResourceConfigId::new);
        let scope_id = *state.scopes.entry(config_id).or_insert_with(ScopeId::new);

        let bound = match target {
            CheckTarget::Resource(id) => state
                .resources
                .iter_mut()
                .find(|r| r.id == id)
                .map(|r| r.scope_id = Some(scope_id))
                .is_some(),
            CheckTarget::ResourceType(id) => state
                .resource_types
                .iter_mut()
                .find(|t| t.id == id)
                .map(|t| t.scope_id = Some(scope_id))
                .is_some(),
        };
        if !bound {
            return Err(DbError::NotFound(format!("{:?}", target)));
        }

        Ok(ResourceConfigScope {
            id: scope_id,
            resource_config_id: config_id,
            base_resource_type_id: base_id,
        })
    }

    async fn latest_version(&self, scope_id: ScopeId) -> DbResult<Option<Version>> {
        Ok(self.state.lock().await.latest_version(Some(scope_id)))
    }

    async fn save_versions(&self, scope_id: ScopeId, versions: &[Version]) -> DbResult<()> {
        let mut state = self.state.lock().await;
        let saved = state.versions.entry(scope_id).or_default();
        for version in versions {
            let md5 = version_md5(version)?;
            if !saved.iter().any(|(existing, _)| *existing == md5) {
                saved.push((md5, version.clone()));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerLedger for MemoryStore {
    async fn find(&self, worker_name: &str, owner: &ContainerOwner) -> DbResult<LedgerEntry> {
        let state = self.state.lock().await;
        match state.live_container(worker_name, owner.key().as_str()) {
            Some(record) => entry_for(record),
            None => Ok(LedgerEntry::Absent),
        }
    }

    async fn create(
        &self,
        worker_name: &str,
        owner: &ContainerOwner,
        metadata: &ContainerMetadata,
    ) -> DbResult<LedgerEntry> {
        let key = owner.key();
        let now = Utc::now();
        let mut state = self.state.lock().await;

        for c in state.containers.iter_mut() {
            let expired = c.expires_at.is_some_and(|at| at <= now);
            if c.worker_name == worker_name && c.owner_key == key && c.state.is_live() && expired {
                c.state = ContainerState::Destroying;
            }
        }

        if let Some(existing) = state.live_container(worker_name, key.as_str()) {
            return entry_for(existing);
        }

        let record = ContainerRecord {
            handle: new_handle(),
            worker_name: worker_name.to_string(),
            owner_key: key,
            state: ContainerState::Creating,
            metadata: metadata.clone(),
            expires_at: owner.expires_at(now),
            created_at: now,
        };
        let entry = entry_for(&record)?;
        state.containers.push(record);
        Ok(entry)
    }

    async fn created(&self, handle: &str) -> DbResult<CreatedContainer> {
        let mut state = self.state.lock().await;
        let record = state.container_mut(handle)?;
        if record.state != ContainerState::Creating {
            return Err(DbError::InvalidTransition(format!(
                "container {} is not creating",
                handle
            )));
        }
        record.state = ContainerState::Created;
        Ok(CreatedContainer {
            handle: record.handle.clone(),
            worker_name: record.worker_name.clone(),
            owner_key: record.owner_key.clone(),
        })
    }

    async fn failed(&self, handle: &str) -> DbResult<()> {
        let mut state = self.state.lock().await;
        let record = state.container_mut(handle)?;
        if record.state != ContainerState::Creating {
            return Err(DbError::InvalidTransition(format!(
                "container {} is not creating",
                handle
            )));
        }
        record.state = ContainerState::Failed;
        Ok(())
    }

    async fn destroying(&self, handle: &str) -> DbResult<()> {
        let mut state = self.state.lock().await;
        let record = state.container_mut(handle)?;
        if !record.state.is_live() {
            return Err(DbError::InvalidTransition(format!(
                "container {} is not live",
                handle
            )));
        }
        record.state = ContainerState::Destroying;
        Ok(())
    }

    async fn workers_with_owner(&self, owner: &ContainerOwner) -> DbResult<Vec<String>> {
        let key = owner.key();
        let now = Utc::now();
        let state = self.state.lock().await;
        let mut names: Vec<String> = state
            .containers
            .iter()
            .filter(|c| {
                c.owner_key == key && c.state.is_live() && c.expires_at.is_none_or(|at| at > now)
            })
            .map(|c| c.worker_name.clone())
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn containers(&self, worker_name: &str) -> DbResult<Vec<ContainerRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .containers
            .iter()
            .filter(|c| c.worker_name == worker_name)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl WorkerRegistry for MemoryStore {
    async fn get_worker(&self, name: &str) -> DbResult<Option<Worker>> {
        let state = self.state.lock().await;
        Ok(state.workers.get(name).map(|w| with_load(&state, w)))
    }

    async fn running_workers(&self) -> DbResult<Vec<Worker>> {
        let state = self.state.lock().await;
        Ok(state
            .workers
            .values()
            .filter(|w| w.is_running())
            .map(|w| with_load(&state, w))
            .collect())
    }

    async fn save_worker(&self, worker: &Worker) -> DbResult<()> {
        let mut state = self.state.lock().await;
        let mut worker = worker.clone();
        worker.heartbeat_at = Some(Utc::now());
        state.workers.insert(worker.name.clone(), worker);
        Ok(())
    }
}

fn with_load(state: &State, worker: &Worker) -> Worker {
    let active = state
        .containers
        .iter()
        .filter(|c| c.worker_name == worker.name && c.state.is_live())
        .count();
    Worker {
        active_containers: active as i64,
        ..worker.clone()
    }
}
