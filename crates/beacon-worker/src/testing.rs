//! Test doubles shared by this crate's unit tests.

use async_trait::async_trait;
use beacon_core::backend::{
    BackendContainer, BackendError, BackendResult, ContainerBackend, ContainerDefinition,
    ProcessOutput, ProcessSpec,
};
use beacon_core::container::{
    ContainerMetadata, ContainerRecord, CreatedContainer, LedgerEntry,
};
use beacon_core::owner::{ContainerOwner, ContainerOwnerExpiries};
use beacon_core::worker::{Worker, WorkerResourceType, WorkerState};
use beacon_core::{BaseResourceTypeId, ResourceConfigId};
use beacon_db::{ContainerLedger, DbError, DbResult, MemoryStore};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A running, untagged, global worker that supports `git`.
pub fn worker(name: &str) -> Worker {
    Worker {
        name: name.to_string(),
        addr: Some(format!("{}:7788", name)),
        team_id: None,
        tags: vec![],
        resource_types: vec![WorkerResourceType {
            type_: "git".to_string(),
            image: "docker.io/concourse/git-resource:1.17".to_string(),
            version: None,
        }],
        state: WorkerState::Running,
        active_containers: 0,
        heartbeat_at: None,
    }
}

pub fn session_owner() -> ContainerOwner {
    ContainerOwner::check_session(
        ResourceConfigId::new(),
        BaseResourceTypeId::new(),
        ContainerOwnerExpiries::default(),
    )
}

/// A recorded `run` call.
#[derive(Debug, Clone)]
pub struct RunCall {
    pub handle: String,
    pub process: ProcessSpec,
    pub stdin: Vec<u8>,
}

/// In-memory backend that rejects duplicate handles like a real runtime.
#[derive(Default)]
pub struct MockBackend {
    containers: Mutex<HashMap<String, ContainerDefinition>>,
    create_calls: AtomicUsize,
    lookup_failures: AtomicUsize,
    next_create_error: Mutex<Option<BackendError>>,
    create_delay: Mutex<Option<Duration>>,
    run_output: Mutex<ProcessOutput>,
    run_delay: Mutex<Option<Duration>>,
    runs: Mutex<Vec<RunCall>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn container_count(&self) -> usize {
        self.containers.lock().unwrap().len()
    }

    pub fn definition(&self, handle: &str) -> Option<ContainerDefinition> {
        self.containers.lock().unwrap().get(handle).cloned()
    }

    /// Pretend a container already exists under `handle`.
    pub fn insert(&self, handle: &str) {
        self.containers.lock().unwrap().insert(
            handle.to_string(),
            ContainerDefinition {
                handle: handle.to_string(),
                image: "preexisting".to_string(),
                env: Default::default(),
                dir: None,
                inputs: vec![],
                outputs: vec![],
                bind_mounts: vec![],
                labels: Default::default(),
            },
        );
    }

    /// Make the container vanish behind the ledger's back.
    pub fn remove(&self, handle: &str) {
        self.containers.lock().unwrap().remove(handle);
    }

    /// Fail the next `count` lookups with a transport error.
    pub fn fail_lookups(&self, count: usize) {
        self.lookup_failures.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_create(&self, err: BackendError) {
        *self.next_create_error.lock().unwrap() = Some(err);
    }

    pub fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_run_output(&self, output: ProcessOutput) {
        *self.run_output.lock().unwrap() = output;
    }

    pub fn set_run_delay(&self, delay: Duration) {
        *self.run_delay.lock().unwrap() = Some(delay);
    }

    pub fn runs(&self) -> Vec<RunCall> {
        self.runs.lock().unwrap().clone()
    }
}

fn container(handle: &str) -> BackendContainer {
    BackendContainer {
        handle: handle.to_string(),
        backend_id: format!("mock-{}", handle),
    }
}

#[async_trait]
impl ContainerBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn lookup(&self, handle: &str) -> BackendResult<BackendContainer> {
        tokio::task::yield_now().await;
        let failing = self
            .lookup_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(BackendError::Transport("connection reset".to_string()));
        }

        if self.containers.lock().unwrap().contains_key(handle) {
            Ok(container(handle))
        } else {
            Err(BackendError::NotFound(handle.to_string()))
        }
    }

    async fn create(&self, definition: &ContainerDefinition) -> BackendResult<BackendContainer> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.create_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        tokio::task::yield_now().await;

        if let Some(err) = self.next_create_error.lock().unwrap().take() {
            return Err(err);
        }

        let mut containers = self.containers.lock().unwrap();
        if containers.contains_key(&definition.handle) {
            return Err(BackendError::AlreadyExists(definition.handle.clone()));
        }
        containers.insert(definition.handle.clone(), definition.clone());
        Ok(container(&definition.handle))
    }

    async fn run(
        &self,
        container: &BackendContainer,
        process: &ProcessSpec,
        stdin: Vec<u8>,
    ) -> BackendResult<ProcessOutput> {
        self.runs.lock().unwrap().push(RunCall {
            handle: container.handle.clone(),
            process: process.clone(),
            stdin,
        });
        let delay = *self.run_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.run_output.lock().unwrap().clone())
    }

    async fn destroy(&self, handle: &str) -> BackendResult<()> {
        self.containers.lock().unwrap().remove(handle);
        Ok(())
    }
}

/// Ledger that delegates to a [`MemoryStore`] but can refuse the
/// `created` and `failed` transitions.
pub struct FailingLedger {
    pub store: Arc<MemoryStore>,
    fail_created: AtomicBool,
    fail_failed: AtomicBool,
}

impl FailingLedger {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            fail_created: AtomicBool::new(false),
            fail_failed: AtomicBool::new(false),
        }
    }

    pub fn fail_created(&self) {
        self.fail_created.store(true, Ordering::SeqCst);
    }

    pub fn fail_failed(&self) {
        self.fail_failed.store(true, Ordering::SeqCst);
    }
}

fn unavailable(op: &str, handle: &str) -> DbError {
    DbError::InvalidTransition(format!("{} {}: ledger unavailable", op, handle))
}

#[async_trait]
impl ContainerLedger for FailingLedger {
    async fn find(&self, worker_name: &str, owner: &ContainerOwner) -> DbResult<LedgerEntry> {
        self.store.find(worker_name, owner).await
    }

    async fn create(
        &self,
        worker_name: &str,
        owner: &ContainerOwner,
        metadata: &ContainerMetadata,
    ) -> DbResult<LedgerEntry> {
        self.store.create(worker_name, owner, metadata).await
    }

    async fn created(&self, handle: &str) -> DbResult<CreatedContainer> {
        if self.fail_created.load(Ordering::SeqCst) {
            return Err(unavailable("created", handle));
        }
        self.store.created(handle).await
    }

    async fn failed(&self, handle: &str) -> DbResult<()> {
        if self.fail_failed.load(Ordering::SeqCst) {
            return Err(unavailable("failed", handle));
        }
        self.store.failed(handle).await
    }

    async fn destroying(&self, handle: &str) -> DbResult<()> {
        self.store.destroying(handle).await
    }

    async fn workers_with_owner(&self, owner: &ContainerOwner) -> DbResult<Vec<String>> {
        self.store.workers_with_owner(owner).await
    }

    async fn containers(&self, worker_name: &str) -> DbResult<Vec<ContainerRecord>> {
        self.store.containers(worker_name).await
    }
}
