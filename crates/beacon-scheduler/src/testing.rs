//! Shared fixtures for scheduler tests.

use async_trait::async_trait;
use beacon_core::backend::{
    BackendContainer, BackendError, BackendResult, ContainerBackend, ContainerDefinition,
    ProcessOutput, ProcessSpec,
};
use beacon_core::check::{Source, Version};
use beacon_core::creds::StaticVariables;
use beacon_core::owner::ContainerOwnerExpiries;
use beacon_core::resource::{CheckTarget, Resource, ResourceType};
use beacon_core::worker::{Worker, WorkerResourceType, WorkerState};
use beacon_core::{PipelineId, ResourceId, ResourceTypeId, ScopeId, TeamId};
use beacon_db::{MemoryStore, ResourceRepo, WorkerRegistry};
use beacon_worker::{
    Backends, ContainerReconciler, FewestActiveContainers, Pool, SingleBackend, WorkerClient,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::factory::CheckFactory;
use crate::step::StepContext;

pub fn version(v: &str) -> Version {
    Version::from([("ref".to_string(), v.to_string())])
}

pub fn resource(name: &str, type_: &str, pipeline_id: PipelineId) -> Resource {
    Resource {
        id: ResourceId::new(),
        name: name.to_string(),
        type_: type_.to_string(),
        source: Source::new(),
        tags: vec![],
        check_timeout: None,
        check_every: None,
        active: true,
        pipeline_id,
        pipeline_name: "pipeline".to_string(),
        team_id: TeamId::new(),
        team_name: "main".to_string(),
        scope_id: None,
        last_check_end_time: None,
    }
}

pub fn resource_type(
    name: &str,
    type_: &str,
    pipeline_id: PipelineId,
    version: Option<Version>,
) -> ResourceType {
    ResourceType {
        id: ResourceTypeId::new(),
        name: name.to_string(),
        type_: type_.to_string(),
        source: Source::new(),
        tags: vec![],
        check_timeout: None,
        check_every: None,
        active: true,
        pipeline_id,
        pipeline_name: "pipeline".to_string(),
        team_id: TeamId::new(),
        team_name: "main".to_string(),
        scope_id: None,
        version,
        last_check_end_time: None,
    }
}

/// A global worker running `git` and `registry-image`.
pub fn worker(name: &str) -> Worker {
    let base = |type_: &str| WorkerResourceType {
        type_: type_.to_string(),
        image: format!("docker.io/concourse/{}-resource", type_),
        version: None,
    };
    Worker {
        name: name.to_string(),
        addr: Some(format!("{}:7788", name)),
        team_id: None,
        tags: vec![],
        resource_types: vec![base("git"), base("registry-image")],
        state: WorkerState::Running,
        active_containers: 0,
        heartbeat_at: None,
    }
}

pub struct Fixture {
    pub store: Arc<MemoryStore>,
    pub factory: CheckFactory,
    pub backend: Arc<MockBackend>,
    pub vars: Arc<StaticVariables>,
    pub pipeline_id: PipelineId,
}

impl Fixture {
    pub async fn new() -> Self {
        Self::with_vars(
            StaticVariables::new().with("repo-uri", "https://example.com/repo.git"),
        )
        .await
    }

    pub async fn with_vars(vars: StaticVariables) -> Self {
        let store = Arc::new(MemoryStore::new());
        store.save_worker(&worker("w1")).await.unwrap();

        let vars = Arc::new(vars);
        let factory = CheckFactory::new(store.clone(), store.clone(), vars.clone());

        Self {
            store,
            factory,
            backend: Arc::new(MockBackend::default()),
            vars,
            pipeline_id: PipelineId::new(),
        }
    }

    /// Register a resource that some job reads.
    pub async fn add_resource(&self, resource: Resource) -> Resource {
        self.store.add_resource(resource.clone()).await;
        self.store.add_job(&[resource.id], &[]).await;
        resource
    }

    pub async fn bind(&self, resource: &Resource) -> ScopeId {
        self.store
            .set_resource_config(
                CheckTarget::Resource(resource.id),
                &resource.type_,
                &resource.source,
                &[],
            )
            .await
            .unwrap()
            .id
    }

    pub fn step_context(&self) -> Arc<StepContext> {
        let backends: Arc<dyn Backends> = Arc::new(SingleBackend::new(self.backend.clone()));
        let client = WorkerClient::new(
            Pool::new(self.store.clone(), self.store.clone()),
            ContainerReconciler::new(self.store.clone(), backends.clone()),
            backends,
        );
        Arc::new(StepContext {
            client,
            resources: self.store.clone(),
            vars: self.vars.clone(),
            strategy: Arc::new(FewestActiveContainers),
            expiries: ContainerOwnerExpiries::default(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct RunCall {
    pub handle: String,
    pub stdin: Vec<u8>,
}

/// Backend double: containers are handle names, runs return a canned output.
#[derive(Default)]
pub struct MockBackend {
    containers: Mutex<HashSet<String>>,
    create_calls: AtomicUsize,
    run_output: Mutex<Option<ProcessOutput>>,
    runs: Mutex<Vec<RunCall>>,
}

impl MockBackend {
    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn set_run_output(&self, output: ProcessOutput) {
        *self.run_output.lock().unwrap() = Some(output);
    }

    pub fn runs(&self) -> Vec<RunCall> {
        self.runs.lock().unwrap().clone()
    }
}

fn container(handle: &str) -> BackendContainer {
    BackendContainer {
        handle: handle.to_string(),
        backend_id: handle.to_string(),
    }
}

#[async_trait]
impl ContainerBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn lookup(&self, handle: &str) -> BackendResult<BackendContainer> {
        if self.containers.lock().unwrap().contains(handle) {
            Ok(container(handle))
        } else {
            Err(BackendError::NotFound(handle.to_string()))
        }
    }

    async fn create(&self, definition: &ContainerDefinition) -> BackendResult<BackendContainer> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if !self.containers.lock().unwrap().insert(definition.handle.clone()) {
            return Err(BackendError::AlreadyExists(definition.handle.clone()));
        }
        Ok(container(&definition.handle))
    }

    async fn run(
        &self,
        container: &BackendContainer,
        _process: &ProcessSpec,
        stdin: Vec<u8>,
    ) -> BackendResult<ProcessOutput> {
        self.runs.lock().unwrap().push(RunCall {
            handle: container.handle.clone(),
            stdin,
        });
        let output = self.run_output.lock().unwrap().clone();
        Ok(output.unwrap_or(ProcessOutput {
            exit_code: 0,
            stdout: b"[]".to_vec(),
            stderr: vec![],
        }))
    }

    async fn destroy(&self, handle: &str) -> BackendResult<()> {
        self.containers.lock().unwrap().remove(handle);
        Ok(())
    }
}
