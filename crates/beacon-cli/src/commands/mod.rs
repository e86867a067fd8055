//! CLI command implementations and shared wiring.

pub mod run;
pub mod trigger;

use anyhow::{Context, Result, anyhow};
use beacon_config::system::{BackendConfig, PlacementKind, WorkerConfig};
use beacon_config::{SystemConfig, parse_system_config};
use beacon_core::backend::ContainerBackend;
use beacon_core::creds::StaticVariables;
use beacon_core::worker::{Worker, WorkerResourceType, WorkerState};
use beacon_db::{
    PgCheckRepo, PgContainerLedger, PgResourceRepo, PgWorkerRegistry, WorkerRegistry,
    create_pool, run_migrations,
};
use beacon_scheduler::CheckFactory;
use beacon_worker::{
    ContainerPlacementStrategy, DockerBackend, FewestActiveContainers, FirstPlacement,
    KubernetesBackend, RandomPlacement,
};
use std::sync::Arc;
use tracing::info;

/// Read the system configuration. A missing file means defaults.
pub fn load_config(path: &str, database_url: Option<String>) -> Result<SystemConfig> {
    let mut config = match std::fs::read_to_string(path) {
        Ok(content) => parse_system_config(&content)
            .with_context(|| format!("Failed to parse config file: {}", path))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => SystemConfig::default(),
        Err(e) => return Err(e).with_context(|| format!("Failed to read config file: {}", path)),
    };
    if database_url.is_some() {
        config.database_url = database_url;
    }
    Ok(config)
}

pub fn parse_version_field(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{}'", s))
}

/// Postgres-backed repositories sharing one pool.
pub struct Stores {
    pub checks: Arc<PgCheckRepo>,
    pub resources: Arc<PgResourceRepo>,
    pub containers: Arc<PgContainerLedger>,
    pub workers: Arc<PgWorkerRegistry>,
}

pub async fn connect(config: &SystemConfig) -> Result<Stores> {
    let url = config
        .database_url
        .as_deref()
        .ok_or_else(|| anyhow!("no database configured; set DATABASE_URL or `database url=...`"))?;
    let pool = create_pool(url).await.context("Failed to connect to database")?;

    Ok(Stores {
        checks: Arc::new(PgCheckRepo::new(pool.clone())),
        resources: Arc::new(PgResourceRepo::new(pool.clone())),
        containers: Arc::new(PgContainerLedger::new(pool.clone())),
        workers: Arc::new(PgWorkerRegistry::new(pool)),
    })
}

pub fn variables(config: &SystemConfig) -> StaticVariables {
    let mut vars = StaticVariables::new();
    for (name, value) in &config.credentials.vars {
        vars.insert(name.clone(), value.clone());
    }
    vars.merged(StaticVariables::from_env(&config.credentials.env_prefix))
}

pub fn factory(config: &SystemConfig, stores: &Stores) -> CheckFactory {
    CheckFactory::new(
        stores.checks.clone(),
        stores.resources.clone(),
        Arc::new(variables(config)),
    )
}

pub fn strategy(kind: PlacementKind) -> Arc<dyn ContainerPlacementStrategy> {
    match kind {
        PlacementKind::FewestActiveContainers => Arc::new(FewestActiveContainers),
        PlacementKind::Random => Arc::new(RandomPlacement),
        PlacementKind::First => Arc::new(FirstPlacement),
    }
}

pub async fn backend(config: &BackendConfig) -> Result<Arc<dyn ContainerBackend>> {
    Ok(match config {
        BackendConfig::Docker { host } => Arc::new(
            DockerBackend::connect(host.as_deref()).context("Failed to connect to Docker")?,
        ),
        BackendConfig::Kubernetes {
            namespace,
            fetcher_image,
        } => Arc::new(
            KubernetesBackend::connect(namespace.clone(), fetcher_image.clone())
                .await
                .context("Failed to connect to Kubernetes")?,
        ),
    })
}

fn worker_from_config(config: &WorkerConfig) -> Worker {
    Worker {
        name: config.name.clone(),
        addr: Some(config.addr.clone()),
        team_id: config.team_id,
        tags: config.tags.clone(),
        resource_types: config
            .resource_types
            .iter()
            .map(|rt| WorkerResourceType {
                type_: rt.type_.clone(),
                image: rt.image.clone(),
                version: (!rt.version.is_empty()).then(|| rt.version.clone()),
            })
            .collect(),
        state: WorkerState::Running,
        active_containers: 0,
        heartbeat_at: None,
    }
}

/// Register the statically configured workers.
pub async fn register_workers(config: &SystemConfig, registry: &dyn WorkerRegistry) -> Result<()> {
    for worker in &config.workers {
        registry
            .save_worker(&worker_from_config(worker))
            .await
            .with_context(|| format!("Failed to register worker {}", worker.name))?;
        info!(worker = %worker.name, "Registered worker");
    }
    Ok(())
}

pub async fn migrate(config: &SystemConfig) -> Result<()> {
    let url = config
        .database_url
        .as_deref()
        .ok_or_else(|| anyhow!("no database configured; set DATABASE_URL or `database url=...`"))?;
    let pool = create_pool(url).await.context("Failed to connect to database")?;
    run_migrations(&pool).await.context("Failed to run migrations")?;
    println!("Migrations applied");
    Ok(())
}

pub fn validate(config: &SystemConfig) {
    println!("Configuration is valid");
    match &config.backend {
        BackendConfig::Docker { host } => {
            println!("Backend: docker ({})", host.as_deref().unwrap_or("local socket"))
        }
        BackendConfig::Kubernetes { namespace, .. } => {
            println!("Backend: kubernetes (namespace {})", namespace)
        }
    }
    println!("Placement: {:?}", config.placement);
    println!(
        "Check sessions: {:?} to {:?}",
        config.check_session.min, config.check_session.max
    );
    println!("Workers: {}", config.workers.len());
}
