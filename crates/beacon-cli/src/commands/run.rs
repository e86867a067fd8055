//! Long-running scheduler process.

use anyhow::{Context, Result};
use beacon_config::SystemConfig;
use beacon_scheduler::{Checker, Scanner, StepContext};
use beacon_worker::{Backends, ContainerReconciler, Pool, SingleBackend, WorkerClient};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{backend, connect, factory, register_workers, strategy, variables};

/// Run the scanner and checker until ctrl-c.
pub async fn run(config: SystemConfig, instance: &str) -> Result<()> {
    let stores = connect(&config).await?;
    register_workers(&config, stores.workers.as_ref()).await?;

    let backend = backend(&config.backend).await?;
    info!(backend = backend.name(), "Connected to container backend");
    let backends: Arc<dyn Backends> = Arc::new(SingleBackend::new(backend));

    let client = WorkerClient::new(
        Pool::new(stores.workers.clone(), stores.containers.clone()),
        ContainerReconciler::new(stores.containers.clone(), backends.clone()),
        backends,
    );
    let ctx = Arc::new(StepContext {
        client,
        resources: stores.resources.clone(),
        vars: Arc::new(variables(&config)),
        strategy: strategy(config.placement),
        expiries: config.check_session,
    });

    let factory = Arc::new(factory(&config, &stores));
    let scanner = Scanner::new(factory.clone(), config.scanner.clone());
    let checker = Checker::new(instance, factory, ctx, config.checker.clone());

    let cancel = CancellationToken::new();
    let shutdown = {
        let cancel = cancel.clone();
        async move {
            let signal = tokio::signal::ctrl_c().await;
            info!("Shutting down");
            cancel.cancel();
            signal
        }
    };

    let (signal, (), ()) = tokio::join!(
        shutdown,
        scanner.run(cancel.clone()),
        checker.run(cancel.clone()),
    );
    signal.context("Failed to listen for ctrl-c")?;

    Ok(())
}
