//! Running a single check.

use beacon_config::{evaluate_resource_types, evaluate_source, parse_duration};
use beacon_core::check::{Check, CheckPlan, DEFAULT_CHECK_TIMEOUT};
use beacon_core::container::{
    BindMount, ContainerMetadata, ContainerSpec, ContainerType, ImageSpec, WorkerSpec,
};
use beacon_core::creds::Variables;
use beacon_core::owner::{ContainerOwner, ContainerOwnerExpiries};
use beacon_core::{Error, Result, ResultExt};
use beacon_db::ResourceRepo;
use beacon_worker::{CheckStepRequest, ContainerPlacementStrategy, WorkerClient};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span};

/// Collaborators shared by every check step.
pub struct StepContext {
    pub client: WorkerClient,
    pub resources: Arc<dyn ResourceRepo>,
    pub vars: Arc<dyn Variables>,
    pub strategy: Arc<dyn ContainerPlacementStrategy>,
    pub expiries: ContainerOwnerExpiries,
}

/// One execution of a claimed check.
pub struct CheckStep {
    check: Check,
    ctx: Arc<StepContext>,
    succeeded: AtomicBool,
}

impl CheckStep {
    pub fn new(check: Check, ctx: Arc<StepContext>) -> Self {
        Self {
            check,
            ctx,
            succeeded: AtomicBool::new(false),
        }
    }

    pub fn check(&self) -> &Check {
        &self.check
    }

    /// Whether the last `run` discovered and saved versions.
    pub fn succeeded(&self) -> bool {
        self.succeeded.load(Ordering::SeqCst)
    }

    /// Evaluate credentials, place and reconcile the session container, run
    /// the check script and save what it found. Any failure aborts the whole
    /// step.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        let plan = self.check.check_plan();
        let span = info_span!(
            "check-step",
            check_id = %self.check.id,
            name = %plan.name,
            type_ = %plan.type_,
        );

        self.execute(plan, cancel)
            .instrument(span)
            .await
            .context("run check step")
    }

    async fn execute(&self, plan: CheckPlan, cancel: &CancellationToken) -> Result<()> {
        let vars = self.ctx.vars.as_ref();
        let source = evaluate_source(vars, &plan.source).await?;
        let resource_types = evaluate_resource_types(vars, &plan.versioned_resource_types).await?;

        let timeout = check_timeout(&plan)?;

        let metadata = &self.check.metadata;
        let (Some(resource_config_id), Some(base_resource_type_id)) =
            (metadata.resource_config_id, metadata.base_resource_type_id)
        else {
            return Err(Error::Internal(format!(
                "check {} is not bound to a resource config",
                self.check.id
            )));
        };
        let owner = ContainerOwner::check_session(
            resource_config_id,
            base_resource_type_id,
            self.ctx.expiries,
        );

        let mut env = BTreeMap::new();
        env.insert("BUILD_TEAM_NAME".to_string(), metadata.team_name.clone());
        env.insert("BUILD_PIPELINE_NAME".to_string(), metadata.pipeline_name.clone());

        let container_spec = ContainerSpec {
            bind_mounts: vec![BindMount::certs()],
            tags: plan.tags.clone(),
            team_id: metadata.team_id,
            env,
            ..ContainerSpec::new(ImageSpec::ResourceType(plan.type_.clone()))
        };

        let worker_spec = WorkerSpec {
            resource_type: Some(plan.type_.clone()),
            tags: plan.tags.clone(),
            team_id: metadata.team_id,
            resource_types,
        };

        let container_metadata = ContainerMetadata {
            type_: ContainerType::Check,
            step_name: plan.name.clone(),
            pipeline_id: metadata.pipeline_id,
            pipeline_name: metadata.pipeline_name.clone(),
            team_id: metadata.team_id,
            team_name: metadata.team_name.clone(),
        };

        let request = CheckStepRequest {
            owner,
            metadata: container_metadata,
            container_spec,
            worker_spec,
            source,
            from_version: plan.from_version.clone(),
            timeout,
        };

        let result = self
            .ctx
            .client
            .run_check_step(request, self.ctx.strategy.as_ref(), cancel)
            .await?;

        self.ctx
            .resources
            .save_versions(self.check.scope_id, &result.versions)
            .await?;

        info!(
            worker = %result.worker,
            handle = %result.handle,
            versions = result.versions.len(),
            "check step succeeded"
        );
        self.succeeded.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// How long a check running `plan` may take.
pub fn check_timeout(plan: &CheckPlan) -> Result<Duration> {
    let timeout = if plan.timeout.is_empty() {
        DEFAULT_CHECK_TIMEOUT
    } else {
        plan.timeout.as_str()
    };
    Ok(parse_duration(timeout)?)
}
