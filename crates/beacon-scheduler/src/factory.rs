//! Check lifecycle factory.
//!
//! Creates checks either from an explicit plan or from a checkable's live
//! configuration, and exposes the ledger queries the scanner and checker
//! loops poll.

use beacon_config::{evaluate_resource_types, evaluate_source, parse_duration};
use beacon_core::check::{
    Check, CheckMetadata, CheckPlan, CheckStatus, DEFAULT_CHECK_TIMEOUT, Plan, Version,
    VersionedResourceType,
};
use beacon_core::creds::Variables;
use beacon_core::resource::{
    Checkable, Resource, ResourceType, base_type_name, resolve_type_chain,
};
use beacon_core::{CheckId, Result, ResultExt, ScopeId};
use beacon_db::{CheckRepo, NewCheck, ResourceRepo};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub struct CheckFactory {
    checks: Arc<dyn CheckRepo>,
    resources: Arc<dyn ResourceRepo>,
    vars: Arc<dyn Variables>,
}

impl CheckFactory {
    pub fn new(
        checks: Arc<dyn CheckRepo>,
        resources: Arc<dyn ResourceRepo>,
        vars: Arc<dyn Variables>,
    ) -> Self {
        Self {
            checks,
            resources,
            vars,
        }
    }

    /// Start a check for `scope_id` unless one is already in flight there.
    /// `Ok(None)` is the deduplicated case, not a failure.
    pub async fn create_check(
        &self,
        scope_id: ScopeId,
        manually_triggered: bool,
        plan: Plan,
        metadata: CheckMetadata,
    ) -> Result<Option<Check>> {
        let created = self
            .checks
            .create_check(NewCheck {
                scope_id,
                manually_triggered,
                plan,
                metadata,
            })
            .await?;

        match &created {
            Some(check) => info!(check_id = %check.id, scope_id = %scope_id, manually_triggered, "check created"),
            None => debug!(scope_id = %scope_id, "check already in flight"),
        }
        Ok(created)
    }

    /// Derive a plan from `checkable`'s configuration and create a check for it.
    ///
    /// `parent_types` are the pipeline's custom types; any the checkable is
    /// built on must already have a version.
    pub async fn try_create_check(
        &self,
        checkable: &dyn Checkable,
        parent_types: &[ResourceType],
        from_version: Option<Version>,
        manually_triggered: bool,
    ) -> Result<Option<Check>> {
        let chain = resolve_type_chain(checkable, parent_types)?;
        let versioned: Vec<VersionedResourceType> =
            chain.iter().map(|t| t.versioned()).collect();

        let source = evaluate_source(self.vars.as_ref(), checkable.source())
            .await
            .context(format!("evaluate source of {}", checkable.name()))?;
        let evaluated_types = evaluate_resource_types(self.vars.as_ref(), &versioned)
            .await
            .context(format!("evaluate parent types of {}", checkable.name()))?;

        let timeout = checkable.check_timeout().unwrap_or(DEFAULT_CHECK_TIMEOUT);
        parse_duration(timeout).context(format!("check timeout of {}", checkable.name()))?;

        let scope = self
            .resources
            .set_resource_config(
                checkable.target(),
                base_type_name(checkable, &chain),
                &source,
                &evaluated_types,
            )
            .await?;

        let from_version = match from_version {
            Some(version) => Some(version),
            None => self.resources.latest_version(scope.id).await?,
        };

        let plan = Plan::for_check(CheckPlan {
            name: checkable.name().to_string(),
            type_: checkable.type_name().to_string(),
            source: checkable.source().clone(),
            tags: checkable.tags().to_vec(),
            timeout: timeout.to_string(),
            from_version,
            versioned_resource_types: versioned,
        });

        let metadata = CheckMetadata {
            team_id: Some(checkable.team_id()),
            team_name: checkable.team_name().to_string(),
            pipeline_id: Some(checkable.pipeline_id()),
            pipeline_name: checkable.pipeline_name().to_string(),
            resource_config_id: Some(scope.resource_config_id),
            base_resource_type_id: Some(scope.base_resource_type_id),
        };

        self.create_check(scope.id, manually_triggered, plan, metadata)
            .await
    }

    pub async fn check(&self, id: CheckId) -> Result<Option<Check>> {
        Ok(self.checks.get_check(id).await?)
    }

    pub async fn started_checks(&self) -> Result<Vec<Check>> {
        Ok(self.checks.started_checks().await?)
    }

    /// Resources with an independent version stream worth polling.
    pub async fn resources(&self) -> Result<Vec<Resource>> {
        Ok(self.resources.resources().await?)
    }

    pub async fn resource_types(&self) -> Result<Vec<ResourceType>> {
        Ok(self.resources.resource_types().await?)
    }

    pub async fn claim_started_check(
        &self,
        claimer: &str,
        lease: Duration,
    ) -> Result<Option<Check>> {
        Ok(self.checks.claim_started_check(claimer, lease).await?)
    }

    pub async fn renew_claim(&self, id: CheckId, claimer: &str, lease: Duration) -> Result<bool> {
        Ok(self.checks.renew_claim(id, claimer, lease).await?)
    }

    pub async fn finish_check(
        &self,
        id: CheckId,
        status: CheckStatus,
        error: Option<&str>,
    ) -> Result<Check> {
        let check = self.checks.finish_check(id, status, error).await?;
        info!(check_id = %id, status = %status, "check finished");
        Ok(check)
    }
}
