//! Claims started checks and runs them.

use beacon_config::system::CheckerConfig;
use beacon_core::check::{Check, CheckStatus};
use beacon_core::{CheckId, Result, ResultExt};
use futures::future::join_all;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::factory::CheckFactory;
use crate::step::{CheckStep, StepContext, check_timeout};

const FINISH_ATTEMPTS: u32 = 3;

pub struct Checker {
    id: String,
    factory: Arc<CheckFactory>,
    ctx: Arc<StepContext>,
    config: CheckerConfig,
}

impl Checker {
    pub fn new(
        id: impl Into<String>,
        factory: Arc<CheckFactory>,
        ctx: Arc<StepContext>,
        config: CheckerConfig,
    ) -> Self {
        Self {
            id: id.into(),
            factory,
            ctx,
            config,
        }
    }

    /// Run the checker loop until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(checker_id = %self.id, concurrency = self.config.concurrency, "Starting checker");

        loop {
            let idle = match self.run_once(&cancel).await {
                Ok(ran) => ran == 0,
                Err(e) => {
                    warn!(error = %e, "Failed to claim checks");
                    true
                }
            };

            if cancel.is_cancelled() {
                break;
            }
            if idle {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.config.interval) => {}
                }
            }
        }

        info!(checker_id = %self.id, "Checker stopped");
    }

    /// Claim up to `concurrency` started checks, run them side by side and
    /// record how each ended. Returns how many ran.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<usize> {
        let mut claimed = Vec::new();
        while claimed.len() < self.config.concurrency.max(1) {
            match self
                .factory
                .claim_started_check(&self.id, self.config.claim_grace)
                .await
                .context("claim check")?
            {
                Some(check) => claimed.push(check),
                None => break,
            }
        }

        let ran = claimed.len();
        join_all(claimed.into_iter().map(|check| self.execute(check, cancel))).await;
        Ok(ran)
    }

    async fn execute(&self, check: Check, cancel: &CancellationToken) {
        let id = check.id;
        let plan = check.check_plan();
        info!(check_id = %id, name = %plan.name, "Claimed check");

        // Hold the claim for as long as the check may run.
        let lease = check_timeout(&plan).unwrap_or_default() + self.config.claim_grace;
        match self.factory.renew_claim(id, &self.id, lease).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(check_id = %id, "Claim lapsed before the check ran");
                return;
            }
            Err(e) => warn!(check_id = %id, error = %e, "Failed to extend check claim"),
        }

        let step = CheckStep::new(check, self.ctx.clone());
        match step.run(cancel).await {
            Ok(()) => self.finish(id, CheckStatus::Succeeded, None).await,
            Err(e) => {
                warn!(check_id = %id, error = %e, "Check errored");
                let message = e.to_string();
                self.finish(id, CheckStatus::Errored, Some(&message)).await
            }
        }
    }

    /// Record how a check ended. If every attempt fails the check stays
    /// started until its claim lapses and another checker picks it up.
    async fn finish(&self, id: CheckId, status: CheckStatus, error: Option<&str>) {
        for attempt in 1..=FINISH_ATTEMPTS {
            match self.factory.finish_check(id, status, error).await {
                Ok(_) => return,
                Err(e) if attempt < FINISH_ATTEMPTS => {
                    warn!(
                        check_id = %id,
                        attempt,
                        error = %e,
                        "Failed to record check result, retrying"
                    );
                    tokio::time::sleep(self.config.interval).await;
                }
                Err(e) => warn!(check_id = %id, error = %e, "Failed to record check result"),
            }
        }
    }
}
