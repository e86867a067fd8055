//! Periodic creation of checks for resources and resource types that are due.

use beacon_config::parse_duration;
use beacon_config::system::ScannerConfig;
use beacon_core::resource::{Checkable, ResourceType};
use beacon_core::{Result, ResultExt};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::factory::CheckFactory;

/// `check_every` value that disables periodic checking.
pub const NEVER: &str = "never";

pub struct Scanner {
    factory: Arc<CheckFactory>,
    config: ScannerConfig,
}

impl Scanner {
    pub fn new(factory: Arc<CheckFactory>, config: ScannerConfig) -> Self {
        Self { factory, config }
    }

    /// Scan until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(interval = ?self.config.interval, "Starting scanner");

        loop {
            match self.scan_once().await {
                Ok(0) => {}
                Ok(created) => debug!(created, "scan created checks"),
                Err(e) => warn!(error = %e, "Failed to scan resources"),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }

        info!("Scanner stopped");
    }

    /// Create a check for every due resource type, then every due resource.
    /// Types go first so a parent type's fresh version is visible to its
    /// children on the next pass. Returns how many checks were created.
    pub async fn scan_once(&self) -> Result<usize> {
        let now = Utc::now();
        let types = self.factory.resource_types().await.context("list resource types")?;
        let resources = self.factory.resources().await.context("list resources")?;

        let mut created = 0;
        for checkable in types
            .iter()
            .map(|t| t as &dyn Checkable)
            .chain(resources.iter().map(|r| r as &dyn Checkable))
        {
            if self.scan_one(checkable, &types, now).await {
                created += 1;
            }
        }
        Ok(created)
    }

    async fn scan_one(
        &self,
        checkable: &dyn Checkable,
        types: &[ResourceType],
        now: DateTime<Utc>,
    ) -> bool {
        match is_due(checkable, self.config.default_check_every, now) {
            Ok(true) => {}
            Ok(false) => return false,
            Err(e) => {
                warn!(name = %checkable.name(), error = %e, "Skipping resource");
                return false;
            }
        }

        match self
            .factory
            .try_create_check(checkable, types, None, false)
            .await
        {
            Ok(created) => created.is_some(),
            Err(e) => {
                warn!(
                    pipeline = %checkable.pipeline_name(),
                    name = %checkable.name(),
                    error = %e,
                    "Failed to create check"
                );
                false
            }
        }
    }
}

/// Whether enough time has passed since the last check finished.
pub fn is_due(
    checkable: &dyn Checkable,
    default_every: Duration,
    now: DateTime<Utc>,
) -> Result<bool> {
    let every = match checkable.check_every() {
        Some(NEVER) => return Ok(false),
        Some(every) => parse_duration(every)
            .context(format!("check_every of {}", checkable.name()))?,
        None => default_every,
    };

    let Some(last) = checkable.last_check_end_time() else {
        return Ok(true);
    };
    let Ok(every) = chrono::Duration::from_std(every) else {
        return Ok(false);
    };
    Ok(now >= last + every)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Fixture, resource, resource_type, version};
    use beacon_core::CheckStatus;
    use beacon_db::ResourceRepo;

    fn scanner(f: &Fixture) -> Scanner {
        let factory = CheckFactory::new(f.store.clone(), f.store.clone(), f.vars.clone());
        Scanner::new(Arc::new(factory), ScannerConfig::default())
    }

    #[test]
    fn test_due_rules() {
        let now = Utc::now();
        let minute = Duration::from_secs(60);
        let mut r = resource("repo", "git", Default::default());

        assert!(is_due(&r, minute, now).unwrap());

        r.last_check_end_time = Some(now - chrono::Duration::seconds(30));
        assert!(!is_due(&r, minute, now).unwrap());

        r.last_check_end_time = Some(now - chrono::Duration::seconds(61));
        assert!(is_due(&r, minute, now).unwrap());

        r.check_every = Some("10s".to_string());
        r.last_check_end_time = Some(now - chrono::Duration::seconds(11));
        assert!(is_due(&r, minute, now).unwrap());

        r.check_every = Some("never".to_string());
        assert!(!is_due(&r, minute, now).unwrap());

        r.check_every = Some("often".to_string());
        assert!(is_due(&r, minute, now).is_err());
    }

    #[tokio::test]
    async fn test_scan_creates_one_check_per_due_resource() {
        let f = Fixture::new().await;
        f.add_resource(resource("repo", "git", f.pipeline_id)).await;
        f.add_resource(resource("image", "registry-image", f.pipeline_id))
            .await;
        let scanner = scanner(&f);

        assert_eq!(scanner.scan_once().await.unwrap(), 2);
        // Both scopes already have a check in flight.
        assert_eq!(scanner.scan_once().await.unwrap(), 0);
        assert_eq!(f.store.checks().await.len(), 2);
    }

    #[tokio::test]
    async fn test_recently_checked_resource_is_skipped() {
        let f = Fixture::new().await;
        f.add_resource(resource("repo", "git", f.pipeline_id)).await;
        let scanner = scanner(&f);

        scanner.scan_once().await.unwrap();
        let check = f.store.checks().await.remove(0);
        f.factory
            .finish_check(check.id, CheckStatus::Succeeded, None)
            .await
            .unwrap();

        assert_eq!(scanner.scan_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_one_bad_resource_does_not_stop_the_scan() {
        let f = Fixture::new().await;
        let mut bad = resource("bad", "git", f.pipeline_id);
        bad.check_timeout = Some("not-a-duration".to_string());
        f.add_resource(bad).await;
        f.add_resource(resource("repo", "git", f.pipeline_id)).await;

        assert_eq!(scanner(&f).scan_once().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_types_are_checked_before_their_children() {
        let f = Fixture::new().await;
        let parent = resource_type("custom", "registry-image", f.pipeline_id, None);
        f.store.add_resource_type(parent.clone()).await;
        f.add_resource(resource("thing", "custom", f.pipeline_id)).await;
        let scanner = scanner(&f);

        // The parent has no version yet, so only its own check is created.
        assert_eq!(scanner.scan_once().await.unwrap(), 1);
        let type_check = f.store.checks().await.remove(0);
        assert_eq!(type_check.check_plan().name, "custom");

        f.store
            .save_versions(type_check.scope_id, &[version("sha256:abc")])
            .await
            .unwrap();
        assert_eq!(scanner.scan_once().await.unwrap(), 1);

        let child = f
            .store
            .checks()
            .await
            .into_iter()
            .find(|c| c.check_plan().name == "thing")
            .unwrap();
        assert_eq!(
            child.check_plan().versioned_resource_types[0].version,
            Some(version("sha256:abc"))
        );
    }
}
