//! Repository traits and implementations.

pub mod check;
pub mod container;
pub mod resource;
pub mod worker;

pub use check::{CheckRepo, NewCheck, PgCheckRepo};
pub use container::{ContainerLedger, PgContainerLedger};
pub use resource::{PgResourceRepo, ResourceRepo};
pub use worker::{PgWorkerRegistry, WorkerRegistry};

/// Run against a disposable database: `DATABASE_URL=... cargo test -- --ignored`.
#[cfg(test)]
mod postgres_tests {
    use super::*;
    use beacon_core::check::{CheckMetadata, CheckPlan, CheckStatus, Plan, Source};
    use beacon_core::container::{ContainerMetadata, LedgerEntry};
    use beacon_core::owner::{ContainerOwner, ContainerOwnerExpiries};
    use beacon_core::resource::CheckTarget;
    use beacon_core::worker::{Worker, WorkerState};
    use beacon_core::{BaseResourceTypeId, ResourceConfigId, ResourceId};
    use sqlx::PgPool;
    use std::time::Duration;

    async fn pool() -> PgPool {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let pool = crate::create_pool(&url).await.unwrap();
        crate::run_migrations(&pool).await.unwrap();
        pool
    }

    /// Seed a team, pipeline and resource; returns (pipeline name, resource id).
    async fn seed_resource(pool: &PgPool, with_get: bool) -> (String, uuid::Uuid) {
        let team = uuid::Uuid::now_v7();
        let pipeline = uuid::Uuid::now_v7();
        let resource = uuid::Uuid::now_v7();
        let pipeline_name = format!("p-{}", pipeline);

        sqlx::query("INSERT INTO teams (id, name) VALUES ($1, $2)")
            .bind(team)
            .bind(format!("t-{}", team))
            .execute(pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO pipelines (id, team_id, name) VALUES ($1, $2, $3)")
            .bind(pipeline)
            .bind(team)
            .bind(&pipeline_name)
            .execute(pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO resources (id, pipeline_id, name, type) VALUES ($1, $2, 'repo', 'git')")
            .bind(resource)
            .bind(pipeline)
            .execute(pool)
            .await
            .unwrap();

        let job = uuid::Uuid::now_v7();
        sqlx::query("INSERT INTO jobs (id, pipeline_id, name) VALUES ($1, $2, 'build')")
            .bind(job)
            .bind(pipeline)
            .execute(pool)
            .await
            .unwrap();
        let table = if with_get { "job_inputs" } else { "job_outputs" };
        sqlx::query(&format!("INSERT INTO {table} (job_id, resource_id) VALUES ($1, $2)"))
            .bind(job)
            .bind(resource)
            .execute(pool)
            .await
            .unwrap();

        (pipeline_name, resource)
    }

    #[tokio::test]
    #[ignore]
    async fn test_pg_check_dedup_and_round_trip() {
        let pool = pool().await;
        let (pipeline, resource) = seed_resource(&pool, true).await;
        let resources = PgResourceRepo::new(pool.clone());
        let checks = PgCheckRepo::new(pool.clone());

        let scope = resources
            .set_resource_config(
                CheckTarget::Resource(ResourceId::from_uuid(resource)),
                "git",
                &Source::new(),
                &[],
            )
            .await
            .unwrap();

        let plan = Plan::for_check(CheckPlan {
            name: "repo".to_string(),
            type_: "git".to_string(),
            timeout: "10s".to_string(),
            tags: vec!["linux".to_string()],
            ..Default::default()
        });
        let new = NewCheck {
            scope_id: scope.id,
            manually_triggered: false,
            plan: plan.clone(),
            metadata: CheckMetadata::default(),
        };

        let results = futures::future::join_all((0..8).map(|_| checks.create_check(new.clone()))).await;
        let created: Vec<_> = results.into_iter().filter_map(|r| r.unwrap()).collect();
        assert_eq!(created.len(), 1);

        let reloaded = checks.get_check(created[0].id).await.unwrap().unwrap();
        assert_eq!(reloaded.plan, plan);

        let minute = Duration::from_secs(60);
        let lapsed = checks.claim_started_check("dead", Duration::ZERO).await.unwrap();
        assert!(lapsed.is_some());
        let claimed = checks.claim_started_check("test", minute).await.unwrap().unwrap();
        assert_eq!(claimed.id, created[0].id);
        assert!(checks.claim_started_check("other", minute).await.unwrap().is_none());
        assert!(checks.renew_claim(claimed.id, "test", minute).await.unwrap());
        assert!(!checks.renew_claim(claimed.id, "dead", minute).await.unwrap());

        checks
            .finish_check(created[0].id, CheckStatus::Succeeded, None)
            .await
            .unwrap();
        let r = resources.find_resource(&pipeline, "repo").await.unwrap().unwrap();
        assert!(r.last_check_end_time.is_some());
        assert_eq!(r.scope_id, Some(scope.id));
    }

    #[tokio::test]
    #[ignore]
    async fn test_pg_put_only_resources_are_not_listed() {
        let pool = pool().await;
        let (_, resource) = seed_resource(&pool, false).await;
        let resources = PgResourceRepo::new(pool);

        let listed = resources.resources().await.unwrap();
        assert!(listed.iter().all(|r| *r.id.as_uuid() != resource));
    }

    #[tokio::test]
    #[ignore]
    async fn test_pg_one_live_container_per_owner() {
        let pool = pool().await;
        let workers = PgWorkerRegistry::new(pool.clone());
        let ledger = PgContainerLedger::new(pool.clone());

        let name = format!("w-{}", uuid::Uuid::now_v7());
        workers
            .save_worker(&Worker {
                name: name.clone(),
                addr: None,
                team_id: None,
                tags: vec![],
                resource_types: vec![],
                state: WorkerState::Running,
                active_containers: 0,
                heartbeat_at: None,
            })
            .await
            .unwrap();

        let owner = ContainerOwner::check_session(
            ResourceConfigId::new(),
            BaseResourceTypeId::new(),
            ContainerOwnerExpiries::default(),
        );
        let metadata = ContainerMetadata::default();
        let entries = futures::future::join_all(
            (0..8).map(|_| ledger.create(&name, &owner, &metadata)),
        )
        .await;

        let handles: std::collections::HashSet<_> = entries
            .into_iter()
            .map(|e| e.unwrap().handle().map(str::to_string))
            .collect();
        assert_eq!(handles.len(), 1);

        let handle = handles.into_iter().next().flatten().unwrap();
        ledger.created(&handle).await.unwrap();
        assert!(matches!(
            ledger.find(&name, &owner).await.unwrap(),
            LedgerEntry::Created(_)
        ));
        assert_eq!(
            workers.get_worker(&name).await.unwrap().unwrap().active_containers,
            1
        );
    }
}
