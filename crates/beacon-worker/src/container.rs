//! Find-or-create for owned containers.
//!
//! The ledger is consulted before the backend and written before anything
//! physical is built, so a crash at any point leaves a record that a later
//! call (or garbage collection) can reconcile.

use beacon_core::backend::{
    BackendContainer, BackendError, ContainerBackend, ContainerDefinition, InputFetch,
};
use beacon_core::check::VersionedResourceType;
use beacon_core::container::{
    ContainerMetadata, ContainerSpec, LedgerEntry, Observed, Reconcile, reconcile,
};
use beacon_core::owner::ContainerOwner;
use beacon_core::worker::Worker;
use beacon_core::{Error, MultiError, Result};
use beacon_db::ContainerLedger;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backends::Backends;
use crate::image::resolve_image;
use crate::retry::{RETRY_INTERVAL, with_retry};

/// How long a caller that lost the create race waits for the winner to
/// record the container before adopting it.
pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(300);

pub const HANDLE_LABEL: &str = "beacon.handle";
pub const OWNER_LABEL: &str = "beacon.owner";
pub const WORKER_LABEL: &str = "beacon.worker";
pub const STEP_LABEL: &str = "beacon.step";

pub struct ContainerReconciler {
    ledger: Arc<dyn ContainerLedger>,
    backends: Arc<dyn Backends>,
    retry_interval: Duration,
    settle_timeout: Duration,
}

impl ContainerReconciler {
    pub fn new(ledger: Arc<dyn ContainerLedger>, backends: Arc<dyn Backends>) -> Self {
        Self {
            ledger,
            backends,
            retry_interval: RETRY_INTERVAL,
            settle_timeout: SETTLE_TIMEOUT,
        }
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_settle_timeout(mut self, timeout: Duration) -> Self {
        self.settle_timeout = timeout;
        self
    }

    /// Return the container `owner` holds on `worker`, building it if needed.
    ///
    /// Concurrent callers for the same owner and worker converge on a single
    /// ledger record and a single physical container.
    #[tracing::instrument(
        name = "find-or-create-container",
        skip_all,
        fields(worker = %worker.name, owner = %owner.key())
    )]
    pub async fn find_or_create(
        &self,
        worker: &Worker,
        owner: &ContainerOwner,
        metadata: &ContainerMetadata,
        spec: &ContainerSpec,
        resource_types: &[VersionedResourceType],
        cancel: &CancellationToken,
    ) -> Result<BackendContainer> {
        let backend = self.backends.backend_for(worker)?;

        let mut entry = self.ledger.find(&worker.name, owner).await?;
        let mut recorded = false;
        if reconcile(&entry, None) == Reconcile::Record {
            entry = self.ledger.create(&worker.name, owner, metadata).await?;
            recorded = true;
        }

        let handle = match entry.handle() {
            Some(handle) => handle.to_string(),
            None => {
                return Err(Error::Internal(format!(
                    "ledger returned no record for owner {} on worker {}",
                    owner.key(),
                    worker.name
                )));
            }
        };

        let found = match self.lookup(backend.as_ref(), &handle, cancel).await {
            Ok(found) => found,
            // Nothing was built under the record this call inserted.
            Err(err) if recorded => return Err(self.fail(&handle, err).await),
            Err(err) => return Err(err),
        };
        let observed = if found.is_some() {
            Observed::Present
        } else {
            Observed::Missing
        };

        match (reconcile(&entry, Some(observed)), found) {
            (Reconcile::Reuse, Some(container)) => {
                debug!(handle = %handle, "reusing container");
                Ok(container)
            }
            (Reconcile::Confirm, Some(container)) => {
                debug!(handle = %handle, "container exists, confirming record");
                self.confirm(&worker.name, owner, &handle).await?;
                Ok(container)
            }
            (Reconcile::Create, _) => {
                let definition =
                    match definition(worker, owner, metadata, &handle, spec, resource_types) {
                        Ok(definition) => definition,
                        Err(err) => return Err(self.fail(&handle, err).await),
                    };
                self.build(backend.as_ref(), &worker.name, owner, &definition, cancel)
                    .await
            }
            (Reconcile::Fault, _) => Err(Error::Consistency(format!(
                "container {} is recorded as created on worker {} but the backend has no such container",
                handle, worker.name
            ))),
            (step, _) => Err(Error::Internal(format!(
                "unexpected reconcile step {:?} for container {}",
                step, handle
            ))),
        }
    }

    async fn lookup(
        &self,
        backend: &dyn ContainerBackend,
        handle: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<BackendContainer>> {
        match with_retry("lookup", self.retry_interval, cancel, || backend.lookup(handle)).await {
            Ok(container) => Ok(Some(container)),
            Err(Error::Backend(err)) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn build(
        &self,
        backend: &dyn ContainerBackend,
        worker_name: &str,
        owner: &ContainerOwner,
        definition: &ContainerDefinition,
        cancel: &CancellationToken,
    ) -> Result<BackendContainer> {
        let handle = definition.handle.as_str();
        info!(handle, image = %definition.image, backend = backend.name(), "creating container");

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = backend.create(definition) => result.map_err(Error::from),
        };

        match result {
            Ok(container) => {
                self.confirm(worker_name, owner, handle).await?;
                Ok(container)
            }
            // Another caller built it under the same handle first.
            Err(Error::Backend(BackendError::AlreadyExists(_))) => {
                self.await_created(worker_name, owner, handle, cancel).await?;
                self.lookup(backend, handle, cancel).await?.ok_or_else(|| {
                    Error::Consistency(format!(
                        "container {} was reported as existing but cannot be found",
                        handle
                    ))
                })
            }
            Err(err) => Err(self.fail(handle, err).await),
        }
    }

    /// Wait for the caller that built `handle` to record it as created.
    ///
    /// If that caller never does within the settle timeout, the container is
    /// adopted as if it had been found on a `creating` record.
    async fn await_created(
        &self,
        worker_name: &str,
        owner: &ContainerOwner,
        handle: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.settle_timeout;
        loop {
            match self.ledger.find(worker_name, owner).await? {
                LedgerEntry::Created(created) if created.handle == handle => return Ok(()),
                LedgerEntry::Creating(creating) if creating.handle == handle => {}
                _ => {
                    return Err(Error::Backend(BackendError::AlreadyExists(handle.to_string()))
                        .context(format!(
                            "container {} was being built by another caller that did not record it",
                            handle
                        )));
                }
            }

            if tokio::time::Instant::now() >= deadline {
                warn!(handle, "container builder did not confirm in time, adopting");
                return self.confirm(worker_name, owner, handle).await;
            }

            debug!(handle, "waiting for container builder to confirm");
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(self.retry_interval) => {}
            }
        }
    }

    /// Move the record to `created`, tolerating a concurrent caller having
    /// done so already.
    async fn confirm(&self, worker_name: &str, owner: &ContainerOwner, handle: &str) -> Result<()> {
        let err = match self.ledger.created(handle).await {
            Ok(_) => return Ok(()),
            Err(err) => err,
        };

        match self.ledger.find(worker_name, owner).await? {
            LedgerEntry::Created(created) if created.handle == handle => Ok(()),
            _ => Err(Error::from(err).context(format!("mark container {} created", handle))),
        }
    }

    /// Mark the record failed and return `err`, together with any error from
    /// the transition itself.
    async fn fail(&self, handle: &str, err: Error) -> Error {
        warn!(handle, %err, "container creation failed");

        let mut errors = MultiError::new();
        errors.push(err);
        if let Err(mark) = self.ledger.failed(handle).await {
            errors.push(Error::from(mark).context(format!("mark container {} failed", handle)));
        }
        errors
            .into_error()
            .unwrap_or_else(|| Error::Internal(format!("container {} failed", handle)))
    }
}

fn definition(
    worker: &Worker,
    owner: &ContainerOwner,
    metadata: &ContainerMetadata,
    handle: &str,
    spec: &ContainerSpec,
    resource_types: &[VersionedResourceType],
) -> Result<ContainerDefinition> {
    let image = resolve_image(&spec.image, worker, resource_types)?;

    let inputs = spec
        .inputs
        .iter()
        .map(|input| InputFetch {
            name: input_name(&input.dest_path),
            source_uri: input.artifact.stream_out_uri(),
            dest_path: input.dest_path.clone(),
        })
        .collect();

    let mut labels = BTreeMap::new();
    labels.insert(HANDLE_LABEL.to_string(), handle.to_string());
    labels.insert(OWNER_LABEL.to_string(), owner.key().to_string());
    labels.insert(WORKER_LABEL.to_string(), worker.name.clone());
    if !metadata.step_name.is_empty() {
        labels.insert(STEP_LABEL.to_string(), metadata.step_name.clone());
    }

    Ok(ContainerDefinition {
        handle: handle.to_string(),
        image,
        env: spec.env.clone(),
        dir: spec.dir.clone(),
        inputs,
        outputs: spec.outputs.clone(),
        bind_mounts: spec.bind_mounts.clone(),
        labels,
    })
}

fn input_name(dest_path: &str) -> String {
    let trimmed = dest_path.trim_end_matches('/');
    trimmed
        .rsplit('/')
        .next()
        .unwrap_or(trimmed)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::SingleBackend;
    use crate::testing::{FailingLedger, MockBackend, session_owner, worker};
    use beacon_core::container::{ArtifactLocation, ContainerInput, ContainerState, ImageSpec};
    use beacon_db::MemoryStore;

    struct Fixture {
        store: Arc<MemoryStore>,
        backend: Arc<MockBackend>,
        reconciler: ContainerReconciler,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let backend = Arc::new(MockBackend::new());
        let reconciler = ContainerReconciler::new(
            store.clone(),
            Arc::new(SingleBackend::new(backend.clone())),
        )
        .with_retry_interval(Duration::from_millis(1));
        Fixture {
            store,
            backend,
            reconciler,
        }
    }

    fn git_spec() -> ContainerSpec {
        ContainerSpec::new(ImageSpec::ResourceType("git".to_string()))
    }

    impl Fixture {
        async fn find_or_create(&self, owner: &ContainerOwner) -> Result<BackendContainer> {
            self.reconciler
                .find_or_create(
                    &worker("w1"),
                    owner,
                    &ContainerMetadata::default(),
                    &git_spec(),
                    &[],
                    &CancellationToken::new(),
                )
                .await
        }

        async fn state_of(&self, handle: &str) -> ContainerState {
            self.store
                .containers("w1")
                .await
                .unwrap()
                .into_iter()
                .find(|c| c.handle == handle)
                .unwrap()
                .state
        }
    }

    #[tokio::test]
    async fn test_creates_then_reuses() {
        let f = fixture();
        let owner = session_owner();

        let first = f.find_or_create(&owner).await.unwrap();
        assert_eq!(f.state_of(&first.handle).await, ContainerState::Created);
        assert_eq!(f.backend.create_calls(), 1);

        let second = f.find_or_create(&owner).await.unwrap();
        assert_eq!(second.handle, first.handle);
        assert_eq!(f.backend.create_calls(), 1);
    }

    #[tokio::test]
    async fn test_creating_record_with_existing_container_is_confirmed() {
        let f = fixture();
        let owner = session_owner();

        let entry = f
            .store
            .create("w1", &owner, &ContainerMetadata::default())
            .await
            .unwrap();
        let handle = entry.handle().unwrap().to_string();
        f.backend.insert(&handle);

        let container = f.find_or_create(&owner).await.unwrap();
        assert_eq!(container.handle, handle);
        assert_eq!(f.state_of(&handle).await, ContainerState::Created);
        assert_eq!(f.backend.create_calls(), 0);
    }

    #[tokio::test]
    async fn test_created_record_without_container_is_a_fault() {
        let f = fixture();
        let owner = session_owner();

        let container = f.find_or_create(&owner).await.unwrap();
        f.backend.remove(&container.handle);

        let err = f.find_or_create(&owner).await.unwrap_err();
        assert!(err.is_consistency_fault());
        assert_eq!(f.backend.create_calls(), 1);
    }

    #[tokio::test]
    async fn test_backend_failure_marks_record_failed() {
        let f = fixture();
        let owner = session_owner();
        f.backend
            .fail_next_create(BackendError::Client("image not found".to_string()));

        let err = f.find_or_create(&owner).await.unwrap_err();
        assert!(err.to_string().contains("image not found"));

        let records = f.store.containers("w1").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].state, ContainerState::Failed);
        assert!(matches!(
            f.store.find("w1", &owner).await.unwrap(),
            LedgerEntry::Absent
        ));

        // The failed record no longer claims the owner.
        let container = f.find_or_create(&owner).await.unwrap();
        assert_ne!(container.handle, records[0].handle);
    }

    #[tokio::test]
    async fn test_unresolvable_image_marks_record_failed() {
        let f = fixture();
        let owner = session_owner();

        let err = f
            .reconciler
            .find_or_create(
                &worker("w1"),
                &owner,
                &ContainerMetadata::default(),
                &ContainerSpec::new(ImageSpec::ResourceType("s3".to_string())),
                &[],
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Config(_)));
        let records = f.store.containers("w1").await.unwrap();
        assert_eq!(records[0].state, ContainerState::Failed);
        assert_eq!(f.backend.create_calls(), 0);
    }

    #[tokio::test]
    async fn test_transient_lookup_failures_are_retried() {
        let f = fixture();
        f.backend.fail_lookups(2);

        let container = f.find_or_create(&session_owner()).await.unwrap();
        assert_eq!(f.state_of(&container.handle).await, ContainerState::Created);
    }

    #[tokio::test]
    async fn test_cancelled_create_marks_record_failed() {
        let f = fixture();
        f.backend.set_create_delay(Duration::from_secs(30));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = f
            .reconciler
            .find_or_create(
                &worker("w1"),
                &session_owner(),
                &ContainerMetadata::default(),
                &git_spec(),
                &[],
                &cancel,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Cancelled));
        let records = f.store.containers("w1").await.unwrap();
        assert_eq!(records[0].state, ContainerState::Failed);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_container() {
        let f = Arc::new(fixture());
        let owner = session_owner();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let f = f.clone();
                let owner = owner.clone();
                tokio::spawn(async move { f.find_or_create(&owner).await })
            })
            .collect();

        let mut handles = std::collections::HashSet::new();
        for task in tasks {
            handles.insert(task.await.unwrap().unwrap().handle);
        }

        assert_eq!(handles.len(), 1);
        assert_eq!(f.backend.container_count(), 1);
        let handle = handles.into_iter().next().unwrap();
        assert_eq!(f.state_of(&handle).await, ContainerState::Created);
    }

    #[tokio::test]
    async fn test_definition_carries_inputs_and_labels() {
        let mut spec = git_spec();
        spec.inputs.push(ContainerInput {
            artifact: ArtifactLocation {
                worker_addr: "10.0.0.4:7788".to_string(),
                volume_handle: "vol-1".to_string(),
            },
            dest_path: "/tmp/build/inputs/repo/".to_string(),
        });
        let metadata = ContainerMetadata {
            step_name: "repo".to_string(),
            ..Default::default()
        };
        let owner = session_owner();

        let def = definition(&worker("w1"), &owner, &metadata, "h-1", &spec, &[]).unwrap();
        assert_eq!(def.inputs[0].name, "repo");
        assert_eq!(
            def.inputs[0].source_uri,
            "http://10.0.0.4:7788/volumes/vol-1/stream-out"
        );
        assert_eq!(def.labels[HANDLE_LABEL], "h-1");
        assert_eq!(def.labels[OWNER_LABEL], owner.key().to_string());
        assert_eq!(def.labels[STEP_LABEL], "repo");
    }

    fn cancel_after(delay: Duration) -> CancellationToken {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            trigger.cancel();
        });
        cancel
    }

    #[tokio::test]
    async fn test_failed_lookup_releases_the_record_it_inserted() {
        let f = fixture();
        let owner = session_owner();
        f.backend.fail_lookups(usize::MAX);

        let err = f
            .reconciler
            .find_or_create(
                &worker("w1"),
                &owner,
                &ContainerMetadata::default(),
                &git_spec(),
                &[],
                &cancel_after(Duration::from_millis(20)),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Cancelled));
        let records = f.store.containers("w1").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].state, ContainerState::Failed);
        assert!(matches!(
            f.store.find("w1", &owner).await.unwrap(),
            LedgerEntry::Absent
        ));
        assert_eq!(f.backend.create_calls(), 0);
    }

    #[tokio::test]
    async fn test_failed_lookup_leaves_another_callers_record_alone() {
        let f = fixture();
        let owner = session_owner();
        let entry = f
            .store
            .create("w1", &owner, &ContainerMetadata::default())
            .await
            .unwrap();
        let handle = entry.handle().unwrap().to_string();
        f.backend.fail_lookups(usize::MAX);

        let err = f
            .reconciler
            .find_or_create(
                &worker("w1"),
                &owner,
                &ContainerMetadata::default(),
                &git_spec(),
                &[],
                &cancel_after(Duration::from_millis(20)),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Cancelled));
        assert_eq!(f.state_of(&handle).await, ContainerState::Creating);
    }

    fn failing_fixture() -> (Arc<FailingLedger>, Arc<MockBackend>, ContainerReconciler) {
        let ledger = Arc::new(FailingLedger::new(Arc::new(MemoryStore::new())));
        let backend = Arc::new(MockBackend::new());
        let reconciler = ContainerReconciler::new(
            ledger.clone(),
            Arc::new(SingleBackend::new(backend.clone())),
        )
        .with_retry_interval(Duration::from_millis(1));
        (ledger, backend, reconciler)
    }

    #[tokio::test]
    async fn test_create_and_mark_failed_errors_are_both_returned() {
        let (ledger, backend, reconciler) = failing_fixture();
        backend.fail_next_create(BackendError::Client("image not found".to_string()));
        ledger.fail_failed();

        let err = reconciler
            .find_or_create(
                &worker("w1"),
                &session_owner(),
                &ContainerMetadata::default(),
                &git_spec(),
                &[],
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        let Error::Multiple(multi) = &err else {
            panic!("expected both errors, got {:?}", err);
        };
        let errors = multi.errors();
        assert_eq!(errors.len(), 2);
        assert!(matches!(
            &errors[0],
            Error::Backend(BackendError::Client(msg)) if msg == "image not found"
        ));
        assert!(matches!(errors[1].root(), Error::Persistence(_)));
        assert!(errors[1].to_string().starts_with("mark container"));

        let records = ledger.store.containers("w1").await.unwrap();
        assert_eq!(records[0].state, ContainerState::Creating);
    }

    #[tokio::test]
    async fn test_unrecorded_creation_is_an_error() {
        let (ledger, backend, reconciler) = failing_fixture();
        ledger.fail_created();

        let err = reconciler
            .find_or_create(
                &worker("w1"),
                &session_owner(),
                &ContainerMetadata::default(),
                &git_spec(),
                &[],
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(err.to_string().starts_with("mark container"));
        assert!(matches!(err.root(), Error::Persistence(_)));
        assert_eq!(backend.container_count(), 1);
        let records = ledger.store.containers("w1").await.unwrap();
        assert_eq!(records[0].state, ContainerState::Creating);
    }

    /// A `creating` record whose container appeared between lookup and create.
    async fn raced_record(f: &Fixture, owner: &ContainerOwner) -> ContainerDefinition {
        let entry = f
            .store
            .create("w1", owner, &ContainerMetadata::default())
            .await
            .unwrap();
        let handle = entry.handle().unwrap().to_string();
        f.backend.insert(&handle);
        definition(
            &worker("w1"),
            owner,
            &ContainerMetadata::default(),
            &handle,
            &git_spec(),
            &[],
        )
        .unwrap()
    }

    fn spawn_build(
        f: &Arc<Fixture>,
        owner: &ContainerOwner,
        def: ContainerDefinition,
    ) -> tokio::task::JoinHandle<Result<BackendContainer>> {
        let f = f.clone();
        let owner = owner.clone();
        tokio::spawn(async move {
            f.reconciler
                .build(
                    f.backend.as_ref(),
                    "w1",
                    &owner,
                    &def,
                    &CancellationToken::new(),
                )
                .await
        })
    }

    #[tokio::test]
    async fn test_losing_creator_waits_for_the_winner_to_confirm() {
        let f = Arc::new(fixture());
        let owner = session_owner();
        let def = raced_record(&f, &owner).await;
        let handle = def.handle.clone();

        let task = spawn_build(&f, &owner, def);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());
        assert_eq!(f.state_of(&handle).await, ContainerState::Creating);

        f.store.created(&handle).await.unwrap();
        let container = task.await.unwrap().unwrap();
        assert_eq!(container.handle, handle);
        assert_eq!(f.state_of(&handle).await, ContainerState::Created);
    }

    #[tokio::test]
    async fn test_losing_creator_reports_the_winners_failure() {
        let f = Arc::new(fixture());
        let owner = session_owner();
        let def = raced_record(&f, &owner).await;
        let handle = def.handle.clone();

        let task = spawn_build(&f, &owner, def);
        tokio::time::sleep(Duration::from_millis(20)).await;
        f.store.failed(&handle).await.unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(
            err.root(),
            Error::Backend(BackendError::AlreadyExists(_))
        ));
        assert_eq!(f.state_of(&handle).await, ContainerState::Failed);
    }

    #[tokio::test]
    async fn test_unconfirmed_container_is_adopted_after_settling() {
        let f = fixture();
        let reconciler = ContainerReconciler::new(
            f.store.clone(),
            Arc::new(SingleBackend::new(f.backend.clone())),
        )
        .with_retry_interval(Duration::from_millis(1))
        .with_settle_timeout(Duration::from_millis(10));
        let owner = session_owner();
        let def = raced_record(&f, &owner).await;

        let container = reconciler
            .build(
                f.backend.as_ref(),
                "w1",
                &owner,
                &def,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(container.handle, def.handle);
        assert_eq!(f.state_of(&def.handle).await, ContainerState::Created);
    }
}
