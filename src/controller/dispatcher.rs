//! Per-event dispatch state machine
//!
//! Every triggering event runs one [`Dispatcher`] over the latest copy of the
//! primary resource:
//!
//! ```text
//! DeterminingAction ─┬─> FinalizingDelete ─────────────────────> Done
//!                    └─> Reconciling ──> PersistingResult ─────> Done
//! ```
//!
//! The dispatcher never looks at what kind of event woke it up. Stale and
//! duplicate events converge to the same result because dependents compare
//! desired and actual state themselves.

use std::time::Duration;

use kube::Resource;
use tracing::{debug, info, instrument};

use super::store::{with_status_of, PrimaryStore};
use super::Reconciler;
use crate::context::ReconcileContext;
use crate::control::{UpdateControl, UpdateOutcome};
use crate::dependent::DependentResourceManager;
use crate::resource::{self, PrimaryResource, ResourceId};
use crate::retry::retry_on_conflict;
use crate::Error;

/// What was written during the persisting step
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Persisted {
    /// Nothing
    Nothing,
    /// The full resource
    Resource,
    /// The status subresource
    Status,
    /// The full resource, then its status
    ResourceAndStatus,
}

/// How a dispatch ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A create/update pass ran
    Reconciled {
        /// The finalizer was added and persisted before dependents ran
        finalizer_added: bool,
        /// What the user reconciler asked to persist
        persisted: Persisted,
        /// Requested delay before the next pass
        reschedule_after: Option<Duration>,
    },
    /// A delete pass ran
    Finalized {
        /// The finalizer was removed and persisted
        finalizer_removed: bool,
    },
    /// Marked for deletion without our finalizer; nothing to clean up
    Skipped,
    /// The primary resource no longer exists
    Gone,
}

impl DispatchOutcome {
    /// Delay requested by the user reconciler, if any
    pub fn reschedule_after(&self) -> Option<Duration> {
        match self {
            DispatchOutcome::Reconciled {
                reschedule_after, ..
            } => *reschedule_after,
            _ => None,
        }
    }
}

enum State<P> {
    DeterminingAction(P),
    FinalizingDelete(P),
    Reconciling(P),
    PersistingResult {
        control: UpdateControl<P>,
        finalizer_added: bool,
    },
    Done(DispatchOutcome),
}

/// Runs one dispatch for one primary resource
pub struct Dispatcher<'a, P, R: ?Sized, S: ?Sized> {
    store: &'a S,
    manager: &'a DependentResourceManager<P>,
    reconciler: &'a R,
    finalizer: &'a str,
    conflict_attempts: u32,
}

impl<'a, P, R, S> Dispatcher<'a, P, R, S>
where
    P: PrimaryResource,
    R: Reconciler<P> + ?Sized,
    S: PrimaryStore<P> + ?Sized,
{
    /// Dispatcher over the given collaborators
    pub fn new(
        store: &'a S,
        manager: &'a DependentResourceManager<P>,
        reconciler: &'a R,
        finalizer: &'a str,
        conflict_attempts: u32,
    ) -> Self {
        Self {
            store,
            manager,
            reconciler,
            finalizer,
            conflict_attempts,
        }
    }

    /// Drive the state machine to completion for `primary`
    #[instrument(skip_all, fields(resource = %ResourceId::of(&primary)))]
    pub async fn dispatch(
        &self,
        primary: P,
        ctx: &ReconcileContext,
    ) -> Result<DispatchOutcome, Error> {
        let mut state = State::DeterminingAction(primary);
        loop {
            state = match state {
                State::DeterminingAction(primary) => {
                    if resource::is_marked_for_deletion(&primary) {
                        State::FinalizingDelete(primary)
                    } else {
                        State::Reconciling(primary)
                    }
                }
                State::FinalizingDelete(primary) => self.finalize(primary, ctx).await?,
                State::Reconciling(primary) => self.reconcile(primary, ctx).await?,
                State::PersistingResult {
                    control,
                    finalizer_added,
                } => self.persist(control, finalizer_added).await?,
                State::Done(outcome) => return Ok(outcome),
            };
        }
    }

    async fn finalize(&self, primary: P, ctx: &ReconcileContext) -> Result<State<P>, Error> {
        if !resource::has_finalizer(&primary, self.finalizer) {
            debug!("marked for deletion without finalizer, nothing to clean up");
            return Ok(State::Done(DispatchOutcome::Skipped));
        }

        self.reconciler.init_context(&primary, ctx);
        let dependents = self.manager.cleanup(&primary, ctx).await?;
        let user = self.reconciler.cleanup(&primary, ctx).await?;

        if !(dependents.removes_finalizer() && user.removes_finalizer()) {
            info!("cleanup asked to keep the finalizer");
            return Ok(State::Done(DispatchOutcome::Finalized {
                finalizer_removed: false,
            }));
        }

        let finalizer_removed = self.remove_finalizer(primary).await?;
        if finalizer_removed {
            info!(finalizer = self.finalizer, "cleanup complete, finalizer removed");
        }
        Ok(State::Done(DispatchOutcome::Finalized { finalizer_removed }))
    }

    async fn reconcile(&self, primary: P, ctx: &ReconcileContext) -> Result<State<P>, Error> {
        let mut primary = primary;
        let mut finalizer_added = false;

        if self.manager.requires_cleanup() && !resource::has_finalizer(&primary, self.finalizer) {
            match self.add_finalizer(primary).await? {
                Some((latest, _)) if resource::is_marked_for_deletion(&latest) => {
                    debug!("deletion observed while adding the finalizer");
                    return Ok(State::DeterminingAction(latest));
                }
                Some((latest, written)) => {
                    if written {
                        info!(finalizer = self.finalizer, "finalizer added");
                    } else {
                        debug!(finalizer = self.finalizer, "finalizer already present");
                    }
                    primary = latest;
                    finalizer_added = written;
                }
                None => return Ok(State::Done(DispatchOutcome::Gone)),
            }
        }

        self.reconciler.init_context(&primary, ctx);
        self.manager.reconcile(&primary, ctx).await?;
        let control = self.reconciler.reconcile(&primary, ctx).await?;

        Ok(State::PersistingResult {
            control,
            finalizer_added,
        })
    }

    async fn persist(
        &self,
        control: UpdateControl<P>,
        finalizer_added: bool,
    ) -> Result<State<P>, Error> {
        let (outcome, reschedule_after) = control.into_parts();
        let persisted = match outcome {
            UpdateOutcome::NoUpdate => Persisted::Nothing,
            UpdateOutcome::UpdateResource(resource) => {
                if self.replace_resource(&resource).await?.is_none() {
                    return Ok(State::Done(DispatchOutcome::Gone));
                }
                Persisted::Resource
            }
            UpdateOutcome::UpdateStatus(resource) => {
                self.store.patch_status(&resource).await?;
                Persisted::Status
            }
            UpdateOutcome::UpdateResourceAndStatus(resource) => {
                let Some(fresh) = self.replace_resource(&resource).await? else {
                    return Ok(State::Done(DispatchOutcome::Gone));
                };
                let fresh = with_status_of(fresh, &resource)?;
                self.store.patch_status(&fresh).await?;
                Persisted::ResourceAndStatus
            }
        };
        debug!(?persisted, "reconcile pass complete");

        Ok(State::Done(DispatchOutcome::Reconciled {
            finalizer_added,
            persisted,
            reschedule_after,
        }))
    }

    /// Replace the full resource with the user's copy, re-fetching on conflict
    ///
    /// The user's copy is reapplied onto a fresh `resourceVersion` only while
    /// the stored generation still matches the one it was computed from.
    /// Finalizers are taken from the fresh copy so other actors' tokens
    /// survive. Returns `None` if the object disappeared meanwhile.
    async fn replace_resource(&self, desired: &P) -> Result<Option<P>, Error> {
        let id = ResourceId::of(desired);
        let store = self.store;
        let finalizer = self.finalizer;
        let generation = desired.meta().generation;
        let keeps_finalizer = resource::has_finalizer(desired, finalizer);

        let replaced = retry_on_conflict(self.conflict_attempts, "update resource", |attempt| {
            let id = id.clone();
            async move {
                if attempt == 1 {
                    return store.replace_with_lock(desired).await.map(Replaced::Written);
                }
                let Some(fresh) = store.get(&id).await? else {
                    return Ok(Replaced::Gone);
                };
                if fresh.meta().generation != generation
                    || resource::is_marked_for_deletion(&fresh)
                {
                    return Ok(Replaced::Stale);
                }
                let mut rebased = desired.clone();
                rebased.meta_mut().resource_version = fresh.meta().resource_version.clone();
                rebased.meta_mut().finalizers = fresh.meta().finalizers.clone();
                if keeps_finalizer {
                    resource::add_finalizer(&mut rebased, finalizer);
                }
                store.replace_with_lock(&rebased).await.map(Replaced::Written)
            }
        })
        .await?;

        match replaced {
            Replaced::Written(fresh) => Ok(Some(fresh)),
            Replaced::Gone => Ok(None),
            Replaced::Stale => Err(Error::conflict(
                id.to_string(),
                "resource changed since the reconcile pass started",
            )),
        }
    }

    /// Add the finalizer, re-fetching on conflict
    ///
    /// Returns the latest object and whether this call wrote the finalizer,
    /// or `None` if the object disappeared meanwhile.
    async fn add_finalizer(&self, primary: P) -> Result<Option<(P, bool)>, Error> {
        let id = ResourceId::of(&primary);
        let store = self.store;
        let finalizer = self.finalizer;
        let mut seed = Some(primary);

        retry_on_conflict(self.conflict_attempts, "add finalizer", move |_| {
            let seed = seed.take();
            let id = id.clone();
            async move {
                let Some(mut current) = latest(store, seed, &id).await? else {
                    return Ok(None);
                };
                if resource::is_marked_for_deletion(&current)
                    || !resource::add_finalizer(&mut current, finalizer)
                {
                    return Ok(Some((current, false)));
                }
                let written = store.replace_with_lock(&current).await?;
                Ok(Some((written, true)))
            }
        })
        .await
    }

    /// Remove the finalizer, re-fetching on conflict
    ///
    /// Returns false when the object is already gone or another actor already
    /// removed the finalizer.
    async fn remove_finalizer(&self, primary: P) -> Result<bool, Error> {
        let id = ResourceId::of(&primary);
        let store = self.store;
        let finalizer = self.finalizer;
        let mut seed = Some(primary);

        retry_on_conflict(self.conflict_attempts, "remove finalizer", move |_| {
            let seed = seed.take();
            let id = id.clone();
            async move {
                let Some(mut current) = latest(store, seed, &id).await? else {
                    return Ok(false);
                };
                if !resource::remove_finalizer(&mut current, finalizer) {
                    return Ok(false);
                }
                store.replace_with_lock(&current).await?;
                Ok(true)
            }
        })
        .await
    }
}

/// Result of one full-resource write attempt
enum Replaced<P> {
    Written(P),
    Gone,
    Stale,
}

/// The seed object on the first attempt, a fresh copy from the store afterwards
async fn latest<P, S>(store: &S, seed: Option<P>, id: &ResourceId) -> Result<Option<P>, Error>
where
    P: PrimaryResource,
    S: PrimaryStore<P> + ?Sized,
{
    match seed {
        Some(primary) => Ok(Some(primary)),
        None => store.get(id).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::DeleteControl;
    use crate::controller::store::MockPrimaryStore;
    use crate::crd::{ConfigBundle, ConfigBundleStatus};
    use crate::dependent::{Deleter, DependentBuilder, DependentResource, ManagedDependent};
    use async_trait::async_trait;
    use kube::ResourceExt;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;

    const FINALIZER: &str = "configbundles.trellis.dev/finalizer";

    type Journal = Arc<Mutex<Vec<String>>>;

    fn journal() -> Journal {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn bundle(finalizers: &[&str], deleting: bool) -> ConfigBundle {
        let mut metadata = json!({
            "name": "foo",
            "namespace": "default",
            "uid": "uid-foo",
            "resourceVersion": "1",
            "generation": 1
        });
        if !finalizers.is_empty() {
            metadata["finalizers"] = json!(finalizers);
        }
        if deleting {
            metadata["deletionTimestamp"] = json!("2019-08-10T00:00:00Z");
        }
        serde_json::from_value(json!({
            "apiVersion": "trellis.dev/v1alpha1",
            "kind": "ConfigBundle",
            "metadata": metadata,
            "spec": {}
        }))
        .unwrap()
    }

    struct Step {
        name: &'static str,
        journal: Journal,
        fail_delete: bool,
    }

    #[async_trait]
    impl DependentResource<ConfigBundle> for Step {
        fn name(&self) -> &str {
            self.name
        }

        async fn reconcile(
            &self,
            primary: &ConfigBundle,
            _: &ReconcileContext,
        ) -> Result<(), Error> {
            let finalized = resource::has_finalizer(primary, FINALIZER);
            self.journal
                .lock()
                .push(format!("reconcile:{}:{}", self.name, finalized));
            Ok(())
        }
    }

    #[async_trait]
    impl Deleter<ConfigBundle> for Step {
        async fn delete(&self, _: &ConfigBundle, _: &ReconcileContext) -> Result<(), Error> {
            self.journal.lock().push(format!("delete:{}", self.name));
            if self.fail_delete {
                return Err(Error::internal("delete refused"));
            }
            Ok(())
        }
    }

    /// A, B, C where only B can delete
    fn abc(journal: &Journal, fail_delete: bool) -> DependentResourceManager<ConfigBundle> {
        let step = |name| Step {
            name,
            journal: journal.clone(),
            fail_delete,
        };
        let deps: Vec<ManagedDependent<ConfigBundle>> = vec![
            DependentBuilder::new(step("a")).build(),
            DependentBuilder::new(step("b")).deleter().build(),
            DependentBuilder::new(step("c")).build(),
        ];
        DependentResourceManager::new(deps)
    }

    struct User {
        journal: Journal,
        update: fn(&ConfigBundle) -> UpdateControl<ConfigBundle>,
        delete: DeleteControl,
    }

    impl User {
        fn new(journal: &Journal) -> Self {
            Self {
                journal: journal.clone(),
                update: |_| UpdateControl::no_update(),
                delete: DeleteControl::DefaultDelete,
            }
        }
    }

    #[async_trait]
    impl Reconciler<ConfigBundle> for User {
        async fn reconcile(
            &self,
            primary: &ConfigBundle,
            ctx: &ReconcileContext,
        ) -> Result<UpdateControl<ConfigBundle>, Error> {
            let seeded = ctx.get::<&'static str>().map(|s| *s).unwrap_or("missing");
            self.journal.lock().push(format!("user:reconcile:{seeded}"));
            Ok((self.update)(primary))
        }

        async fn cleanup(
            &self,
            _: &ConfigBundle,
            _: &ReconcileContext,
        ) -> Result<DeleteControl, Error> {
            self.journal.lock().push("user:cleanup".to_string());
            Ok(self.delete)
        }

        fn init_context(&self, _: &ConfigBundle, ctx: &ReconcileContext) {
            self.journal.lock().push("init".to_string());
            ctx.insert("seeded");
        }
    }

    fn recording_replace(
        store: &mut MockPrimaryStore<ConfigBundle>,
        journal: &Journal,
        times: usize,
    ) {
        let j = journal.clone();
        store
            .expect_replace_with_lock()
            .times(times)
            .returning(move |p| {
                let finalized = resource::has_finalizer(p, FINALIZER);
                j.lock().push(format!("persist:resource:{finalized}"));
                Ok(p.clone())
            });
    }

    async fn run(
        store: &MockPrimaryStore<ConfigBundle>,
        manager: &DependentResourceManager<ConfigBundle>,
        user: &User,
        primary: ConfigBundle,
    ) -> Result<DispatchOutcome, Error> {
        Dispatcher::new(store, manager, user, FINALIZER, 3)
            .dispatch(primary, &ReconcileContext::new())
            .await
    }

    // ===== Reconcile Path =====

    /// Story: a fresh resource gets the finalizer before anything else runs
    ///
    /// Only B can delete, but that is enough to need a finalizer. It is
    /// persisted once, and the dependents see the persisted copy carrying it.
    #[tokio::test]
    async fn story_new_resource_gets_finalizer_then_ordered_reconcile() {
        let journal = journal();
        let manager = abc(&journal, false);
        assert!(manager.requires_cleanup());

        let mut store = MockPrimaryStore::new();
        recording_replace(&mut store, &journal, 1);
        store.expect_patch_status().never();
        store.expect_get().never();

        let outcome = run(&store, &manager, &User::new(&journal), bundle(&[], false))
            .await
            .unwrap();

        assert_eq!(
            *journal.lock(),
            vec![
                "persist:resource:true",
                "init",
                "reconcile:a:true",
                "reconcile:b:true",
                "reconcile:c:true",
                "user:reconcile:seeded",
            ]
        );
        assert_eq!(
            outcome,
            DispatchOutcome::Reconciled {
                finalizer_added: true,
                persisted: Persisted::Nothing,
                reschedule_after: None,
            }
        );
    }

    #[tokio::test]
    async fn test_existing_finalizer_is_not_persisted_again() {
        let journal = journal();
        let manager = abc(&journal, false);
        let mut store = MockPrimaryStore::new();
        store.expect_replace_with_lock().never();
        store.expect_patch_status().never();

        let outcome = run(&store, &manager, &User::new(&journal), bundle(&[FINALIZER], false))
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            DispatchOutcome::Reconciled {
                finalizer_added: false,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_no_deleters_means_no_finalizer() {
        let journal = journal();
        let manager = DependentResourceManager::new(vec![DependentBuilder::new(Step {
            name: "a",
            journal: journal.clone(),
            fail_delete: false,
        })
        .build()]);
        let mut store = MockPrimaryStore::new();
        store.expect_replace_with_lock().never();

        run(&store, &manager, &User::new(&journal), bundle(&[], false))
            .await
            .unwrap();

        assert_eq!(
            *journal.lock(),
            vec!["init", "reconcile:a:false", "user:reconcile:seeded"]
        );
    }

    /// Story: a status-only outcome never touches the full resource
    #[tokio::test]
    async fn story_status_update_uses_only_status_subresource() {
        let journal = journal();
        let manager = abc(&journal, false);
        let mut user = User::new(&journal);
        user.update = |p| {
            let mut p = p.clone();
            p.status = Some(ConfigBundleStatus::default());
            UpdateControl::update_status(p)
        };

        let mut store = MockPrimaryStore::new();
        store.expect_replace_with_lock().never();
        store
            .expect_patch_status()
            .times(1)
            .returning(|p: &ConfigBundle| Ok(p.clone()));

        let outcome = run(&store, &manager, &user, bundle(&[FINALIZER], false))
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            DispatchOutcome::Reconciled {
                persisted: Persisted::Status,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_resource_and_status_writes_both_in_order() {
        let journal = journal();
        let manager = DependentResourceManager::new(Vec::new());
        let mut user = User::new(&journal);
        user.update = |p| {
            let mut p = p.clone();
            p.status = Some(ConfigBundleStatus {
                entries: 4,
                ..Default::default()
            });
            UpdateControl::update_resource_and_status(p)
                .reschedule_after(Duration::from_secs(60))
        };

        let mut store = MockPrimaryStore::new();
        let mut seq = mockall::Sequence::new();
        store
            .expect_replace_with_lock()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|p: &ConfigBundle| {
                let mut fresh = p.clone();
                fresh.status = None;
                fresh.metadata.resource_version = Some("2".to_string());
                Ok(fresh)
            });
        store
            .expect_patch_status()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|p| {
                p.metadata.resource_version.as_deref() == Some("2")
                    && p.status.as_ref().map(|s| s.entries) == Some(4)
            })
            .returning(|p| Ok(p.clone()));

        let outcome = run(&store, &manager, &user, bundle(&[], false)).await.unwrap();
        assert_eq!(outcome.reschedule_after(), Some(Duration::from_secs(60)));
    }

    /// Story: a finalizer write that races another writer is retried on a fresh copy
    #[tokio::test]
    async fn story_finalizer_add_retries_on_conflict() {
        let journal = journal();
        let manager = abc(&journal, false);
        let mut store = MockPrimaryStore::new();
        let mut seq = mockall::Sequence::new();
        store
            .expect_replace_with_lock()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(Error::conflict("default/foo", "stale")));
        store
            .expect_get()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                let mut fresh = bundle(&["someone.else/finalizer"], false);
                fresh.metadata.resource_version = Some("5".to_string());
                Ok(Some(fresh))
            });
        store
            .expect_replace_with_lock()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|p| {
                p.metadata.resource_version.as_deref() == Some("5")
                    && resource::has_finalizer(p, FINALIZER)
                    && resource::has_finalizer(p, "someone.else/finalizer")
            })
            .returning(|p| Ok(p.clone()));

        let outcome = run(&store, &manager, &User::new(&journal), bundle(&[], false))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            DispatchOutcome::Reconciled {
                finalizer_added: true,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_finalizer_conflicts_exhaust_and_surface() {
        let journal = journal();
        let manager = abc(&journal, false);
        let mut store = MockPrimaryStore::new();
        store
            .expect_replace_with_lock()
            .times(3)
            .returning(|_| Err(Error::conflict("default/foo", "stale")));
        store
            .expect_get()
            .times(2)
            .returning(|_| Ok(Some(bundle(&[], false))));

        let err = run(&store, &manager, &User::new(&journal), bundle(&[], false))
            .await
            .unwrap_err();

        assert!(err.is_conflict());
        assert!(err.is_retryable());
        assert!(journal.lock().is_empty(), "no dependent may run without the finalizer");
    }

    #[tokio::test]
    async fn test_resource_deleted_while_adding_finalizer_is_gone() {
        let journal = journal();
        let manager = abc(&journal, false);
        let mut store = MockPrimaryStore::new();
        store
            .expect_replace_with_lock()
            .times(1)
            .returning(|_| Err(Error::conflict("default/foo", "stale")));
        store.expect_get().times(1).returning(|_| Ok(None));

        let outcome = run(&store, &manager, &User::new(&journal), bundle(&[], false))
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Gone);
    }

    fn labelled(p: &ConfigBundle) -> UpdateControl<ConfigBundle> {
        let mut p = p.clone();
        p.metadata.labels = Some([("tier".to_string(), "gold".to_string())].into());
        UpdateControl::update_resource(p)
    }

    /// Story: a full-resource update that races another writer is reapplied
    ///
    /// The stored generation is unchanged, so the user's edit still holds and
    /// is written onto the fresh resourceVersion, keeping the other actor's
    /// finalizer.
    #[tokio::test]
    async fn story_update_resource_conflict_is_reapplied_on_fresh_copy() {
        let journal = journal();
        let manager = DependentResourceManager::new(Vec::new());
        let mut user = User::new(&journal);
        user.update = labelled;

        let mut store = MockPrimaryStore::new();
        let mut seq = mockall::Sequence::new();
        store
            .expect_replace_with_lock()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(Error::conflict("default/foo", "stale")));
        store
            .expect_get()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                let mut fresh = bundle(&["someone.else/finalizer"], false);
                fresh.metadata.resource_version = Some("7".to_string());
                Ok(Some(fresh))
            });
        store
            .expect_replace_with_lock()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|p| {
                p.metadata.resource_version.as_deref() == Some("7")
                    && p.labels().get("tier").map(String::as_str) == Some("gold")
                    && resource::has_finalizer(p, "someone.else/finalizer")
            })
            .returning(|p| Ok(p.clone()));

        let outcome = run(&store, &manager, &user, bundle(&[], false)).await.unwrap();
        assert!(matches!(
            outcome,
            DispatchOutcome::Reconciled {
                persisted: Persisted::Resource,
                ..
            }
        ));
    }

    /// Story: a full-resource update is not reapplied over a newer generation
    #[tokio::test]
    async fn story_update_resource_conflict_on_new_generation_surfaces() {
        let journal = journal();
        let manager = DependentResourceManager::new(Vec::new());
        let mut user = User::new(&journal);
        user.update = labelled;

        let mut store = MockPrimaryStore::new();
        store
            .expect_replace_with_lock()
            .times(1)
            .returning(|_| Err(Error::conflict("default/foo", "stale")));
        store.expect_get().times(1).returning(|_| {
            let mut fresh = bundle(&[], false);
            fresh.metadata.generation = Some(2);
            fresh.metadata.resource_version = Some("8".to_string());
            Ok(Some(fresh))
        });

        let err = run(&store, &manager, &user, bundle(&[], false)).await.unwrap_err();
        assert!(err.is_conflict());
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_update_resource_conflicts_are_bounded() {
        let journal = journal();
        let manager = DependentResourceManager::new(Vec::new());
        let mut user = User::new(&journal);
        user.update = labelled;

        let mut store = MockPrimaryStore::new();
        store
            .expect_replace_with_lock()
            .times(3)
            .returning(|_| Err(Error::conflict("default/foo", "stale")));
        store
            .expect_get()
            .times(2)
            .returning(|_| Ok(Some(bundle(&[], false))));

        let err = run(&store, &manager, &user, bundle(&[], false)).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_update_resource_on_vanished_primary_is_gone() {
        let journal = journal();
        let manager = DependentResourceManager::new(Vec::new());
        let mut user = User::new(&journal);
        user.update = labelled;

        let mut store = MockPrimaryStore::new();
        store
            .expect_replace_with_lock()
            .times(1)
            .returning(|_| Err(Error::conflict("default/foo", "stale")));
        store.expect_get().times(1).returning(|_| Ok(None));
        store.expect_patch_status().never();

        let outcome = run(&store, &manager, &user, bundle(&[], false)).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Gone);
    }

    /// Story: a finalizer added by another writer meanwhile is not reported as ours
    #[tokio::test]
    async fn story_finalizer_added_concurrently_is_not_counted() {
        let journal = journal();
        let manager = abc(&journal, false);
        let mut store = MockPrimaryStore::new();
        store
            .expect_replace_with_lock()
            .times(1)
            .returning(|_| Err(Error::conflict("default/foo", "stale")));
        store
            .expect_get()
            .times(1)
            .returning(|_| Ok(Some(bundle(&[FINALIZER], false))));

        let outcome = run(&store, &manager, &User::new(&journal), bundle(&[], false))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            DispatchOutcome::Reconciled {
                finalizer_added: false,
                persisted: Persisted::Nothing,
                reschedule_after: None,
            }
        );
        assert_eq!(journal.lock()[1], "reconcile:a:true");
    }

    /// Story: a deletion seen while adding the finalizer switches to cleanup
    ///
    /// The re-fetched copy already carries our finalizer and a deletion
    /// timestamp, so the pass runs the deleters and releases the object
    /// instead of reconciling it.
    #[tokio::test]
    async fn story_deletion_during_finalizer_add_runs_cleanup() {
        let journal = journal();
        let manager = abc(&journal, false);
        let mut store = MockPrimaryStore::new();
        let mut seq = mockall::Sequence::new();
        store
            .expect_replace_with_lock()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(Error::conflict("default/foo", "stale")));
        store
            .expect_get()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Some(bundle(&[FINALIZER], true))));
        store
            .expect_replace_with_lock()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|p| !resource::has_finalizer(p, FINALIZER))
            .returning(|p| Ok(p.clone()));
        store.expect_patch_status().never();

        let outcome = run(&store, &manager, &User::new(&journal), bundle(&[], false))
            .await
            .unwrap();

        assert_eq!(*journal.lock(), vec!["init", "delete:b", "user:cleanup"]);
        assert_eq!(
            outcome,
            DispatchOutcome::Finalized {
                finalizer_removed: true
            }
        );
    }

    // ===== Delete Path =====

    /// Story: deleting a resource runs only the deleters, then drops the finalizer
    #[tokio::test]
    async fn story_delete_runs_deleters_then_removes_finalizer_once() {
        let journal = journal();
        let manager = abc(&journal, false);
        let mut store = MockPrimaryStore::new();
        store
            .expect_replace_with_lock()
            .times(1)
            .withf(|p: &ConfigBundle| !resource::has_finalizer(p, FINALIZER))
            .returning(|p| Ok(p.clone()));
        store.expect_patch_status().never();
        store.expect_get().never();

        let outcome = run(&store, &manager, &User::new(&journal), bundle(&[FINALIZER], true))
            .await
            .unwrap();

        assert_eq!(*journal.lock(), vec!["init", "delete:b", "user:cleanup"]);
        assert_eq!(
            outcome,
            DispatchOutcome::Finalized {
                finalizer_removed: true
            }
        );
    }

    /// Story: a failing deleter keeps the finalizer so cleanup reruns later
    #[tokio::test]
    async fn story_failed_delete_keeps_finalizer() {
        let journal = journal();
        let manager = abc(&journal, true);
        let mut store = MockPrimaryStore::new();
        store.expect_replace_with_lock().never();
        store.expect_patch_status().never();

        let err = run(&store, &manager, &User::new(&journal), bundle(&[FINALIZER], true))
            .await
            .unwrap_err();

        assert_eq!(err.dependent_name(), Some("b"));
        assert!(err.is_retryable());
        assert_eq!(*journal.lock(), vec!["init", "delete:b"]);
    }

    #[tokio::test]
    async fn test_no_finalizer_removal_does_not_persist() {
        let journal = journal();
        let manager = abc(&journal, false);
        let mut user = User::new(&journal);
        user.delete = DeleteControl::NoFinalizerRemoval;
        let mut store = MockPrimaryStore::new();
        store.expect_replace_with_lock().never();

        let primary = bundle(&[FINALIZER], true);
        let outcome = run(&store, &manager, &user, primary).await.unwrap();

        assert_eq!(
            outcome,
            DispatchOutcome::Finalized {
                finalizer_removed: false
            }
        );
    }

    /// Story: a deleted resource that never got our finalizer is left alone
    #[tokio::test]
    async fn story_delete_without_finalizer_is_noop() {
        let journal = journal();
        let manager = abc(&journal, false);
        let mut store = MockPrimaryStore::new();
        store.expect_replace_with_lock().never();
        store.expect_patch_status().never();
        store.expect_get().never();

        let outcome = run(&store, &manager, &User::new(&journal), bundle(&[], true))
            .await
            .unwrap();

        assert_eq!(outcome, DispatchOutcome::Skipped);
        assert!(journal.lock().is_empty());
    }

    #[tokio::test]
    async fn test_finalizer_already_removed_by_another_actor() {
        let journal = journal();
        let manager = abc(&journal, false);
        let mut store = MockPrimaryStore::new();
        let mut seq = mockall::Sequence::new();
        store
            .expect_replace_with_lock()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(Error::conflict("default/foo", "stale")));
        store
            .expect_get()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Some(bundle(&[], true))));

        let outcome = run(&store, &manager, &User::new(&journal), bundle(&[FINALIZER], true))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            DispatchOutcome::Finalized {
                finalizer_removed: false
            }
        );
    }
}
