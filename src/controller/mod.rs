//! Controllers tying a primary resource type to its dependents
//!
//! A [`Controller`] owns the store, the dependent resource manager and the
//! user's [`Reconciler`]. It implements [`DispatchHandler`], so a
//! [`Scheduler`] can drive it from any set of event sources.

pub mod dispatcher;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::context::{ReconcileContext, RetryInfo};
use crate::control::{DeleteControl, UpdateControl};
use crate::dependent::DependentResourceManager;
use crate::event::{DispatchHandler, EventSource, Scheduler, SchedulerConfig};
use crate::resource::{default_finalizer_name, PrimaryResource, ResourceId};
use crate::retry::DEFAULT_CONFLICT_ATTEMPTS;
use crate::Error;

pub use dispatcher::{DispatchOutcome, Dispatcher, Persisted};
pub use store::{KubeStore, PrimaryStore};

/// User logic for one primary resource type
///
/// Dependents always run before [`Reconciler::reconcile`] and
/// [`Reconciler::cleanup`], so both see the sub-resources already converged
/// or already deleted.
#[async_trait]
pub trait Reconciler<P: PrimaryResource>: Send + Sync {
    /// Converge the primary resource and say what to persist
    async fn reconcile(&self, primary: &P, ctx: &ReconcileContext)
        -> Result<UpdateControl<P>, Error>;

    /// Final cleanup once every delete-capable dependent is gone
    async fn cleanup(&self, primary: &P, ctx: &ReconcileContext) -> Result<DeleteControl, Error> {
        let _ = (primary, ctx);
        Ok(DeleteControl::DefaultDelete)
    }

    /// Seed the context before any dependent runs
    fn init_context(&self, primary: &P, ctx: &ReconcileContext) {
        let _ = (primary, ctx);
    }
}

/// A controller for primary resources of type `P`
pub struct Controller<P, R, S = KubeStore<P>> {
    name: String,
    finalizer: String,
    conflict_attempts: u32,
    store: Arc<S>,
    manager: Arc<DependentResourceManager<P>>,
    reconciler: Arc<R>,
}

impl<P, R, S> Controller<P, R, S>
where
    P: PrimaryResource,
    R: Reconciler<P> + 'static,
    S: PrimaryStore<P> + 'static,
{
    /// Controller with the default finalizer `<plural>.<group>/finalizer`
    pub fn new(
        name: impl Into<String>,
        reconciler: Arc<R>,
        store: Arc<S>,
        manager: DependentResourceManager<P>,
    ) -> Self {
        Self {
            name: name.into(),
            finalizer: default_finalizer_name::<P>(),
            conflict_attempts: DEFAULT_CONFLICT_ATTEMPTS,
            store,
            manager: Arc::new(manager),
            reconciler,
        }
    }

    /// Use a custom finalizer token
    pub fn with_finalizer(mut self, finalizer: impl Into<String>) -> Self {
        self.finalizer = finalizer.into();
        self
    }

    /// Bound the in-place retries of conflicting finalizer writes
    pub fn with_conflict_attempts(mut self, attempts: u32) -> Self {
        self.conflict_attempts = attempts.max(1);
        self
    }

    /// Controller name used in logs
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Finalizer token this controller manages
    pub fn finalizer(&self) -> &str {
        &self.finalizer
    }

    /// The controller's dependents
    pub fn manager(&self) -> &DependentResourceManager<P> {
        &self.manager
    }

    /// Fetch the latest copy of `id` and run one dispatch on a fresh context
    pub async fn dispatch_once(
        &self,
        id: &ResourceId,
        retry: RetryInfo,
    ) -> Result<DispatchOutcome, Error> {
        let Some(primary) = self.store.get(id).await? else {
            debug!(controller = %self.name, resource = %id, "primary resource gone");
            return Ok(DispatchOutcome::Gone);
        };

        let ctx = ReconcileContext::with_retry(retry);
        Dispatcher::new(
            self.store.as_ref(),
            self.manager.as_ref(),
            self.reconciler.as_ref(),
            &self.finalizer,
            self.conflict_attempts,
        )
        .dispatch(primary, &ctx)
        .await
    }

    /// Drive this controller from `sources` until they all end
    pub async fn run(self, config: SchedulerConfig, sources: Vec<EventSource>) {
        info!(
            controller = %self.name,
            finalizer = %self.finalizer,
            dependents = ?self.manager.dependents(),
            workers = config.workers,
            "starting controller"
        );
        let name = self.name.clone();
        Scheduler::new(config, Arc::new(self)).run(sources).await;
        info!(controller = %name, "controller stopped");
    }
}

#[async_trait]
impl<P, R, S> DispatchHandler for Controller<P, R, S>
where
    P: PrimaryResource,
    R: Reconciler<P> + 'static,
    S: PrimaryStore<P> + 'static,
{
    async fn dispatch(&self, id: &ResourceId, retry: RetryInfo) -> Result<Option<Duration>, Error> {
        match self.dispatch_once(id, retry).await {
            Ok(outcome) => {
                debug!(controller = %self.name, resource = %id, ?outcome, "dispatch complete");
                Ok(outcome.reschedule_after())
            }
            Err(e) => {
                error_policy(&self.name, id, &e, retry);
                Err(e)
            }
        }
    }
}

/// Log a failed dispatch; the scheduler decides whether it is retried
pub fn error_policy(controller: &str, id: &ResourceId, error: &Error, retry: RetryInfo) {
    if error.is_retryable() && !retry.last_attempt {
        warn!(
            controller,
            resource = %id,
            attempt = retry.attempt + 1,
            error = %error,
            "reconciliation failed"
        );
    } else {
        error!(
            controller,
            resource = %id,
            attempt = retry.attempt + 1,
            ?error,
            "reconciliation failed permanently"
        );
    }
}
