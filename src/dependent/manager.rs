//! Ordered reconcile and reverse-order cleanup of a controller's dependents

use tracing::{debug, info, warn};

use super::registry::{DependentRegistry, DependentResourceSpec};
use super::ManagedDependent;
use crate::context::ReconcileContext;
use crate::control::DeleteControl;
use crate::event::{EventSource, EventSourceContext};
use crate::Error;

/// Owns the dependents of one controller for its whole lifetime
///
/// Built once at startup. Reconcile visits dependents in declared order and
/// cleanup visits the delete-capable ones in reverse, both stopping at the
/// first failure.
pub struct DependentResourceManager<P> {
    dependents: Vec<ManagedDependent<P>>,
    requires_cleanup: bool,
}

impl<P: Send + Sync + 'static> DependentResourceManager<P> {
    /// Build every dependent in `specs` and initialise their event sources
    ///
    /// Any failure here is a configuration error and should stop the controller.
    pub fn initialize(
        specs: &[DependentResourceSpec],
        registry: &DependentRegistry<P>,
        esctx: &EventSourceContext,
    ) -> Result<(Self, Vec<EventSource>), Error> {
        let dependents = specs
            .iter()
            .map(|spec| registry.resolve(esctx.client(), spec))
            .collect::<Result<Vec<_>, _>>()?;
        Self::initialize_with(dependents, esctx)
    }

    /// Take ownership of already-built dependents and initialise their event sources
    pub fn initialize_with(
        dependents: Vec<ManagedDependent<P>>,
        esctx: &EventSourceContext,
    ) -> Result<(Self, Vec<EventSource>), Error> {
        let mut sources = Vec::new();
        for dependent in &dependents {
            if let Some(provider) = dependent.event_source_provider() {
                let source = provider.init_event_source(esctx).map_err(|e| {
                    Error::configuration(format!(
                        "event source for dependent '{}' failed to initialise: {e}",
                        dependent.name()
                    ))
                })?;
                debug!(
                    controller = esctx.controller(),
                    dependent = dependent.name(),
                    source = source.name(),
                    "registered event source"
                );
                sources.push(source);
            }
        }

        let manager = Self::new(dependents);
        info!(
            controller = esctx.controller(),
            dependents = ?manager.dependents(),
            requires_cleanup = manager.requires_cleanup,
            event_sources = sources.len(),
            "dependent resources initialized"
        );
        Ok((manager, sources))
    }

    /// Manager over `dependents` without event source wiring
    pub fn new(dependents: Vec<ManagedDependent<P>>) -> Self {
        let requires_cleanup = dependents.iter().any(ManagedDependent::is_deleter);
        Self {
            dependents,
            requires_cleanup,
        }
    }

    /// Reconcile every dependent in declared order
    ///
    /// Stops at the first failure, which is reported as [`Error::Dependent`].
    pub async fn reconcile(&self, primary: &P, ctx: &ReconcileContext) -> Result<(), Error> {
        for dependent in &self.dependents {
            debug!(dependent = dependent.name(), "reconciling dependent");
            dependent
                .reconciler()
                .reconcile(primary, ctx)
                .await
                .map_err(|e| fail(dependent, "reconcile", e))?;
        }
        Ok(())
    }

    /// Delete every delete-capable dependent in reverse declared order
    ///
    /// Stops at the first failure so later cleanup never runs ahead of an
    /// earlier dependent that still exists.
    pub async fn cleanup(
        &self,
        primary: &P,
        ctx: &ReconcileContext,
    ) -> Result<DeleteControl, Error> {
        for dependent in self.dependents.iter().rev() {
            let Some(deleter) = dependent.deleter() else {
                continue;
            };
            debug!(dependent = dependent.name(), "deleting dependent");
            deleter
                .delete(primary, ctx)
                .await
                .map_err(|e| fail(dependent, "delete", e))?;
        }
        Ok(DeleteControl::DefaultDelete)
    }
}

impl<P> DependentResourceManager<P> {
    /// Whether any dependent needs explicit deletion, and hence a finalizer
    pub fn requires_cleanup(&self) -> bool {
        self.requires_cleanup
    }

    /// Dependent names in declared order
    pub fn dependents(&self) -> Vec<&str> {
        self.dependents.iter().map(ManagedDependent::name).collect()
    }

    /// Number of dependents
    pub fn len(&self) -> usize {
        self.dependents.len()
    }

    /// Whether the controller has no dependents
    pub fn is_empty(&self) -> bool {
        self.dependents.is_empty()
    }
}

impl<P> std::fmt::Debug for DependentResourceManager<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependentResourceManager")
            .field("dependents", &self.dependents)
            .field("requires_cleanup", &self.requires_cleanup)
            .finish()
    }
}

fn fail<P>(dependent: &ManagedDependent<P>, action: &str, err: Error) -> Error {
    warn!(dependent = dependent.name(), action, error = %err, "dependent failed");
    match err {
        Error::Dependent { .. } => err,
        other => Error::dependent(dependent.name(), format!("{action} failed: {other}")),
    }
}
