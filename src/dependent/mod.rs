//! Dependent resources and their capabilities
//!
//! A dependent resource converges one sub-resource of a primary resource. Its
//! only mandatory capability is [`DependentResource::reconcile`]; deletion,
//! event sources, typed configuration and client injection are optional and
//! orthogonal. They are attached once through [`DependentBuilder`], which only
//! offers a capability when the concrete type implements the matching trait,
//! and are then frozen into a [`ManagedDependent`].
//!
//! Instances are shared by every reconciliation of every primary resource of
//! a controller. Any state they keep must be immutable after construction or
//! internally synchronised.

pub mod kubernetes;
pub mod manager;
pub mod registry;

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::context::ReconcileContext;
use crate::event::{EventSource, EventSourceContext};
use crate::Error;

pub use kubernetes::FIELD_MANAGER;
pub use manager::DependentResourceManager;
pub use registry::{ConstructionContext, DependentRegistry, DependentResourceSpec};

/// Core capability: converge one sub-resource toward its desired state
///
/// `reconcile` must compare desired and observed state and only write when
/// they differ, so repeated calls on a converged resource have no effect.
#[async_trait]
pub trait DependentResource<P>: Send + Sync {
    /// Name used in logs and errors
    fn name(&self) -> &str;

    /// Create or update the sub-resource for `primary`
    async fn reconcile(&self, primary: &P, ctx: &ReconcileContext) -> Result<(), Error>;
}

/// Optional capability: remove the sub-resource when the primary goes away
#[async_trait]
pub trait Deleter<P>: Send + Sync {
    /// Delete the sub-resource; must succeed if it is already gone
    async fn delete(&self, primary: &P, ctx: &ReconcileContext) -> Result<(), Error>;
}

/// Optional capability: notify the controller when the sub-resource changes
pub trait EventSourceProvider: Send + Sync {
    /// Build the event source; called once at controller startup
    fn init_event_source(&self, ctx: &EventSourceContext) -> Result<EventSource, Error>;
}

/// Optional capability: typed configuration applied before first use
pub trait Configurator {
    /// Configuration payload, deserialised from the dependent's spec entry
    type Config: DeserializeOwned;

    /// Apply the configuration
    fn configure_with(&mut self, config: Self::Config);
}

/// Optional capability: receive the store client at construction time
pub trait ClientAware {
    /// Inject the client
    fn set_client(&mut self, client: ::kube::Client);
}

/// A dependent with its capabilities resolved
pub struct ManagedDependent<P> {
    name: String,
    reconciler: Arc<dyn DependentResource<P>>,
    deleter: Option<Arc<dyn Deleter<P>>>,
    event_source: Option<Arc<dyn EventSourceProvider>>,
}

impl<P> Clone for ManagedDependent<P> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            reconciler: self.reconciler.clone(),
            deleter: self.deleter.clone(),
            event_source: self.event_source.clone(),
        }
    }
}

impl<P> ManagedDependent<P> {
    /// Name used in logs and errors
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this dependent takes part in cleanup
    pub fn is_deleter(&self) -> bool {
        self.deleter.is_some()
    }

    /// Whether this dependent contributes an event source
    pub fn provides_event_source(&self) -> bool {
        self.event_source.is_some()
    }

    pub(crate) fn rename(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub(crate) fn reconciler(&self) -> &dyn DependentResource<P> {
        self.reconciler.as_ref()
    }

    pub(crate) fn deleter(&self) -> Option<&dyn Deleter<P>> {
        self.deleter.as_deref()
    }

    pub(crate) fn event_source_provider(&self) -> Option<&dyn EventSourceProvider> {
        self.event_source.as_deref()
    }
}

impl<P> std::fmt::Debug for ManagedDependent<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedDependent")
            .field("name", &self.name)
            .field("deleter", &self.is_deleter())
            .field("event_source", &self.provides_event_source())
            .finish()
    }
}

/// Attaches capabilities to a concrete dependent before it is shared
///
/// Each capability method is only callable when `D` implements the matching
/// trait, so a dependent can never claim a capability it does not have.
///
/// ```ignore
/// let dependent = DependentBuilder::new(ConfigMapDependent::default())
///     .with_client(cx)
///     .configure(cx)?
///     .deleter()
///     .event_source()
///     .build();
/// ```
pub struct DependentBuilder<P, D> {
    resource: D,
    name: Option<String>,
    deleter: Option<fn(Arc<D>) -> Arc<dyn Deleter<P>>>,
    event_source: Option<fn(Arc<D>) -> Arc<dyn EventSourceProvider>>,
}

impl<P, D> DependentBuilder<P, D>
where
    P: 'static,
    D: DependentResource<P> + 'static,
{
    /// Start building from a freshly constructed dependent
    pub fn new(resource: D) -> Self {
        Self {
            resource,
            name: None,
            deleter: None,
            event_source: None,
        }
    }

    /// Override the dependent's own name
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Inject the client held by the construction context
    pub fn with_client(mut self, cx: &ConstructionContext) -> Self
    where
        D: ClientAware,
    {
        self.resource.set_client(cx.client().clone());
        self
    }

    /// Apply the spec's configuration payload, if it has one
    ///
    /// A payload that does not match `D::Config` is a configuration error.
    pub fn configure(mut self, cx: &ConstructionContext) -> Result<Self, Error>
    where
        D: Configurator,
    {
        if let Some(config) = cx.config::<D::Config>()? {
            self.resource.configure_with(config);
        }
        Ok(self)
    }

    /// Declare the deletion capability
    pub fn deleter(mut self) -> Self
    where
        D: Deleter<P>,
    {
        self.deleter = Some(|d: Arc<D>| -> Arc<dyn Deleter<P>> { d });
        self
    }

    /// Declare the event source capability
    pub fn event_source(mut self) -> Self
    where
        D: EventSourceProvider,
    {
        self.event_source = Some(|d: Arc<D>| -> Arc<dyn EventSourceProvider> { d });
        self
    }

    /// Freeze the capabilities into a shareable dependent
    pub fn build(self) -> ManagedDependent<P> {
        let name = self
            .name
            .unwrap_or_else(|| self.resource.name().to_string());
        let resource = Arc::new(self.resource);
        ManagedDependent {
            name,
            deleter: self.deleter.map(|upcast| upcast(resource.clone())),
            event_source: self.event_source.map(|upcast| upcast(resource.clone())),
            reconciler: resource,
        }
    }
}
