//! Event sources feeding the dispatch scheduler
//!
//! An [`EventSource`] is a named stream of [`ResourceId`]s: each item means
//! "something about this primary resource may have changed, look again".
//! Sources carry no event type on purpose; the dispatcher always compares
//! desired and actual state instead of branching on what happened.

pub mod scheduler;

use futures::channel::mpsc;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, Resource, ResourceExt};
use tracing::warn;

use crate::resource::{PrimaryResource, ResourceId};

pub use scheduler::{DispatchHandler, Scheduler, SchedulerConfig};

/// A named notification channel for primary resource identities
pub struct EventSource {
    name: String,
    triggers: BoxStream<'static, ResourceId>,
}

impl EventSource {
    /// Wrap a stream of identities
    pub fn new<S>(name: impl Into<String>, triggers: S) -> Self
    where
        S: futures::Stream<Item = ResourceId> + Send + 'static,
    {
        Self {
            name: name.into(),
            triggers: triggers.boxed(),
        }
    }

    /// A source fed by hand through the returned [`EventTrigger`]
    ///
    /// The source ends once every trigger handle has been dropped.
    pub fn channel(name: impl Into<String>) -> (EventTrigger, Self) {
        let (tx, rx) = mpsc::unbounded();
        (EventTrigger { tx }, Self::new(name, rx))
    }

    /// Name used in logs
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Consume the source into its stream of identities
    pub fn into_stream(self) -> BoxStream<'static, ResourceId> {
        self.triggers
    }
}

impl std::fmt::Debug for EventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSource")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Sending half of [`EventSource::channel`]
#[derive(Clone, Debug)]
pub struct EventTrigger {
    tx: mpsc::UnboundedSender<ResourceId>,
}

impl EventTrigger {
    /// Emit a notification; returns false once the source has been dropped
    pub fn trigger(&self, id: ResourceId) -> bool {
        self.tx.unbounded_send(id).is_ok()
    }
}

/// What a dependent needs to build its event source
#[derive(Clone)]
pub struct EventSourceContext {
    client: Client,
    namespace: Option<String>,
    controller: String,
}

impl EventSourceContext {
    /// Create a context for the named controller
    pub fn new(client: Client, controller: impl Into<String>) -> Self {
        Self {
            client,
            namespace: None,
            controller: controller.into(),
        }
    }

    /// Restrict watches to one namespace
    pub fn with_namespace(mut self, namespace: Option<String>) -> Self {
        self.namespace = namespace;
        self
    }

    /// Client for building watches
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Namespace the controller watches, `None` for all namespaces
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Name of the controller the source belongs to
    pub fn controller(&self) -> &str {
        &self.controller
    }

    /// Api for `K` scoped to the watched namespace
    pub fn api<K>(&self) -> Api<K>
    where
        K: Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>,
    {
        match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }
}

/// Trigger on every change to a primary resource
pub fn watch_primary<P: PrimaryResource>(api: Api<P>, config: watcher::Config) -> EventSource {
    let name = format!("{}-watch", P::kind(&()));
    let triggers = watcher(api, config)
        .default_backoff()
        .touched_objects()
        .filter_map(|event| async move {
            match event {
                Ok(obj) => Some(ResourceId::of(&obj)),
                Err(e) => {
                    warn!(error = %e, "primary watch error");
                    None
                }
            }
        });
    EventSource::new(name, triggers)
}

/// Trigger the owning primary whenever an owned object of type `K` changes
pub fn watch_owned<K, P>(api: Api<K>, config: watcher::Config) -> EventSource
where
    K: PrimaryResource,
    P: PrimaryResource,
{
    let name = format!("{}-owned-by-{}", K::kind(&()), P::kind(&()));
    let triggers = watcher(api, config)
        .default_backoff()
        .touched_objects()
        .filter_map(|event| async move {
            match event {
                Ok(obj) => Some(stream::iter(owners_of::<K, P>(&obj))),
                Err(e) => {
                    warn!(error = %e, "owned object watch error");
                    None
                }
            }
        })
        .flatten();
    EventSource::new(name, triggers)
}

/// Identities of the `P` objects that own `obj`
pub fn owners_of<K, P>(obj: &K) -> Vec<ResourceId>
where
    K: Resource,
    P: Resource<DynamicType = ()>,
{
    let kind = P::kind(&());
    let api_version = P::api_version(&());
    obj.owner_references()
        .iter()
        .filter(|owner| owner.kind == kind && owner.api_version == api_version)
        .map(|owner| ResourceId {
            namespace: obj.namespace(),
            name: owner.name.clone(),
        })
        .collect()
}
