//! Persistence of primary resources

use std::marker::PhantomData;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Patch, PatchParams, PostParams};
use kube::{Api, Client, Resource, ResourceExt};
#[cfg(test)]
use mockall::automock;
use serde_json::json;

use crate::resource::{PrimaryResource, ResourceId};
use crate::Error;

/// Read and write access to primary resources
///
/// Writes through [`PrimaryStore::replace_with_lock`] carry the object's
/// resource version and fail with [`Error::Conflict`] when it is stale.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PrimaryStore<P: PrimaryResource>: Send + Sync {
    /// Latest persisted copy, `None` if the resource no longer exists
    async fn get(&self, id: &ResourceId) -> Result<Option<P>, Error>;

    /// Replace the whole resource, guarded by its resource version
    async fn replace_with_lock(&self, resource: &P) -> Result<P, Error>;

    /// Merge-patch the status subresource, without the version guard
    async fn patch_status(&self, resource: &P) -> Result<P, Error>;
}

/// [`PrimaryStore`] backed by the Kubernetes API server
pub struct KubeStore<P> {
    client: Client,
    _kind: PhantomData<fn() -> P>,
}

impl<P> KubeStore<P> {
    /// Store using `client`
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _kind: PhantomData,
        }
    }
}

impl<P> Clone for KubeStore<P> {
    fn clone(&self) -> Self {
        Self::new(self.client.clone())
    }
}

impl<P> KubeStore<P>
where
    P: PrimaryResource + Resource<Scope = NamespaceResourceScope>,
{
    fn api(&self, id: &ResourceId) -> Result<Api<P>, Error> {
        let namespace = id.namespace.as_deref().ok_or_else(|| {
            Error::internal_with_context(
                "store",
                format!("{} '{}' has no namespace", P::kind(&()), id.name),
            )
        })?;
        Ok(Api::namespaced(self.client.clone(), namespace))
    }
}

#[async_trait]
impl<P> PrimaryStore<P> for KubeStore<P>
where
    P: PrimaryResource + Resource<Scope = NamespaceResourceScope>,
{
    async fn get(&self, id: &ResourceId) -> Result<Option<P>, Error> {
        self.api(id)?
            .get_opt(&id.name)
            .await
            .map_err(|e| Error::from_kube(id.to_string(), e))
    }

    async fn replace_with_lock(&self, resource: &P) -> Result<P, Error> {
        let id = ResourceId::of(resource);
        if resource.resource_version().is_none() {
            return Err(Error::internal_with_context(
                "store",
                format!("refusing to replace {id} without a resource version"),
            ));
        }
        self.api(&id)?
            .replace(&id.name, &PostParams::default(), resource)
            .await
            .map_err(|e| Error::from_kube(id.to_string(), e))
    }

    async fn patch_status(&self, resource: &P) -> Result<P, Error> {
        let id = ResourceId::of(resource);
        let body = serde_json::to_value(resource)
            .map_err(|e| Error::serialization(format!("status of {id}: {e}")))?;
        let patch = json!({ "status": body.get("status").cloned().unwrap_or_default() });
        self.api(&id)?
            .patch_status(&id.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| Error::from_kube(id.to_string(), e))
    }
}

/// Copy the `status` of `source` onto `target`
///
/// Used after a full replace, which the API server applies without status.
pub(crate) fn with_status_of<P: PrimaryResource>(target: P, source: &P) -> Result<P, Error> {
    let mut merged =
        serde_json::to_value(target).map_err(|e| Error::serialization(e.to_string()))?;
    let status = serde_json::to_value(source)
        .map_err(|e| Error::serialization(e.to_string()))?
        .get("status")
        .cloned();
    if let (Some(obj), Some(status)) = (merged.as_object_mut(), status) {
        obj.insert("status".to_string(), status);
    }
    serde_json::from_value(merged).map_err(|e| Error::serialization(e.to_string()))
}
