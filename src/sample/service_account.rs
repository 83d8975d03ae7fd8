use async_trait::async_trait;
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Api, Client, ResourceExt};
use tracing::debug;

use super::BundleLabels;
use crate::context::ReconcileContext;
use crate::crd::ConfigBundle;
use crate::dependent::kubernetes::{apply_if_changed, owner_reference_for};
use crate::dependent::{ClientAware, DependentResource};
use crate::Error;

/// ServiceAccount for consumers of a bundle
///
/// Owned by the bundle, so the API server removes it after the bundle is gone.
#[derive(Default)]
pub struct ServiceAccountDependent {
    client: Option<Client>,
}

impl ServiceAccountDependent {
    /// The ServiceAccount `bundle` should have
    pub fn desired(bundle: &ConfigBundle, labels: &BundleLabels) -> Result<ServiceAccount, Error> {
        Ok(ServiceAccount {
            metadata: ObjectMeta {
                name: Some(bundle.service_account_name()),
                namespace: bundle.namespace(),
                labels: Some(labels.0.clone()),
                owner_references: Some(vec![owner_reference_for(bundle)?]),
                ..Default::default()
            },
            ..Default::default()
        })
    }
}

#[async_trait]
impl DependentResource<ConfigBundle> for ServiceAccountDependent {
    fn name(&self) -> &str {
        "serviceaccount"
    }

    async fn reconcile(&self, bundle: &ConfigBundle, ctx: &ReconcileContext) -> Result<(), Error> {
        let client = self.client.clone().ok_or_else(|| {
            Error::internal_with_context("serviceaccount", "no client injected")
        })?;
        let namespace = bundle.namespace().ok_or_else(|| {
            Error::internal_with_context("serviceaccount", "bundle has no namespace")
        })?;

        let labels = ctx.get_or_insert_with(|| BundleLabels::for_bundle(bundle));
        let desired = Self::desired(bundle, &labels)?;
        let api: Api<ServiceAccount> = Api::namespaced(client, &namespace);
        let changed = apply_if_changed(&api, &desired).await?;
        debug!(serviceaccount = %desired.name_any(), changed, "serviceaccount reconciled");
        Ok(())
    }
}

impl ClientAware for ServiceAccountDependent {
    fn set_client(&mut self, client: Client) {
        self.client = Some(client);
    }
}
