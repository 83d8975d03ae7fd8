use async_trait::async_trait;
use kube::ResourceExt;
use tracing::info;

use super::{BundleLabels, GeneratedConfigMap};
use crate::context::ReconcileContext;
use crate::control::UpdateControl;
use crate::controller::Reconciler;
use crate::crd::{BundlePhase, ConfigBundle, ConfigBundleStatus};
use crate::Error;

/// Publishes the bundle's status once its dependents are in place
#[derive(Clone, Debug, Default)]
pub struct BundleReconciler;

impl BundleReconciler {
    /// Status describing a bundle whose dependents just converged
    pub fn status(bundle: &ConfigBundle, ctx: &ReconcileContext) -> ConfigBundleStatus {
        ConfigBundleStatus {
            phase: BundlePhase::Ready,
            observed_generation: bundle.metadata.generation,
            config_map: ctx.get::<GeneratedConfigMap>().map(|cm| cm.0.clone()),
            service_account: Some(bundle.service_account_name()),
            entries: bundle.spec.data.len(),
        }
    }
}

#[async_trait]
impl Reconciler<ConfigBundle> for BundleReconciler {
    async fn reconcile(
        &self,
        bundle: &ConfigBundle,
        ctx: &ReconcileContext,
    ) -> Result<UpdateControl<ConfigBundle>, Error> {
        let status = Self::status(bundle, ctx);
        if bundle.status.as_ref() == Some(&status) {
            return Ok(UpdateControl::no_update());
        }

        info!(
            bundle = %bundle.name_any(),
            phase = %status.phase,
            entries = status.entries,
            "bundle ready"
        );
        let mut updated = bundle.clone();
        updated.status = Some(status);
        Ok(UpdateControl::update_status(updated))
    }

    fn init_context(&self, bundle: &ConfigBundle, ctx: &ReconcileContext) {
        ctx.insert(BundleLabels::for_bundle(bundle));
    }
}
