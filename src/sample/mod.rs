//! Sample controller for [`ConfigBundle`](crate::crd::ConfigBundle)
//!
//! Two dependents, declared in this order:
//! - `configmap`: renders the bundle's data into a ConfigMap. Deletes it
//!   explicitly on cleanup and watches it for out-of-band edits.
//! - `serviceaccount`: a ServiceAccount for consumers of the bundle. It is
//!   owned by the bundle and left to garbage collection, so it has no deleter.

mod configmap;
mod reconciler;
mod service_account;

use std::collections::BTreeMap;

use crate::crd::ConfigBundle;
use crate::dependent::{DependentBuilder, DependentRegistry};

pub use configmap::{ConfigMapConfig, ConfigMapDependent, GeneratedConfigMap};
pub use reconciler::BundleReconciler;
pub use service_account::ServiceAccountDependent;

/// Registry tag of the ConfigMap dependent
pub const CONFIGMAP_KIND: &str = "configmap";
/// Registry tag of the ServiceAccount dependent
pub const SERVICE_ACCOUNT_KIND: &str = "serviceaccount";

/// Label marking objects generated by this controller
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
/// Value of [`LABEL_MANAGED_BY`]
pub const LABEL_MANAGED_BY_TRELLIS: &str = "trellis";
/// Label carrying the name of the owning bundle
pub const LABEL_BUNDLE: &str = "trellis.dev/bundle";

/// Labels shared by every object generated for one bundle
///
/// Computed once per reconciliation by [`BundleReconciler`] and read from the
/// context by each dependent.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BundleLabels(pub BTreeMap<String, String>);

impl BundleLabels {
    /// Standard labels plus the bundle's own extra labels
    pub fn for_bundle(bundle: &ConfigBundle) -> Self {
        let mut labels = bundle.spec.labels.clone();
        labels.insert(
            LABEL_MANAGED_BY.to_string(),
            LABEL_MANAGED_BY_TRELLIS.to_string(),
        );
        labels.insert(
            LABEL_BUNDLE.to_string(),
            kube::ResourceExt::name_any(bundle),
        );
        Self(labels)
    }
}

/// Registry with every dependent kind the sample controller supports
pub fn registry() -> DependentRegistry<ConfigBundle> {
    let mut registry = DependentRegistry::new();
    registry
        .register(CONFIGMAP_KIND, |cx| {
            Ok(DependentBuilder::new(ConfigMapDependent::default())
                .with_client(cx)
                .configure(cx)?
                .deleter()
                .event_source()
                .build())
        })
        .register(SERVICE_ACCOUNT_KIND, |cx| {
            Ok(DependentBuilder::new(ServiceAccountDependent::default())
                .with_client(cx)
                .build())
        });
    registry
}
