use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use serde::Deserialize;
use tracing::debug;

use super::{BundleLabels, LABEL_MANAGED_BY, LABEL_MANAGED_BY_TRELLIS};
use crate::context::ReconcileContext;
use crate::crd::ConfigBundle;
use crate::dependent::kubernetes::{apply_if_changed, delete_if_exists, owner_reference_for};
use crate::dependent::{
    ClientAware, Configurator, Deleter, DependentResource, EventSourceProvider,
};
use crate::event::{watch_owned, EventSource, EventSourceContext};
use crate::Error;

const DEFAULT_SUFFIX: &str = "-config";

/// Configuration of the ConfigMap dependent
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ConfigMapConfig {
    /// Appended to the bundle name to form the ConfigMap name
    #[serde(default = "default_suffix")]
    pub suffix: String,
    /// Labels added on top of the bundle labels
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

fn default_suffix() -> String {
    DEFAULT_SUFFIX.to_string()
}

/// Name of the ConfigMap written during this reconciliation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GeneratedConfigMap(pub String);

/// Renders a bundle's data into a ConfigMap
pub struct ConfigMapDependent {
    client: Option<Client>,
    suffix: String,
    labels: BTreeMap<String, String>,
}

impl Default for ConfigMapDependent {
    fn default() -> Self {
        Self {
            client: None,
            suffix: default_suffix(),
            labels: BTreeMap::new(),
        }
    }
}

impl ConfigMapDependent {
    /// Name of the ConfigMap generated for `bundle`
    pub fn config_map_name(&self, bundle: &ConfigBundle) -> String {
        format!("{}{}", bundle.name_any(), self.suffix)
    }

    /// The ConfigMap `bundle` should have
    pub fn desired(
        &self,
        bundle: &ConfigBundle,
        labels: &BundleLabels,
    ) -> Result<ConfigMap, Error> {
        let mut all_labels = labels.0.clone();
        all_labels.extend(self.labels.clone());
        // The owned-object watch selects on this label.
        all_labels.insert(
            LABEL_MANAGED_BY.to_string(),
            LABEL_MANAGED_BY_TRELLIS.to_string(),
        );

        Ok(ConfigMap {
            metadata: ObjectMeta {
                name: Some(self.config_map_name(bundle)),
                namespace: bundle.namespace(),
                labels: Some(all_labels),
                owner_references: Some(vec![owner_reference_for(bundle)?]),
                ..Default::default()
            },
            data: Some(bundle.spec.data.clone()),
            ..Default::default()
        })
    }

    fn api(&self, bundle: &ConfigBundle) -> Result<Api<ConfigMap>, Error> {
        let client = self
            .client
            .clone()
            .ok_or_else(|| Error::internal_with_context("configmap", "no client injected"))?;
        let namespace = bundle
            .namespace()
            .ok_or_else(|| Error::internal_with_context("configmap", "bundle has no namespace"))?;
        Ok(Api::namespaced(client, &namespace))
    }
}

#[async_trait]
impl DependentResource<ConfigBundle> for ConfigMapDependent {
    fn name(&self) -> &str {
        "configmap"
    }

    async fn reconcile(&self, bundle: &ConfigBundle, ctx: &ReconcileContext) -> Result<(), Error> {
        let labels = ctx.get_or_insert_with(|| BundleLabels::for_bundle(bundle));
        let desired = self.desired(bundle, &labels)?;
        let changed = apply_if_changed(&self.api(bundle)?, &desired).await?;
        debug!(configmap = %desired.name_any(), changed, "configmap reconciled");
        ctx.insert(GeneratedConfigMap(desired.name_any()));
        Ok(())
    }
}

#[async_trait]
impl Deleter<ConfigBundle> for ConfigMapDependent {
    async fn delete(&self, bundle: &ConfigBundle, _ctx: &ReconcileContext) -> Result<(), Error> {
        delete_if_exists(&self.api(bundle)?, &self.config_map_name(bundle)).await?;
        Ok(())
    }
}

impl EventSourceProvider for ConfigMapDependent {
    fn init_event_source(&self, ctx: &EventSourceContext) -> Result<EventSource, Error> {
        let selector = format!("{LABEL_MANAGED_BY}={LABEL_MANAGED_BY_TRELLIS}");
        Ok(watch_owned::<ConfigMap, ConfigBundle>(
            ctx.api::<ConfigMap>(),
            watcher::Config::default().labels(&selector),
        ))
    }
}

impl Configurator for ConfigMapDependent {
    type Config = ConfigMapConfig;

    fn configure_with(&mut self, config: ConfigMapConfig) {
        self.suffix = config.suffix;
        self.labels = config.labels;
    }
}

impl ClientAware for ConfigMapDependent {
    fn set_client(&mut self, client: Client) {
        self.client = Some(client);
    }
}
