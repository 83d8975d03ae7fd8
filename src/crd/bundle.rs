//! ConfigBundle Custom Resource Definition
//!
//! A ConfigBundle declares a set of configuration entries that the sample
//! controller materialises as a ConfigMap, together with a ServiceAccount
//! for the workloads that consume it.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification for a ConfigBundle
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "trellis.dev",
    version = "v1alpha1",
    kind = "ConfigBundle",
    plural = "configbundles",
    shortname = "cb",
    status = "ConfigBundleStatus",
    namespaced,
    derive = "PartialEq",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"ConfigMap","type":"string","jsonPath":".status.configMap"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ConfigBundleSpec {
    /// Entries written to the generated ConfigMap
    #[serde(default)]
    pub data: BTreeMap<String, String>,

    /// Extra labels stamped on every generated object
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Name of the generated ServiceAccount, defaults to the bundle name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
}

/// Lifecycle phase of a ConfigBundle
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum BundlePhase {
    /// Not reconciled yet
    #[default]
    Pending,
    /// Every generated object matches the spec
    Ready,
}

impl std::fmt::Display for BundlePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Ready => write!(f, "Ready"),
        }
    }
}

/// Observed state of a ConfigBundle
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigBundleStatus {
    /// Current phase
    #[serde(default)]
    pub phase: BundlePhase,

    /// Generation the status was computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Name of the generated ConfigMap
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map: Option<String>,

    /// Name of the generated ServiceAccount
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,

    /// Number of entries in the generated ConfigMap
    #[serde(default)]
    pub entries: usize,
}

impl ConfigBundle {
    /// Name of the ServiceAccount generated for this bundle
    pub fn service_account_name(&self) -> String {
        self.spec
            .service_account_name
            .clone()
            .unwrap_or_else(|| kube::ResourceExt::name_any(self))
    }
}
