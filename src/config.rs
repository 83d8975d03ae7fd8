//! Controller configuration file
//!
//! ```yaml
//! name: configbundles
//! namespace: apps
//! workers: 8
//! conflictAttempts: 5
//! retry:
//!   maxAttempts: 0
//!   initialDelayMs: 1000
//!   maxDelayMs: 300000
//! dependents:
//!   - kind: configmap
//!     config:
//!       suffix: -config
//!   - kind: serviceaccount
//! ```

use std::path::Path;

use serde::Deserialize;

use crate::dependent::DependentResourceSpec;
use crate::event::SchedulerConfig;
use crate::resource::default_finalizer_name;
use crate::retry::{RetryConfig, DEFAULT_CONFLICT_ATTEMPTS};
use crate::Error;

/// Settings of one controller
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OperatorConfig {
    /// Controller name used in logs
    #[serde(default = "default_name")]
    pub name: String,

    /// Finalizer token, defaults to `<plural>.<group>/finalizer` of the primary type
    #[serde(default)]
    pub finalizer: Option<String>,

    /// Namespace to watch, all namespaces when unset
    #[serde(default)]
    pub namespace: Option<String>,

    /// Maximum dispatches running at once
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Backoff for failed dispatches
    #[serde(default = "default_retry")]
    pub retry: RetryConfig,

    /// In-place attempts for conflicting finalizer writes
    #[serde(default = "default_conflict_attempts")]
    pub conflict_attempts: u32,

    /// Dependents in reconcile order
    #[serde(default)]
    pub dependents: Vec<DependentResourceSpec>,
}

fn default_name() -> String {
    "trellis".to_string()
}

fn default_workers() -> usize {
    SchedulerConfig::default().workers
}

fn default_retry() -> RetryConfig {
    SchedulerConfig::default().retry
}

fn default_conflict_attempts() -> u32 {
    DEFAULT_CONFLICT_ATTEMPTS
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            finalizer: None,
            namespace: None,
            workers: default_workers(),
            retry: default_retry(),
            conflict_attempts: default_conflict_attempts(),
            dependents: Vec::new(),
        }
    }
}

impl OperatorConfig {
    /// Parse a YAML document
    pub fn from_yaml(yaml: &str) -> Result<Self, Error> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| Error::configuration(format!("invalid controller configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_yaml(&yaml)
    }

    /// Reject settings the controller cannot run with
    pub fn validate(&self) -> Result<(), Error> {
        if self.workers == 0 {
            return Err(Error::configuration("workers must be at least 1"));
        }
        if self.conflict_attempts == 0 {
            return Err(Error::configuration("conflictAttempts must be at least 1"));
        }
        if let Some(spec) = self.dependents.iter().find(|d| d.kind.trim().is_empty()) {
            return Err(Error::configuration(format!(
                "dependent entry {spec:?} has an empty kind"
            )));
        }
        Ok(())
    }

    /// Finalizer for primary type `P`
    pub fn finalizer_for<P: kube::Resource<DynamicType = ()>>(&self) -> String {
        self.finalizer
            .clone()
            .unwrap_or_else(default_finalizer_name::<P>)
    }

    /// Scheduler settings
    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            workers: self.workers,
            retry: self.retry.clone(),
        }
    }
}
