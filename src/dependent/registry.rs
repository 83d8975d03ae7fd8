//! Type-tag registry for dependents declared in configuration
//!
//! A controller registers one constructor per dependent kind it supports. The
//! ordered `dependents` list of the controller configuration is resolved
//! against this registry once at startup.

use std::collections::BTreeMap;
use std::sync::Arc;

use kube::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::ManagedDependent;
use crate::Error;

/// One entry of the ordered dependents list
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependentResourceSpec {
    /// Registry tag of the dependent type
    pub kind: String,
    /// Display name, defaults to the dependent's own name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Untyped configuration payload handed to the dependent's `Configurator`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
}

impl DependentResourceSpec {
    /// Spec for `kind` with no name override and no configuration
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Default::default()
        }
    }

    /// Attach a configuration payload
    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = Some(config);
        self
    }

    /// Override the display name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Everything a constructor may draw on while building one dependent
pub struct ConstructionContext {
    client: Client,
    spec: DependentResourceSpec,
}

impl ConstructionContext {
    /// Context for building the dependent described by `spec`
    pub fn new(client: Client, spec: DependentResourceSpec) -> Self {
        Self { client, spec }
    }

    /// Store client to inject into `ClientAware` dependents
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// The spec entry being built
    pub fn spec(&self) -> &DependentResourceSpec {
        &self.spec
    }

    /// Deserialize the configuration payload as `T`
    ///
    /// Returns `Ok(None)` when the spec carries no payload.
    pub fn config<T: DeserializeOwned>(&self) -> Result<Option<T>, Error> {
        let Some(raw) = &self.spec.config else {
            return Ok(None);
        };
        serde_json::from_value(raw.clone()).map(Some).map_err(|e| {
            Error::configuration(format!(
                "invalid configuration for dependent kind '{}': {e}",
                self.spec.kind
            ))
        })
    }
}

type Constructor<P> =
    Arc<dyn Fn(&ConstructionContext) -> Result<ManagedDependent<P>, Error> + Send + Sync>;

/// Maps dependent kinds to their constructors
pub struct DependentRegistry<P> {
    constructors: BTreeMap<String, Constructor<P>>,
}

impl<P> Default for DependentRegistry<P> {
    fn default() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }
}

impl<P> Clone for DependentRegistry<P> {
    fn clone(&self) -> Self {
        Self {
            constructors: self.constructors.clone(),
        }
    }
}

impl<P> DependentRegistry<P> {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the constructor for `kind`, replacing any earlier one
    pub fn register<F>(&mut self, kind: impl Into<String>, constructor: F) -> &mut Self
    where
        F: Fn(&ConstructionContext) -> Result<ManagedDependent<P>, Error> + Send + Sync + 'static,
    {
        self.constructors.insert(kind.into(), Arc::new(constructor));
        self
    }

    /// Whether a constructor exists for `kind`
    pub fn contains(&self, kind: &str) -> bool {
        self.constructors.contains_key(kind)
    }

    /// Registered kinds, sorted
    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    /// Build the dependent described by `spec`
    ///
    /// An unregistered kind is a configuration error.
    pub fn resolve(
        &self,
        client: &Client,
        spec: &DependentResourceSpec,
    ) -> Result<ManagedDependent<P>, Error> {
        let constructor = self.constructors.get(&spec.kind).ok_or_else(|| {
            Error::configuration(format!(
                "unknown dependent kind '{}' (registered: {})",
                spec.kind,
                self.kinds().collect::<Vec<_>>().join(", ")
            ))
        })?;
        let cx = ConstructionContext::new(client.clone(), spec.clone());
        let mut dependent = constructor(&cx)?;
        if let Some(name) = &spec.name {
            dependent.rename(name.clone());
        }
        Ok(dependent)
    }
}

impl<P> std::fmt::Debug for DependentRegistry<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependentRegistry")
            .field("kinds", &self.kinds().collect::<Vec<_>>())
            .finish()
    }
}
