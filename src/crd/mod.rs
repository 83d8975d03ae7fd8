//! Custom Resource Definitions for trellis
//!
//! This module contains the CRD served by the sample controller.

mod bundle;

pub use bundle::{BundlePhase, ConfigBundle, ConfigBundleSpec, ConfigBundleStatus};
