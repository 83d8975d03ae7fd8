//! trellis - dependent-resource orchestration for Kubernetes controllers
//!
//! A controller watches one primary resource type and keeps a declared,
//! ordered list of dependent resources converged with it. When the primary
//! is deleted, a finalizer holds it until every delete-capable dependent has
//! been removed, in reverse order.
//!
//! # Architecture
//!
//! ```text
//! EventSource ─> Scheduler ─> Controller ─> Dispatcher ─┬─> DependentResourceManager ─> dependents
//!                                                       └─> Reconciler (user logic)
//! ```
//!
//! - The scheduler runs at most one dispatch per resource identity at a time
//!   and coalesces events that arrive meanwhile.
//! - The dispatcher decides between a reconcile pass and a delete pass and
//!   owns the finalizer.
//! - Dependents are built once from a type-tag registry and shared by every
//!   reconciliation.
//!
//! # Modules
//!
//! - [`controller`] - Controller, dispatch state machine and primary store
//! - [`dependent`] - Dependent resource capabilities, registry and manager
//! - [`event`] - Event sources and the dispatch scheduler
//! - [`context`] - Per-reconciliation scratch space
//! - [`control`] - Update and delete outcomes returned by user logic
//! - [`config`] - Controller configuration file
//! - [`crd`] - The sample `ConfigBundle` resource
//! - [`sample`] - The sample controller's dependents and reconciler
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod config;
pub mod context;
pub mod control;
pub mod controller;
pub mod crd;
pub mod dependent;
pub mod error;
pub mod event;
pub mod resource;
pub mod retry;
pub mod sample;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
