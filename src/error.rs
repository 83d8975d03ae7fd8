//! Error types for trellis
//!
//! Errors fall into three handling classes:
//! - configuration errors are fatal at controller startup and never retried
//! - optimistic-concurrency conflicts are retried in place, then surfaced
//! - everything else is rescheduled with backoff by the scheduler

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for trellis operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error other than a version conflict
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The store rejected a write because the resource version was stale
    #[error("conflict updating {resource}: {message}")]
    Conflict {
        /// Identity of the resource that was being written
        resource: String,
        /// Message reported by the store
        message: String,
    },

    /// The controller is misconfigured (unknown dependent kind, bad config payload)
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of what's invalid
        message: String,
    },

    /// A dependent resource failed to reconcile or delete
    #[error("dependent '{dependent}' failed: {message}")]
    Dependent {
        /// Name of the dependent that failed
        dependent: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "scheduler", "dispatcher")
        context: String,
    },
}

impl Error {
    /// Create a conflict error for the given resource
    pub fn conflict(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Conflict {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a configuration error with the given message
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Create a dependent failure for the named dependent
    pub fn dependent(dependent: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Dependent {
            dependent: dependent.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Map a kube error, turning HTTP 409 into [`Error::Conflict`]
    pub fn from_kube(resource: impl Into<String>, err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) if ae.code == 409 => Self::conflict(resource, ae.message),
            other => Self::Kube { source: other },
        }
    }

    /// Check if this error is an optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    /// Check if this error is a startup configuration error
    pub fn is_configuration(&self) -> bool {
        matches!(self, Error::Configuration { .. })
    }

    /// Check if this error is retryable
    ///
    /// Configuration and serialization errors require a fix and are not retried.
    /// Kubernetes errors are retried unless they are 4xx client errors.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code)
                )
            }
            Error::Conflict { .. } => true,
            Error::Configuration { .. } => false,
            Error::Dependent { .. } => true,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Get the dependent name if this error came from a dependent resource
    pub fn dependent_name(&self) -> Option<&str> {
        match self {
            Error::Dependent { dependent, .. } => Some(dependent),
            _ => None,
        }
    }
}
