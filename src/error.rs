//! Error types for the Unified Replication Operator
//!
//! Provides structured error types for every operator component: discovery,
//! translation, backend adapters, the resilience layer and the controller
//! engine. Each error carries a status reason code and a requeue policy.

use crate::domain::Backend;
use std::time::Duration;
use thiserror::Error;

/// Unified error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("{kind} {name} is managed by {owner}")]
    ResourceConflict {
        kind: String,
        name: String,
        owner: String,
    },

    // =========================================================================
    // Intent / Policy Errors
    // =========================================================================
    #[error("Invalid replication spec: {0}")]
    InvalidSpec(String),

    #[error("Invalid state transition {from} -> {to}: {reason}")]
    InvalidTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("Replication class not found: {class}")]
    ClassNotFound { class: String },

    #[error("Unknown provisioner: {provisioner}")]
    UnknownProvisioner { provisioner: String },

    #[error("Backend {backend} does not support {mode} replication")]
    UnsupportedMode { backend: Backend, mode: String },

    // =========================================================================
    // Translation Errors
    // =========================================================================
    #[error("Invalid {backend} parameter {key}={value}: {reason}")]
    InvalidParameter {
        backend: Backend,
        key: String,
        value: String,
        reason: String,
    },

    #[error("Unrecognized {backend} state value: {value}")]
    UnknownBackendValue { backend: Backend, value: String },

    // =========================================================================
    // Registry Errors
    // =========================================================================
    #[error("No adapter registered for backend {backend}")]
    AdapterNotRegistered { backend: Backend },

    #[error("Adapter already registered for backend {backend}")]
    AdapterAlreadyRegistered { backend: Backend },

    // =========================================================================
    // Backend Errors
    // =========================================================================
    #[error("Backend {backend} is not available in cluster")]
    BackendNotAvailable { backend: Backend },

    #[error("No replication backend is available in cluster")]
    NoBackendAvailable,

    #[error("Backend unavailable: {backend}")]
    BackendUnavailable { backend: Backend },

    #[error("Backend operation failed: {backend} - {operation}: {reason}")]
    BackendOperationFailed {
        backend: Backend,
        operation: String,
        reason: String,
    },

    #[error("Transient backend error: {backend} - {operation}: {reason}")]
    BackendTransient {
        backend: Backend,
        operation: String,
        reason: String,
    },

    #[error("Partial write on {backend}: {completed} succeeded but {pending} failed: {reason}")]
    PartialWrite {
        backend: Backend,
        completed: String,
        pending: String,
        reason: String,
    },

    // =========================================================================
    // Resilience Errors
    // =========================================================================
    #[error("Circuit open for backend {backend}")]
    CircuitOpen { backend: Backend },

    #[error("Operation cancelled")]
    Cancelled,

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            e if e.is_transient() => ErrorAction::RequeueWithBackoff,

            // Circuit open - wait for the cool-down
            Error::CircuitOpen { .. } => ErrorAction::RequeueAfter(Duration::from_secs(30)),

            // Not installed - re-detected once the discovery cache expires
            Error::BackendNotAvailable { .. } | Error::NoBackendAvailable => {
                ErrorAction::RequeueAfter(Duration::from_secs(60))
            }

            // Configuration, translation and partial-write errors need a spec change
            Error::Configuration(_)
            | Error::InvalidSpec(_)
            | Error::InvalidTransition { .. }
            | Error::ClassNotFound { .. }
            | Error::UnknownProvisioner { .. }
            | Error::UnsupportedMode { .. }
            | Error::InvalidParameter { .. }
            | Error::UnknownBackendValue { .. }
            | Error::AdapterNotRegistered { .. }
            | Error::AdapterAlreadyRegistered { .. }
            | Error::PartialWrite { .. }
            | Error::ResourceConflict { .. }
            | Error::Cancelled => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is transient and worth an immediate retry
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Kube(kube::Error::Api(response)) => {
                response.code >= 500 || response.code == 429 || response.code == 409
            }
            Error::Kube(_) | Error::BackendUnavailable { .. } | Error::BackendTransient { .. } => {
                true
            }
            _ => false,
        }
    }

    /// Check if this error counts against a backend's circuit breaker
    pub fn trips_circuit(&self) -> bool {
        self.is_transient() || matches!(self, Error::BackendOperationFailed { .. })
    }

    /// Machine-readable reason code written to status conditions
    pub fn reason(&self) -> &'static str {
        match self {
            Error::Internal(_) => "InternalError",
            Error::Configuration(_) => "ConfigurationError",
            Error::Kube(_) => "KubernetesError",
            Error::ResourceNotFound { .. } => "ResourceNotFound",
            Error::ResourceConflict { .. } => "ResourceConflict",
            Error::InvalidSpec(_) => "InvalidSpec",
            Error::InvalidTransition { .. } => "InvalidTransition",
            Error::ClassNotFound { .. } => "ClassNotFound",
            Error::UnknownProvisioner { .. } => "UnknownProvisioner",
            Error::UnsupportedMode { .. } => "UnsupportedMode",
            Error::InvalidParameter { .. } => "InvalidParameter",
            Error::UnknownBackendValue { .. } => "UnknownBackendState",
            Error::AdapterNotRegistered { .. } => "AdapterNotRegistered",
            Error::AdapterAlreadyRegistered { .. } => "AdapterAlreadyRegistered",
            Error::BackendNotAvailable { .. } => "BackendNotAvailable",
            Error::NoBackendAvailable => "NoBackendAvailable",
            Error::BackendUnavailable { .. } => "BackendUnavailable",
            Error::BackendOperationFailed { .. } => "BackendError",
            Error::BackendTransient { .. } => "BackendTransientError",
            Error::PartialWrite { .. } => "PartialBackendWrite",
            Error::CircuitOpen { .. } => "CircuitOpen",
            Error::Cancelled => "Cancelled",
            Error::JsonParse(_) | Error::YamlParse(_) => "ParseError",
            Error::Io(_) => "IoError",
        }
    }
}

/// Result type alias for the operator
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> Error {
        Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".into(),
            message: "boom".into(),
            reason: "Test".into(),
            code,
        }))
    }

    #[test]
    fn test_error_actions() {
        let err = Error::BackendNotAvailable {
            backend: Backend::Trident,
        };
        assert_eq!(
            err.action(),
            ErrorAction::RequeueAfter(Duration::from_secs(60))
        );

        let err = Error::Configuration("bad config".into());
        assert_eq!(err.action(), ErrorAction::NoRequeue);

        let err = Error::PartialWrite {
            backend: Backend::PowerStore,
            completed: "volume label".into(),
            pending: "replication group".into(),
            reason: "timeout".into(),
        };
        assert_eq!(err.action(), ErrorAction::NoRequeue);
        assert_eq!(err.reason(), "PartialBackendWrite");
    }

    #[test]
    fn test_error_retryable() {
        let transient = Error::BackendUnavailable {
            backend: Backend::Ceph,
        };
        assert!(transient.is_retryable());
        assert!(transient.is_transient());

        let config_err = Error::InvalidParameter {
            backend: Backend::Ceph,
            key: "mirroringMode".into(),
            value: "bogus".into(),
            reason: "unknown mirroring mode".into(),
        };
        assert!(!config_err.is_retryable());
        assert!(!config_err.is_transient());
        assert!(!config_err.trips_circuit());
    }

    #[test]
    fn test_kube_api_error_classification() {
        assert!(api_error(503).is_transient());
        assert!(api_error(429).is_transient());
        assert!(!api_error(422).is_transient());
        assert!(!api_error(403).trips_circuit());
    }

    #[test]
    fn test_reason_codes() {
        assert_eq!(
            Error::BackendNotAvailable {
                backend: Backend::Ceph
            }
            .reason(),
            "BackendNotAvailable"
        );
        assert_eq!(Error::Cancelled.reason(), "Cancelled");
        assert_eq!(
            Error::CircuitOpen {
                backend: Backend::Trident
            }
            .reason(),
            "CircuitOpen"
        );
    }
}
