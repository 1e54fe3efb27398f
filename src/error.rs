//! Error types for the cluster provisioner
//!
//! Every failure the lifecycle can surface maps onto a [`FailureKind`], which is
//! what callers branch on. The richer [`Error`] carries the context needed for
//! logs and operator-facing messages.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{ClusterPhase, SpecValidationError};

/// Coarse failure taxonomy shared by every component.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// The provider refused a create or update request
    Rejected,
    /// A bound was exceeded while waiting
    Timeout,
    /// An operation required an Active cluster
    ClusterNotReady,
    /// A scope, policy or action the provider does not recognize
    InvalidScope,
    /// The requested object does not exist
    NotFound,
    /// The field path could not be read from the object
    InvalidPath,
    /// The requested control-plane version is not offered by the provider
    UnsupportedVersion,
    /// The deployment was aborted by its caller
    Cancelled,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Rejected => "Rejected",
            FailureKind::Timeout => "Timeout",
            FailureKind::ClusterNotReady => "ClusterNotReady",
            FailureKind::InvalidScope => "InvalidScope",
            FailureKind::NotFound => "NotFound",
            FailureKind::InvalidPath => "InvalidPath",
            FailureKind::UnsupportedVersion => "UnsupportedVersion",
            FailureKind::Cancelled => "Cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Provider rejected request: {0}")]
    Rejected(String),

    #[error("Timed out after {elapsed:?} waiting for {operation}")]
    Timeout {
        operation: String,
        elapsed: Duration,
    },

    #[error("Cluster {cluster} is {phase}, expected Active")]
    ClusterNotReady { cluster: String, phase: ClusterPhase },

    #[error("Invalid scope: {0}")]
    InvalidScope(String),

    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },

    #[error("Cannot read path {path}: {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Control-plane version {requested} is not supported (supported: {})", .supported.join(", "))]
    UnsupportedVersion {
        requested: String,
        supported: Vec<String>,
    },

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// A post-provision read that completed with a failed result
    #[error("Post-provision read failed ({kind}): {message}")]
    ExecutionFailed { kind: FailureKind, message: String },

    /// Provider asked us to slow down; always retried
    #[error("Provider throttled request: {0}")]
    Throttled(String),

    /// Provider-side fault (5xx or equivalent); always retried
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Invalid phase transition for cluster {cluster}: {from} -> {to}")]
    InvalidTransition {
        cluster: String,
        from: ClusterPhase,
        to: ClusterPhase,
    },

    #[error("Validation failed: {}", format_validation_errors(.0))]
    ValidationError(Vec<SpecValidationError>),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Kubeconfig error: {0}")]
    KubeconfigError(#[from] kube::config::KubeconfigError),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

fn format_validation_errors(errors: &[SpecValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("{}: {}", e.field, e.message))
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Map this error onto the shared failure taxonomy.
    ///
    /// Infrastructure errors (config, serialization, IO) have no lifecycle
    /// meaning and return `None`.
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            Error::Rejected(_) => Some(FailureKind::Rejected),
            Error::Timeout { .. } => Some(FailureKind::Timeout),
            Error::ClusterNotReady { .. } => Some(FailureKind::ClusterNotReady),
            Error::InvalidScope(_) => Some(FailureKind::InvalidScope),
            Error::NotFound { .. } => Some(FailureKind::NotFound),
            Error::InvalidPath { .. } => Some(FailureKind::InvalidPath),
            Error::UnsupportedVersion { .. } => Some(FailureKind::UnsupportedVersion),
            Error::Cancelled(_) => Some(FailureKind::Cancelled),
            Error::ExecutionFailed { kind, .. } => Some(*kind),
            Error::KubeError(kube::Error::Api(resp)) if resp.code == 404 => {
                Some(FailureKind::NotFound)
            }
            _ => None,
        }
    }

    /// Whether a provider call that failed with this error may be retried
    /// locally. Only faults that can clear on their own qualify.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Throttled(_) | Error::ProviderUnavailable(_) | Error::Timeout { .. } => true,
            Error::HttpError(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, elapsed: Duration) -> Self {
        Error::Timeout {
            operation: operation.into(),
            elapsed,
        }
    }
}
