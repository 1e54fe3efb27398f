//! Post-provision execution requests and results

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

use crate::error::{Error, FailureKind, Result};
use crate::model::cluster::SpecValidationError;

/// Built-in object kinds the executor can read
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ObjectKind {
    ConfigMap,
    Secret,
    Service,
    ServiceAccount,
    Pod,
    Namespace,
    Node,
    Deployment,
    StatefulSet,
    DaemonSet,
}

impl ObjectKind {
    /// Cluster-scoped kinds ignore the request namespace
    pub fn is_namespaced(&self) -> bool {
        !matches!(self, ObjectKind::Namespace | ObjectKind::Node)
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl FromStr for ObjectKind {
    type Err = Error;

    /// Accepts the kind (`ConfigMap`), its lowercase plural (`configmaps`)
    /// and the usual short names (`cm`, `svc`, `deploy`, ...)
    fn from_str(s: &str) -> Result<Self> {
        let kind = match s.trim().to_ascii_lowercase().as_str() {
            "configmap" | "configmaps" | "cm" => ObjectKind::ConfigMap,
            "secret" | "secrets" => ObjectKind::Secret,
            "service" | "services" | "svc" => ObjectKind::Service,
            "serviceaccount" | "serviceaccounts" | "sa" => ObjectKind::ServiceAccount,
            "pod" | "pods" | "po" => ObjectKind::Pod,
            "namespace" | "namespaces" | "ns" => ObjectKind::Namespace,
            "node" | "nodes" | "no" => ObjectKind::Node,
            "deployment" | "deployments" | "deploy" => ObjectKind::Deployment,
            "statefulset" | "statefulsets" | "sts" => ObjectKind::StatefulSet,
            "daemonset" | "daemonsets" | "ds" => ObjectKind::DaemonSet,
            other => {
                return Err(Error::ValidationError(vec![SpecValidationError::new(
                    "execution.objectType",
                    format!("unsupported object type '{other}'"),
                    "Use a built-in kind such as ConfigMap, Secret, Service or Deployment.",
                )]))
            }
        };
        Ok(kind)
    }
}

/// One bounded read against a live cluster
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ExecutionRequest {
    pub object_type: ObjectKind,
    pub name: String,
    pub namespace: Option<String>,
    pub json_path: String,
    pub timeout: Duration,
}

impl ExecutionRequest {
    pub fn new(
        object_type: &str,
        name: impl Into<String>,
        namespace: Option<String>,
        json_path: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let object_type: ObjectKind = object_type.parse()?;
        let request = Self {
            object_type,
            name: name.into(),
            namespace: if object_type.is_namespaced() {
                Some(namespace.unwrap_or_else(|| "default".to_string()))
            } else {
                None
            },
            json_path: json_path.into(),
            timeout,
        };
        request.validate().map_err(Error::ValidationError)?;
        Ok(request)
    }

    pub fn validate(&self) -> Result<(), Vec<SpecValidationError>> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push(SpecValidationError::new(
                "execution.objectName",
                "object name must not be empty",
                "Name the object to read, e.g. kube-root-ca.crt.",
            ));
        }
        if matches!(&self.namespace, Some(ns) if ns.trim().is_empty()) {
            errors.push(SpecValidationError::new(
                "execution.objectNamespace",
                "namespace must not be empty",
                "Omit the namespace to use `default`, or name one explicitly.",
            ));
        }
        if let Err(e) = crate::controller::FieldPath::parse(&self.json_path) {
            errors.push(SpecValidationError::new(
                "execution.jsonPath",
                e.to_string(),
                "Use a path such as $.metadata.uid.",
            ));
        }
        if self.timeout.is_zero() {
            errors.push(SpecValidationError::new(
                "execution.timeoutSeconds",
                "timeout must be greater than zero",
                "Set a timeout such as 30 seconds.",
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn describe(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{} {}/{}", self.object_type, ns, self.name),
            None => format!("{} {}", self.object_type, self.name),
        }
    }
}

/// Outcome of one execution. A failed result never carries a value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    value: Option<String>,
    success: bool,
    failure: Option<FailureKind>,
    message: Option<String>,
}

impl ExecutionResult {
    pub fn succeeded(value: impl Into<String>) -> Self {
        Self {
            value: Some(value.into()),
            success: true,
            failure: None,
            message: None,
        }
    }

    pub fn failed(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            value: None,
            success: false,
            failure: Some(kind),
            message: Some(message.into()),
        }
    }

    /// Build a failed result from an error, keeping its failure kind
    pub fn from_error(err: &Error) -> Self {
        Self::failed(err.kind().unwrap_or(FailureKind::Rejected), err.to_string())
    }

    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn failure(&self) -> Option<FailureKind> {
        self.failure
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}
