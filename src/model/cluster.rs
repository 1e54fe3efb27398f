//! Desired and observed cluster state
//!
//! `ClusterSpec` is what the user asks for; `ClusterState` is what the
//! provisioning controller has observed. Only the controller moves a
//! `ClusterState` between phases, and only along the edges allowed by
//! [`ClusterPhase::can_transition_to`].

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Structured validation error for `ClusterSpec` and configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpecValidationError {
    pub field: String,
    pub message: String,
    pub how_to_fix: String,
}

impl SpecValidationError {
    pub fn new(
        field: impl Into<String>,
        message: impl Into<String>,
        how_to_fix: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            how_to_fix: how_to_fix.into(),
        }
    }
}

/// How clients authenticate to the cluster API
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessMode {
    /// Access entries only
    Api,
    /// Access entries plus the legacy aws-auth ConfigMap
    #[default]
    ApiAndConfigMap,
    /// Legacy aws-auth ConfigMap only
    ConfigMap,
}

impl AccessMode {
    /// Whether access entries (and therefore access bindings) are honoured
    pub fn supports_access_entries(&self) -> bool {
        matches!(self, AccessMode::Api | AccessMode::ApiAndConfigMap)
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AccessMode::Api => "API",
            AccessMode::ApiAndConfigMap => "API_AND_CONFIG_MAP",
            AccessMode::ConfigMap => "CONFIG_MAP",
        };
        f.write_str(s)
    }
}

/// Rule for picking the subnets the control plane attaches to
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type", content = "ids")]
pub enum SubnetSelection {
    #[default]
    Public,
    Private,
    Explicit(Vec<String>),
}

/// Reference to the network the cluster lives in
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRef {
    pub vpc_id: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointAccess {
    pub public: bool,
    pub private: bool,
}

impl Default for EndpointAccess {
    fn default() -> Self {
        Self {
            public: true,
            private: true,
        }
    }
}

/// Desired configuration for one managed control plane.
///
/// Immutable once handed to the provisioning controller; the builder-style
/// methods consume and return `self`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    pub name: String,
    pub network: NetworkRef,
    #[serde(default)]
    pub subnets: SubnetSelection,
    pub version: String,
    #[serde(default)]
    pub access_mode: AccessMode,
    #[serde(default)]
    pub endpoint_access: EndpointAccess,
    /// Role the managed control plane assumes to call provider APIs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_role_arn: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

impl ClusterSpec {
    pub fn new(
        name: impl Into<String>,
        vpc_id: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            network: NetworkRef {
                vpc_id: vpc_id.into(),
            },
            subnets: SubnetSelection::default(),
            version: version.into(),
            access_mode: AccessMode::default(),
            endpoint_access: EndpointAccess::default(),
            service_role_arn: None,
            tags: BTreeMap::new(),
        }
    }

    pub fn with_subnets(mut self, subnets: SubnetSelection) -> Self {
        self.subnets = subnets;
        self
    }

    pub fn with_access_mode(mut self, mode: AccessMode) -> Self {
        self.access_mode = mode;
        self
    }

    pub fn with_endpoint_access(mut self, access: EndpointAccess) -> Self {
        self.endpoint_access = access;
        self
    }

    pub fn with_service_role(mut self, role_arn: impl Into<String>) -> Self {
        self.service_role_arn = Some(role_arn.into());
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Validate the cluster definition
    ///
    /// Checks shape only. Whether the provider accepts the version or the
    /// resolved subnets is decided at provision time.
    pub fn validate(&self) -> Result<(), Vec<SpecValidationError>> {
        let mut errors = Vec::new();

        if !is_valid_cluster_name(&self.name) {
            errors.push(SpecValidationError::new(
                "spec.name",
                "cluster name must be 1-100 characters of letters, digits, '-' or '_' and start with a letter",
                "Choose a name such as `demo-cluster`.",
            ));
        }

        if self.network.vpc_id.trim().is_empty() {
            errors.push(SpecValidationError::new(
                "spec.network.vpcId",
                "vpcId must not be empty",
                "Set spec.network.vpcId to the id of an existing VPC.",
            ));
        }

        if parse_version(&self.version).is_none() {
            errors.push(SpecValidationError::new(
                "spec.version",
                format!("'{}' is not a MAJOR.MINOR version", self.version),
                "Use a control-plane version such as \"1.28\".",
            ));
        }

        if !self.endpoint_access.public && !self.endpoint_access.private {
            errors.push(SpecValidationError::new(
                "spec.endpointAccess",
                "at least one of public or private endpoint access must be enabled",
                "Enable spec.endpointAccess.public, spec.endpointAccess.private, or both.",
            ));
        }

        if let SubnetSelection::Explicit(ids) = &self.subnets {
            if ids.is_empty() {
                errors.push(SpecValidationError::new(
                    "spec.subnets.ids",
                    "explicit subnet selection must list at least one subnet",
                    "List subnet ids or use the public/private selection rules.",
                ));
            }
            if ids.iter().any(|id| id.trim().is_empty()) {
                errors.push(SpecValidationError::new(
                    "spec.subnets.ids[]",
                    "subnet ids must not be empty",
                    "Remove empty entries from spec.subnets.ids.",
                ));
            }
        }

        if matches!(&self.service_role_arn, Some(arn) if !arn.starts_with("arn:")) {
            errors.push(SpecValidationError::new(
                "spec.serviceRoleArn",
                "serviceRoleArn must be an ARN",
                "Let the deployment create the service role, or pass a full role ARN.",
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn is_valid_cluster_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    name.len() <= 100 && chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Parse a `MAJOR.MINOR` control-plane version
pub fn parse_version(version: &str) -> Option<(u32, u32)> {
    let (major, minor) = version.trim().split_once('.')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

/// Lifecycle phase of a managed cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClusterPhase {
    Pending,
    Creating,
    Active,
    Failed,
    Deleting,
    Deleted,
}

impl ClusterPhase {
    /// Whether the state machine permits moving from `self` to `next`.
    ///
    /// Staying in the same phase is always allowed.
    pub fn can_transition_to(&self, next: ClusterPhase) -> bool {
        use ClusterPhase::*;
        if *self == next {
            return true;
        }
        matches!(
            (self, next),
            (Pending, Creating)
                | (Creating, Active)
                | (Creating, Failed)
                | (Active, Deleting)
                | (Failed, Deleting)
                | (Deleting, Deleted)
        )
    }

    /// No further progress will happen without an explicit request
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            ClusterPhase::Active | ClusterPhase::Failed | ClusterPhase::Deleted
        )
    }
}

impl fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Provider-assigned identity of a cluster
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterHandle {
    pub name: String,
    pub arn: String,
}

/// Observed state of a cluster, owned by the provisioning controller
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterState {
    handle: ClusterHandle,
    phase: ClusterPhase,
    version: String,
    access_mode: AccessMode,
    endpoint: Option<String>,
    certificate_authority: Option<String>,
    status_reason: Option<String>,
    last_transition_time: DateTime<Utc>,
}

impl ClusterState {
    pub(crate) fn pending(spec: &ClusterSpec, arn: impl Into<String>) -> Self {
        Self {
            handle: ClusterHandle {
                name: spec.name.clone(),
                arn: arn.into(),
            },
            phase: ClusterPhase::Pending,
            version: spec.version.clone(),
            access_mode: spec.access_mode,
            endpoint: None,
            certificate_authority: None,
            status_reason: None,
            last_transition_time: Utc::now(),
        }
    }

    /// Rebuild a state from a handle and a phase observed out of band,
    /// e.g. when tearing down a cluster created by an earlier invocation.
    pub(crate) fn observed(
        handle: ClusterHandle,
        phase: ClusterPhase,
        version: impl Into<String>,
        access_mode: AccessMode,
    ) -> Self {
        Self {
            handle,
            phase,
            version: version.into(),
            access_mode,
            endpoint: None,
            certificate_authority: None,
            status_reason: None,
            last_transition_time: Utc::now(),
        }
    }

    pub fn handle(&self) -> &ClusterHandle {
        &self.handle
    }

    pub fn name(&self) -> &str {
        &self.handle.name
    }

    pub fn arn(&self) -> &str {
        &self.handle.arn
    }

    pub fn phase(&self) -> ClusterPhase {
        self.phase
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn access_mode(&self) -> AccessMode {
        self.access_mode
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    /// Base64 PEM bundle of the cluster certificate authority
    pub fn certificate_authority(&self) -> Option<&str> {
        self.certificate_authority.as_deref()
    }

    pub fn status_reason(&self) -> Option<&str> {
        self.status_reason.as_deref()
    }

    pub fn last_transition_time(&self) -> DateTime<Utc> {
        self.last_transition_time
    }

    pub fn is_active(&self) -> bool {
        self.phase == ClusterPhase::Active
    }

    /// Fail with `ClusterNotReady` unless the cluster is Active
    pub fn ensure_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(Error::ClusterNotReady {
                cluster: self.handle.name.clone(),
                phase: self.phase,
            })
        }
    }

    pub(crate) fn transition(&mut self, next: ClusterPhase) -> Result<()> {
        if !self.phase.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                cluster: self.handle.name.clone(),
                from: self.phase,
                to: next,
            });
        }
        if self.phase != next {
            self.phase = next;
            self.last_transition_time = Utc::now();
        }
        Ok(())
    }

    pub(crate) fn set_arn(&mut self, arn: impl Into<String>) {
        self.handle.arn = arn.into();
    }

    pub(crate) fn set_connection(
        &mut self,
        endpoint: Option<String>,
        certificate_authority: Option<String>,
    ) {
        self.endpoint = endpoint;
        self.certificate_authority = certificate_authority;
    }

    pub(crate) fn set_status_reason(&mut self, reason: Option<String>) {
        self.status_reason = reason;
    }
}
