//! Cloud provider seam
//!
//! Everything the lifecycle needs from the cloud goes through
//! [`CloudProvider`]. Two implementations ship with the crate:
//!
//! - [`HttpProvider`] talks JSON to a control-plane gateway over HTTP.
//! - [`SimulatedProvider`] keeps all state in memory, for dry runs and tests.
//!
//! Implementations report failures with the crate [`Error`](crate::Error):
//! `Rejected` for refused requests, `NotFound` for missing resources, and
//! `Throttled` / `ProviderUnavailable` / `Timeout` for faults that callers
//! may retry.

mod http;
mod simulated;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{AccessMode, AccessScope, ClusterPhase, PolicyDocument, RoleRef, TrustPrincipal};

pub use http::HttpProvider;
pub use simulated::{ProviderCall, SimulatedCluster, SimulatedProvider};

/// Subnet as reported by the provider
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subnet {
    pub id: String,
    pub availability_zone: String,
    /// Whether the subnet routes to an internet gateway
    pub public: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateClusterRequest {
    pub name: String,
    pub version: String,
    pub role_arn: String,
    pub subnet_ids: Vec<String>,
    pub endpoint_public_access: bool,
    pub endpoint_private_access: bool,
    pub authentication_mode: AccessMode,
    pub bootstrap_cluster_creator_admin_permissions: bool,
    /// Reused across retries so the provider can deduplicate creates
    pub client_request_token: String,
    #[serde(default)]
    pub tags: std::collections::BTreeMap<String, String>,
}

/// Cluster status as the provider reports it
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderClusterStatus {
    Pending,
    Creating,
    Active,
    Updating,
    Deleting,
    Failed,
}

impl ProviderClusterStatus {
    /// Lifecycle phase this status corresponds to. An update in flight
    /// leaves the control plane serving, so it counts as Active.
    pub fn phase(&self) -> ClusterPhase {
        match self {
            ProviderClusterStatus::Pending => ClusterPhase::Pending,
            ProviderClusterStatus::Creating => ClusterPhase::Creating,
            ProviderClusterStatus::Active | ProviderClusterStatus::Updating => ClusterPhase::Active,
            ProviderClusterStatus::Deleting => ClusterPhase::Deleting,
            ProviderClusterStatus::Failed => ClusterPhase::Failed,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDescription {
    pub name: String,
    pub arn: String,
    pub status: ProviderClusterStatus,
    pub version: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Base64-encoded PEM bundle
    #[serde(default)]
    pub certificate_authority_data: Option<String>,
    #[serde(default)]
    pub authentication_mode: AccessMode,
    #[serde(default)]
    pub health_issues: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoleRequest {
    pub name: String,
    pub trust: TrustPrincipal,
    pub description: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssociatedPolicy {
    pub policy_arn: String,
    pub scope: AccessScope,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessEntryDescription {
    pub cluster_name: String,
    pub principal_arn: String,
    #[serde(default)]
    pub policies: Vec<AssociatedPolicy>,
}

/// Short-lived bearer token for the cluster API
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for ClusterToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterToken")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Narrow interface to the cloud control plane.
///
/// Creates must be idempotent: repeating a create with the same name (and,
/// for clusters, the same request token) returns the existing resource.
/// Deletes are eventually consistent.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Control-plane versions currently offered
    async fn supported_versions(&self) -> Result<Vec<String>>;

    async fn list_subnets(&self, vpc_id: &str) -> Result<Vec<Subnet>>;

    async fn create_cluster(&self, request: &CreateClusterRequest) -> Result<ClusterDescription>;

    async fn describe_cluster(&self, name: &str) -> Result<ClusterDescription>;

    async fn delete_cluster(&self, name: &str) -> Result<()>;

    async fn create_role(&self, request: &CreateRoleRequest) -> Result<RoleRef>;

    async fn delete_role(&self, name: &str) -> Result<()>;

    async fn attach_managed_policy(&self, role_name: &str, policy_arn: &str) -> Result<()>;

    async fn put_inline_policy(
        &self,
        role_name: &str,
        policy_name: &str,
        document: &PolicyDocument,
    ) -> Result<()>;

    /// In-cluster access policies the provider recognizes
    async fn list_access_policies(&self) -> Result<Vec<String>>;

    async fn create_access_entry(&self, cluster: &str, principal_arn: &str) -> Result<()>;

    async fn associate_access_policy(
        &self,
        cluster: &str,
        principal_arn: &str,
        policy_arn: &str,
        scope: &AccessScope,
    ) -> Result<()>;

    async fn describe_access_entry(
        &self,
        cluster: &str,
        principal_arn: &str,
    ) -> Result<AccessEntryDescription>;

    async fn delete_access_entry(&self, cluster: &str, principal_arn: &str) -> Result<()>;

    /// Issue a bearer token for `role_arn` against the cluster API
    async fn cluster_token(&self, cluster: &str, role_arn: &str) -> Result<ClusterToken>;
}
