//! Identities and grants
//!
//! Automation touches three separate authorities, and each gets its own type
//! so they cannot be swapped by accident:
//!
//! | Type | Authority |
//! |------|-----------|
//! | [`ExecutionIdentity`] | the role automation code runs as |
//! | [`ManagementApiGrant`] | management-API actions (e.g. `eks:DescribeCluster`) allowed for that role |
//! | [`ClusterPrincipal`] | the principal an in-cluster access policy is bound to |
//!
//! [`AuthorizedIdentity`] is the only way to combine them, and is what the
//! post-provision executor requires.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::cluster::ClusterHandle;

/// Managed policy the control plane role needs to operate the cluster
pub const CLUSTER_SERVICE_POLICY_ARN: &str = "arn:aws:iam::aws:policy/AmazonEKSClusterPolicy";

/// Read-only in-cluster access policy
pub const CLUSTER_VIEW_POLICY_ARN: &str =
    "arn:aws:eks::aws:cluster-access-policy/AmazonEKSViewPolicy";

/// Full administrative in-cluster access policy
pub const CLUSTER_ADMIN_POLICY_ARN: &str =
    "arn:aws:eks::aws:cluster-access-policy/AmazonEKSClusterAdminPolicy";

/// Service principal of the managed Kubernetes control plane
pub const CONTROL_PLANE_SERVICE: &str = "eks.amazonaws.com";

/// Service principal of the function runtime that runs automation
pub const FUNCTION_RUNTIME_SERVICE: &str = "lambda.amazonaws.com";

/// Who may assume a role
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type", content = "value")]
pub enum TrustPrincipal {
    /// A cloud service, e.g. `lambda.amazonaws.com`
    Service(String),
    /// Another account or role ARN
    Arn(String),
}

impl TrustPrincipal {
    pub fn service(name: impl Into<String>) -> Self {
        TrustPrincipal::Service(name.into())
    }
}

impl fmt::Display for TrustPrincipal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrustPrincipal::Service(s) => write!(f, "service:{s}"),
            TrustPrincipal::Arn(a) => write!(f, "{a}"),
        }
    }
}

/// A role known to the provider
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleRef {
    pub name: String,
    pub arn: String,
}

/// Role assumed by the managed control plane itself
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ServiceRole {
    pub role: RoleRef,
}

/// The role automation code runs as
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ExecutionIdentity {
    pub role: RoleRef,
    pub trust: TrustPrincipal,
}

/// What a management-API grant applies to
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type", content = "arn")]
pub enum ResourceScope {
    /// A single cluster, by ARN
    Cluster(String),
    /// Every resource (`*`)
    All,
}

impl ResourceScope {
    pub fn as_resource(&self) -> &str {
        match self {
            ResourceScope::Cluster(arn) => arn,
            ResourceScope::All => "*",
        }
    }

    pub fn covers(&self, cluster: &ClusterHandle) -> bool {
        match self {
            ResourceScope::Cluster(arn) => *arn == cluster.arn,
            ResourceScope::All => true,
        }
    }
}

/// One statement of an inline policy document
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PolicyStatement {
    pub effect: String,
    pub action: Vec<String>,
    pub resource: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PolicyDocument {
    pub version: String,
    pub statement: Vec<PolicyStatement>,
}

impl PolicyDocument {
    pub fn allow(actions: &[String], resource: &ResourceScope) -> Self {
        Self {
            version: "2012-10-17".to_string(),
            statement: vec![PolicyStatement {
                effect: "Allow".to_string(),
                action: actions.to_vec(),
                resource: vec![resource.as_resource().to_string()],
            }],
        }
    }
}

/// Management-API permissions granted to an execution identity
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ManagementApiGrant {
    pub role: RoleRef,
    pub policy_name: String,
    pub actions: Vec<String>,
    pub resource: ResourceScope,
}

impl ManagementApiGrant {
    pub fn allows(&self, action: &str, cluster: &ClusterHandle) -> bool {
        self.resource.covers(cluster)
            && self.actions.iter().any(|a| {
                a == action
                    || a == "*"
                    || a.strip_suffix('*')
                        .is_some_and(|prefix| action.starts_with(prefix))
            })
    }
}

/// In-cluster scope of an access binding
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type", content = "namespaces")]
pub enum AccessScope {
    Cluster,
    Namespaced(Vec<String>),
}

impl AccessScope {
    /// Whether an object in `namespace` (`None` for cluster-scoped kinds) is
    /// reachable under this scope
    pub fn covers(&self, namespace: Option<&str>) -> bool {
        match (self, namespace) {
            (AccessScope::Cluster, _) => true,
            (AccessScope::Namespaced(list), Some(ns)) => list.iter().any(|n| n == ns),
            (AccessScope::Namespaced(_), None) => false,
        }
    }
}

impl fmt::Display for AccessScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessScope::Cluster => f.write_str("cluster"),
            AccessScope::Namespaced(ns) => write!(f, "namespace[{}]", ns.join(",")),
        }
    }
}

/// Principal that an in-cluster access policy is bound to
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ClusterPrincipal {
    pub principal_arn: String,
    pub cluster: ClusterHandle,
}

/// Authorization linking a principal to a scope inside one cluster
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AccessBinding {
    pub principal: ClusterPrincipal,
    pub scope: AccessScope,
    pub policy_arn: String,
    pub(crate) confirmed: bool,
}

impl AccessBinding {
    /// Set once the provider has reported the policy association back
    pub fn is_confirmed(&self) -> bool {
        self.confirmed
    }

    pub fn cluster(&self) -> &ClusterHandle {
        &self.principal.cluster
    }
}

/// An execution identity that holds both a management-API grant and a
/// confirmed in-cluster binding for the same cluster.
#[derive(Clone, Debug)]
pub struct AuthorizedIdentity {
    identity: ExecutionIdentity,
    grant: ManagementApiGrant,
    binding: AccessBinding,
}

impl AuthorizedIdentity {
    /// Management action the executor needs to locate the cluster endpoint
    pub const REQUIRED_ACTION: &'static str = "eks:DescribeCluster";

    pub fn new(
        identity: &ExecutionIdentity,
        grant: &ManagementApiGrant,
        binding: &AccessBinding,
    ) -> Result<Self> {
        if grant.role != identity.role {
            return Err(Error::InvalidScope(format!(
                "management grant belongs to {}, not execution role {}",
                grant.role.arn, identity.role.arn
            )));
        }
        if binding.principal.principal_arn != identity.role.arn {
            return Err(Error::InvalidScope(format!(
                "access binding is for {}, not execution role {}",
                binding.principal.principal_arn, identity.role.arn
            )));
        }
        if !binding.confirmed {
            return Err(Error::InvalidScope(format!(
                "access binding for {} on {} is not confirmed",
                binding.principal.principal_arn, binding.principal.cluster.name
            )));
        }
        if !grant.allows(Self::REQUIRED_ACTION, binding.cluster()) {
            return Err(Error::InvalidScope(format!(
                "grant {} does not allow {} on {}",
                grant.policy_name,
                Self::REQUIRED_ACTION,
                binding.cluster().arn
            )));
        }
        Ok(Self {
            identity: identity.clone(),
            grant: grant.clone(),
            binding: binding.clone(),
        })
    }

    pub fn identity(&self) -> &ExecutionIdentity {
        &self.identity
    }

    pub fn grant(&self) -> &ManagementApiGrant {
        &self.grant
    }

    pub fn binding(&self) -> &AccessBinding {
        &self.binding
    }

    pub fn role_arn(&self) -> &str {
        &self.identity.role.arn
    }
}
