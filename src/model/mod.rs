//! Data model for the provisioning lifecycle
//!
//! Desired state (`ClusterSpec`), observed state (`ClusterState`), the
//! identities and bindings the access broker hands out, and the transient
//! request/result pair of the post-provision executor.

mod cluster;
mod execution;
mod identity;

#[cfg(test)]
mod tests;

pub use cluster::{
    parse_version, AccessMode, ClusterHandle, ClusterPhase, ClusterSpec, ClusterState,
    EndpointAccess, NetworkRef, SpecValidationError, SubnetSelection,
};
pub use execution::{ExecutionRequest, ExecutionResult, ObjectKind};
pub use identity::{
    AccessBinding, AccessScope, AuthorizedIdentity, ClusterPrincipal, ExecutionIdentity,
    ManagementApiGrant, PolicyDocument, PolicyStatement, ResourceScope, RoleRef, ServiceRole,
    TrustPrincipal, CLUSTER_ADMIN_POLICY_ARN, CLUSTER_SERVICE_POLICY_ARN,
    CLUSTER_VIEW_POLICY_ARN, CONTROL_PLANE_SERVICE, FUNCTION_RUNTIME_SERVICE,
};
