//! Access broker
//!
//! Creates the roles a deployment needs and the grants that connect them to
//! the cluster. Each grant is narrow and lives in its own type:
//!
//! - the control-plane service role (`AmazonEKSClusterPolicy` only),
//! - the execution role, trusted by the function runtime,
//! - an inline management-API policy on the execution role,
//! - an in-cluster access entry with one associated access policy.

use std::sync::Arc;

use tracing::{debug, info, instrument};

use crate::error::{Error, Result};
use crate::model::{
    AccessBinding, AccessScope, ClusterPrincipal, ClusterState, ExecutionIdentity,
    ManagementApiGrant, PolicyDocument, ResourceScope, RoleRef, ServiceRole, TrustPrincipal,
    CLUSTER_SERVICE_POLICY_ARN, CONTROL_PLANE_SERVICE,
};
use crate::provider::{CloudProvider, CreateRoleRequest};
use crate::retry::{retry_transient, RetryConfig};

/// Name of the inline policy holding management-API grants
pub const MANAGEMENT_POLICY_NAME: &str = "describe";

pub struct AccessBroker {
    provider: Arc<dyn CloudProvider>,
    retry: RetryConfig,
    name_prefix: String,
}

impl AccessBroker {
    /// `name_prefix` scopes every role this broker creates, so brokers for
    /// different deployments never share a role.
    pub fn new(provider: Arc<dyn CloudProvider>, name_prefix: impl Into<String>) -> Self {
        Self {
            provider,
            retry: RetryConfig::default(),
            name_prefix: name_prefix.into(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn service_role_name(&self) -> String {
        format!("{}-cluster-service", self.name_prefix)
    }

    pub fn execution_role_name(&self) -> String {
        format!("{}-execution", self.name_prefix)
    }

    async fn ensure_role(&self, name: String, trust: TrustPrincipal, description: &str) -> Result<RoleRef> {
        let request = CreateRoleRequest {
            name,
            trust,
            description: description.to_string(),
        };
        retry_transient(&self.retry, "create_role", || self.provider.create_role(&request)).await
    }

    /// Role assumed by the managed control plane
    #[instrument(skip(self), fields(prefix = %self.name_prefix))]
    pub async fn create_cluster_service_role(&self) -> Result<ServiceRole> {
        let role = self
            .ensure_role(
                self.service_role_name(),
                TrustPrincipal::service(CONTROL_PLANE_SERVICE),
                "Assumed by the managed Kubernetes control plane",
            )
            .await?;
        retry_transient(&self.retry, "attach_managed_policy", || {
            self.provider
                .attach_managed_policy(&role.name, CLUSTER_SERVICE_POLICY_ARN)
        })
        .await?;
        info!(role = %role.arn, "Cluster service role ready");
        Ok(ServiceRole { role })
    }

    /// Role that post-provision automation runs as
    #[instrument(skip(self), fields(prefix = %self.name_prefix, trust = %trust))]
    pub async fn create_execution_identity(&self, trust: TrustPrincipal) -> Result<ExecutionIdentity> {
        let role = self
            .ensure_role(
                self.execution_role_name(),
                trust.clone(),
                "Runs post-provision reads against the cluster",
            )
            .await?;
        info!(role = %role.arn, "Execution identity ready");
        Ok(ExecutionIdentity { role, trust })
    }

    /// Allow `actions` on `resource` for the execution role
    #[instrument(skip(self, identity), fields(role = %identity.role.name))]
    pub async fn grant_api_permission(
        &self,
        identity: &ExecutionIdentity,
        actions: &[String],
        resource: ResourceScope,
    ) -> Result<ManagementApiGrant> {
        if actions.is_empty() {
            return Err(Error::InvalidScope(
                "management grant needs at least one action".to_string(),
            ));
        }
        if let Some(bad) = actions.iter().find(|a| !is_valid_action(a)) {
            return Err(Error::InvalidScope(format!(
                "malformed management action '{bad}', expected service:Action"
            )));
        }
        if let ResourceScope::Cluster(arn) = &resource {
            if !arn.starts_with("arn:") {
                return Err(Error::InvalidScope(format!(
                    "management grant resource '{arn}' is not an ARN"
                )));
            }
        }

        let document = PolicyDocument::allow(actions, &resource);
        retry_transient(&self.retry, "put_inline_policy", || {
            self.provider
                .put_inline_policy(&identity.role.name, MANAGEMENT_POLICY_NAME, &document)
        })
        .await?;

        info!(
            actions = %actions.join(","),
            resource = %resource.as_resource(),
            "Management API permission granted"
        );
        Ok(ManagementApiGrant {
            role: identity.role.clone(),
            policy_name: MANAGEMENT_POLICY_NAME.to_string(),
            actions: actions.to_vec(),
            resource,
        })
    }

    /// Bind `identity` to `policy_arn` inside the cluster.
    ///
    /// The returned binding is confirmed: the provider has reported the
    /// policy association back with the requested scope.
    #[instrument(skip(self, cluster, identity), fields(cluster = %cluster.name(), principal = %identity.role.arn, scope = %scope))]
    pub async fn bind_cluster_access(
        &self,
        cluster: &ClusterState,
        identity: &ExecutionIdentity,
        scope: AccessScope,
        policy_arn: &str,
    ) -> Result<AccessBinding> {
        cluster.ensure_active()?;

        if !cluster.access_mode().supports_access_entries() {
            return Err(Error::InvalidScope(format!(
                "cluster {} uses access mode {}, which ignores access entries",
                cluster.name(),
                cluster.access_mode()
            )));
        }
        if let AccessScope::Namespaced(namespaces) = &scope {
            if namespaces.is_empty() || namespaces.iter().any(|n| n.trim().is_empty()) {
                return Err(Error::InvalidScope(
                    "namespaced access scope needs at least one non-empty namespace".to_string(),
                ));
            }
        }

        let known = retry_transient(&self.retry, "list_access_policies", || {
            self.provider.list_access_policies()
        })
        .await?;
        if !known.iter().any(|p| p == policy_arn) {
            return Err(Error::InvalidScope(format!(
                "access policy {policy_arn} is not recognized by the provider"
            )));
        }

        let principal_arn = identity.role.arn.as_str();
        retry_transient(&self.retry, "create_access_entry", || {
            self.provider.create_access_entry(cluster.name(), principal_arn)
        })
        .await?;
        retry_transient(&self.retry, "associate_access_policy", || {
            self.provider
                .associate_access_policy(cluster.name(), principal_arn, policy_arn, &scope)
        })
        .await
        .map_err(|e| match e {
            Error::Rejected(msg) => Error::InvalidScope(msg),
            other => other,
        })?;

        let entry = retry_transient(&self.retry, "describe_access_entry", || {
            self.provider.describe_access_entry(cluster.name(), principal_arn)
        })
        .await?;
        let confirmed = entry
            .policies
            .iter()
            .any(|p| p.policy_arn == policy_arn && p.scope == scope);
        if !confirmed {
            return Err(Error::InvalidScope(format!(
                "provider did not report {policy_arn} with scope {scope} for {principal_arn}"
            )));
        }

        info!(policy = %policy_arn, "Cluster access bound");
        Ok(AccessBinding {
            principal: ClusterPrincipal {
                principal_arn: principal_arn.to_string(),
                cluster: cluster.handle().clone(),
            },
            scope,
            policy_arn: policy_arn.to_string(),
            confirmed,
        })
    }

    pub async fn revoke_cluster_access(&self, binding: &AccessBinding) -> Result<()> {
        self.revoke_principal(&binding.cluster().name, &binding.principal.principal_arn)
            .await
    }

    /// Remove the access entry of `principal_arn`. Already absent is fine.
    #[instrument(skip(self))]
    pub async fn revoke_principal(&self, cluster: &str, principal_arn: &str) -> Result<()> {
        let deleted = retry_transient(&self.retry, "delete_access_entry", || {
            self.provider.delete_access_entry(cluster, principal_arn)
        })
        .await;
        match deleted {
            Ok(()) => {
                info!("Cluster access revoked");
                Ok(())
            }
            Err(Error::NotFound { .. }) => {
                debug!("Access entry already absent");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Delete a role created by this broker. Already absent is fine.
    #[instrument(skip(self))]
    pub async fn delete_identity(&self, role_name: &str) -> Result<()> {
        let deleted = retry_transient(&self.retry, "delete_role", || {
            self.provider.delete_role(role_name)
        })
        .await;
        match deleted {
            Ok(()) => {
                info!("Role deleted");
                Ok(())
            }
            Err(Error::NotFound { .. }) => {
                debug!("Role already absent");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// `service:Action`, optionally ending in `*`, or a bare `*`
fn is_valid_action(action: &str) -> bool {
    if action == "*" {
        return true;
    }
    let Some((service, name)) = action.split_once(':') else {
        return false;
    };
    let name = name.strip_suffix('*').unwrap_or(name);
    !service.is_empty()
        && service
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && name.chars().all(|c| c.is_ascii_alphanumeric())
        && (!name.is_empty() || action.ends_with('*'))
}
