//! Deployment flow
//!
//! Runs one deployment start to finish:
//!
//! 1. service role, then the cluster create and the wait for Active
//! 2. execution identity, management grant and in-cluster binding
//! 3. the post-provision read, retried only on timeout
//! 4. the stack output
//!
//! A failure halts the run with no cleanup. Everything created up to that
//! point stays in [`DeploymentRecord`] so it can be inspected, and
//! [`teardown`] removes it again.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use super::access::AccessBroker;
use super::conditions::{
    mark_false, mark_true, Condition, CONDITION_TYPE_ACCESS_BOUND, CONDITION_TYPE_CLUSTER_READY,
    CONDITION_TYPE_DEGRADED, CONDITION_TYPE_OUTPUT_REPORTED, CONDITION_TYPE_PROGRESSING,
};
use super::executor::{ClusterConnector, PostProvisionExecutor};
use super::provisioning::ProvisioningController;
use super::reporter::{OutputReporter, StackOutput};
use crate::config::DeploymentConfig;
use crate::error::{Error, FailureKind, Result};
use crate::model::{
    AccessBinding, AuthorizedIdentity, ClusterPhase, ClusterState, ExecutionRequest,
    ExecutionResult, ManagementApiGrant, ResourceScope, RoleRef, TrustPrincipal,
};
use crate::provider::CloudProvider;
use crate::retry::calculate_backoff;

const EXECUTION_RETRY_BASE: Duration = Duration::from_secs(2);
const EXECUTION_RETRY_MAX: Duration = Duration::from_secs(30);

/// What a deployment has created and observed so far
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRecord {
    pub service_role: Option<RoleRef>,
    pub cluster: Option<ClusterState>,
    pub execution_role: Option<RoleRef>,
    pub grant: Option<ManagementApiGrant>,
    pub binding: Option<AccessBinding>,
    pub result: Option<ExecutionResult>,
    pub output: Option<StackOutput>,
    pub conditions: Vec<Condition>,
}

/// One deployment, with its own components and record
pub struct Deployment<W: Write> {
    config: DeploymentConfig,
    provisioning: ProvisioningController,
    broker: AccessBroker,
    executor: PostProvisionExecutor,
    reporter: OutputReporter<W>,
    record: DeploymentRecord,
}

impl<W: Write> Deployment<W> {
    pub fn new(
        config: DeploymentConfig,
        provider: Arc<dyn CloudProvider>,
        connector: Arc<dyn ClusterConnector>,
        writer: W,
    ) -> Result<Self> {
        config.validate().map_err(Error::ValidationError)?;

        let provisioning = ProvisioningController::new(provider.clone())
            .with_poll_config(config.poll_config())
            .with_retry(config.provider_retry());
        let broker = AccessBroker::new(provider.clone(), &config.cluster.name)
            .with_retry(config.provider_retry());
        let executor = PostProvisionExecutor::new(provider, connector);
        let reporter = OutputReporter::new(writer, &config.output.key, config.output.format);

        Ok(Self {
            config,
            provisioning,
            broker,
            executor,
            reporter,
            record: DeploymentRecord::default(),
        })
    }

    pub fn record(&self) -> &DeploymentRecord {
        &self.record
    }

    pub fn into_parts(self) -> (DeploymentRecord, W) {
        (self.record, self.reporter.into_inner())
    }

    #[instrument(skip(self, cancel), fields(cluster = %self.config.cluster.name))]
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<StackOutput> {
        mark_true(
            &mut self.record.conditions,
            CONDITION_TYPE_PROGRESSING,
            "Started",
            "Deployment started",
        );

        match self.steps(cancel).await {
            Ok(output) => {
                mark_false(
                    &mut self.record.conditions,
                    CONDITION_TYPE_PROGRESSING,
                    "Complete",
                    "Deployment finished",
                );
                info!(key = %output.key, "Deployment complete");
                Ok(output)
            }
            Err(e) => {
                let reason = e
                    .kind()
                    .map(|k| k.to_string())
                    .unwrap_or_else(|| "Error".to_string());
                mark_false(
                    &mut self.record.conditions,
                    CONDITION_TYPE_PROGRESSING,
                    &reason,
                    "Deployment halted",
                );
                mark_true(
                    &mut self.record.conditions,
                    CONDITION_TYPE_DEGRADED,
                    &reason,
                    &e.to_string(),
                );
                error!(error = %e, "Deployment halted; created resources were left in place");
                Err(e)
            }
        }
    }

    async fn steps(&mut self, cancel: &CancellationToken) -> Result<StackOutput> {
        let cluster = self.provision_cluster(cancel).await?;
        let identity = self.authorize(&cluster).await?;

        let request = self.config.execution_request()?;
        let result = self.execute_with_retry(&cluster, &identity, &request, cancel).await?;
        self.record.result = Some(result.clone());

        let output = self.reporter.report(&result);
        match &output {
            Ok(out) => mark_true(
                &mut self.record.conditions,
                CONDITION_TYPE_OUTPUT_REPORTED,
                "Reported",
                &format!("{} published", out.key),
            ),
            Err(e) => mark_false(
                &mut self.record.conditions,
                CONDITION_TYPE_OUTPUT_REPORTED,
                "ReadFailed",
                &e.to_string(),
            ),
        }
        let output = output?;
        self.record.output = Some(output.clone());
        Ok(output)
    }

    async fn provision_cluster(&mut self, cancel: &CancellationToken) -> Result<ClusterState> {
        let state = match self.submit_cluster().await {
            Ok(state) => state,
            Err(e) => {
                self.cluster_not_ready(&e);
                return Err(e);
            }
        };
        self.record.cluster = Some(state.clone());

        match self.provisioning.await_ready(state, cancel).await {
            Ok(active) => {
                mark_true(
                    &mut self.record.conditions,
                    CONDITION_TYPE_CLUSTER_READY,
                    "Active",
                    &format!("Cluster {} is active", active.name()),
                );
                self.record.cluster = Some(active.clone());
                Ok(active)
            }
            Err(e) => {
                if let (Some(cluster), Error::Rejected(reason)) = (self.record.cluster.as_mut(), &e) {
                    if cluster.transition(ClusterPhase::Failed).is_ok() {
                        cluster.set_status_reason(Some(reason.clone()));
                    }
                }
                self.cluster_not_ready(&e);
                Err(e)
            }
        }
    }

    /// The version is checked before the service role exists, so an
    /// unsupported version leaves nothing behind.
    async fn submit_cluster(&mut self) -> Result<ClusterState> {
        self.provisioning
            .check_version(&self.config.cluster.version)
            .await?;

        let service_role = self.broker.create_cluster_service_role().await?;
        self.record.service_role = Some(service_role.role.clone());

        let spec = self
            .config
            .cluster_spec()
            .with_service_role(&service_role.role.arn);
        self.provisioning.provision(&spec).await
    }

    fn cluster_not_ready(&mut self, e: &Error) {
        let reason = e
            .kind()
            .map(|k| k.to_string())
            .unwrap_or_else(|| "Error".to_string());
        mark_false(
            &mut self.record.conditions,
            CONDITION_TYPE_CLUSTER_READY,
            &reason,
            &e.to_string(),
        );
    }

    async fn authorize(&mut self, cluster: &ClusterState) -> Result<AuthorizedIdentity> {
        let access = self.config.access.clone();

        let identity = self
            .broker
            .create_execution_identity(TrustPrincipal::service(&access.trusted_service))
            .await?;
        self.record.execution_role = Some(identity.role.clone());

        let grant = self
            .broker
            .grant_api_permission(
                &identity,
                &access.management_actions,
                ResourceScope::Cluster(cluster.arn().to_string()),
            )
            .await?;
        self.record.grant = Some(grant.clone());

        let bound = self
            .broker
            .bind_cluster_access(cluster, &identity, access.scope, &access.policy_arn)
            .await;
        let binding = match bound {
            Ok(binding) => binding,
            Err(e) => {
                mark_false(
                    &mut self.record.conditions,
                    CONDITION_TYPE_ACCESS_BOUND,
                    &e.kind().map(|k| k.to_string()).unwrap_or_default(),
                    &e.to_string(),
                );
                return Err(e);
            }
        };
        self.record.binding = Some(binding.clone());
        mark_true(
            &mut self.record.conditions,
            CONDITION_TYPE_ACCESS_BOUND,
            "Confirmed",
            &format!("{} bound with {}", binding.principal.principal_arn, binding.scope),
        );

        AuthorizedIdentity::new(&identity, &grant, &binding)
    }

    /// Reads are idempotent, so a timed-out read is simply tried again
    async fn execute_with_retry(
        &self,
        cluster: &ClusterState,
        identity: &AuthorizedIdentity,
        request: &ExecutionRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        let attempts = self.config.execution.attempts.max(1);
        let mut attempt = 0u32;
        loop {
            let result = self.executor.execute(cluster, identity, request).await;
            attempt += 1;
            if result.failure() != Some(FailureKind::Timeout) || attempt >= attempts {
                return Ok(result);
            }

            let delay = calculate_backoff(attempt - 1, EXECUTION_RETRY_BASE, EXECUTION_RETRY_MAX);
            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Post-provision read timed out, retrying"
            );
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(Error::Cancelled("post-provision read".to_string()))
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// What a teardown removed
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeardownSummary {
    pub cluster_deleted: bool,
    pub revoked_principals: Vec<String>,
    pub deleted_roles: Vec<String>,
}

/// Remove everything a deployment with `config` may have created.
///
/// Resource names are derived from the configuration, so this works
/// without a record of the original run. Access entries are revoked before
/// the cluster is deleted, and roles last.
#[instrument(skip(config, provider), fields(cluster = %config.cluster.name))]
pub async fn teardown(
    config: &DeploymentConfig,
    provider: Arc<dyn CloudProvider>,
) -> Result<TeardownSummary> {
    let provisioning = ProvisioningController::new(provider.clone())
        .with_poll_config(config.poll_config())
        .with_retry(config.provider_retry());
    let broker =
        AccessBroker::new(provider, &config.cluster.name).with_retry(config.provider_retry());
    let mut summary = TeardownSummary::default();

    match provisioning.lookup(&config.cluster.name).await? {
        Some(state) => {
            let principal = config.role_arn(&broker.execution_role_name());
            broker.revoke_principal(state.name(), &principal).await?;
            summary.revoked_principals.push(principal);
            provisioning.teardown(state).await?;
            summary.cluster_deleted = true;
        }
        None => info!("Cluster not found, nothing to delete"),
    }

    for role in [broker.execution_role_name(), broker.service_role_name()] {
        broker.delete_identity(&role).await?;
        summary.deleted_roles.push(role);
    }

    info!(
        cluster_deleted = summary.cluster_deleted,
        roles = summary.deleted_roles.len(),
        "Teardown complete"
    );
    Ok(summary)
}
