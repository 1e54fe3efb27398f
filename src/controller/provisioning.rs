//! Provisioning controller
//!
//! Owns the cluster lifecycle: submits the create, polls the provider until
//! the control plane is Active or Failed, and tears it down again. Every
//! phase change goes through [`ClusterState`]'s checked transitions.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};
use crate::model::{
    ClusterHandle, ClusterPhase, ClusterSpec, ClusterState, SpecValidationError, SubnetSelection,
};
use crate::provider::{CloudProvider, ClusterDescription, CreateClusterRequest, Subnet};
use crate::retry::{calculate_backoff, retry_transient, RetryConfig};

/// Polling bounds for readiness and deletion
#[derive(Clone, Debug)]
pub struct PollConfig {
    /// First polling interval; doubles on each poll
    pub initial_interval: Duration,
    /// Cap on the polling interval
    pub max_interval: Duration,
    /// Overall bound on `await_ready`
    pub ready_timeout: Duration,
    /// Overall bound on waiting for a delete to finish
    pub delete_timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(10),
            max_interval: Duration::from_secs(60),
            ready_timeout: Duration::from_secs(30 * 60),
            delete_timeout: Duration::from_secs(20 * 60),
        }
    }
}

pub struct ProvisioningController {
    provider: Arc<dyn CloudProvider>,
    poll: PollConfig,
    retry: RetryConfig,
}

impl ProvisioningController {
    pub fn new(provider: Arc<dyn CloudProvider>) -> Self {
        Self {
            provider,
            poll: PollConfig::default(),
            retry: RetryConfig::default(),
        }
    }

    pub fn with_poll_config(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Fail with `UnsupportedVersion` unless the provider currently offers
    /// `version`. Creates nothing.
    pub async fn check_version(&self, version: &str) -> Result<()> {
        let supported = retry_transient(&self.retry, "supported_versions", || {
            self.provider.supported_versions()
        })
        .await?;
        if supported.iter().any(|v| v == version) {
            return Ok(());
        }
        Err(Error::UnsupportedVersion {
            requested: version.to_string(),
            supported,
        })
    }

    /// Submit the create for `spec` and return the cluster in Creating.
    ///
    /// Fails before any create call when `spec` is invalid, the version is
    /// not offered, or the subnet rule selects nothing.
    #[instrument(skip(self, spec), fields(cluster = %spec.name, version = %spec.version))]
    pub async fn provision(&self, spec: &ClusterSpec) -> Result<ClusterState> {
        spec.validate().map_err(Error::ValidationError)?;
        let role_arn = spec.service_role_arn.clone().ok_or_else(|| {
            Error::ValidationError(vec![SpecValidationError::new(
                "spec.serviceRoleArn",
                "a control-plane service role is required to create the cluster",
                "Create the service role first and pass its ARN.",
            )])
        })?;

        self.check_version(&spec.version).await?;

        let available = retry_transient(&self.retry, "list_subnets", || {
            self.provider.list_subnets(&spec.network.vpc_id)
        })
        .await?;
        let subnet_ids = resolve_subnets(&spec.subnets, &available, &spec.network.vpc_id)?;
        debug!(subnets = ?subnet_ids, "Resolved subnets");

        let request = CreateClusterRequest {
            name: spec.name.clone(),
            version: spec.version.clone(),
            role_arn,
            subnet_ids,
            endpoint_public_access: spec.endpoint_access.public,
            endpoint_private_access: spec.endpoint_access.private,
            authentication_mode: spec.access_mode,
            bootstrap_cluster_creator_admin_permissions: false,
            client_request_token: new_request_token(),
            tags: spec.tags.clone(),
        };

        let mut state = ClusterState::pending(spec, String::new());
        let created = retry_transient(&self.retry, "create_cluster", || {
            self.provider.create_cluster(&request)
        })
        .await?;
        state.set_arn(created.arn);
        state.transition(ClusterPhase::Creating)?;

        info!(arn = %state.arn(), "Cluster create submitted");
        Ok(state)
    }

    /// Poll until the cluster is Active.
    ///
    /// Returns `Rejected` if the provider reports the cluster Failed or the
    /// cluster is deleted out from under the wait, `Timeout` once `ready_timeout` has elapsed and `Cancelled` when
    /// `cancel` fires. Never runs past the timeout by more than one poll.
    #[instrument(skip(self, state, cancel), fields(cluster = %state.name()))]
    pub async fn await_ready(
        &self,
        mut state: ClusterState,
        cancel: &CancellationToken,
    ) -> Result<ClusterState> {
        let started = Instant::now();
        let deadline = started + self.poll.ready_timeout;
        let mut attempt = 0u32;

        loop {
            let described = tokio::select! {
                _ = cancel.cancelled() => return Err(cancelled(&state)),
                res = tokio::time::timeout_at(deadline, self.describe(state.name())) => res,
            };
            let desc = match described {
                Ok(Ok(desc)) => desc,
                Ok(Err(Error::NotFound { .. })) => return Err(deleted_while_waiting(&state)),
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(ready_timeout(&state, started)),
            };
            if matches!(
                desc.status.phase(),
                ClusterPhase::Deleting | ClusterPhase::Deleted
            ) {
                return Err(deleted_while_waiting(&state));
            }

            observe(&mut state, &desc)?;
            match state.phase() {
                ClusterPhase::Active => {
                    info!(
                        endpoint = state.endpoint().unwrap_or_default(),
                        elapsed_s = started.elapsed().as_secs(),
                        "Cluster is active"
                    );
                    return Ok(state);
                }
                ClusterPhase::Failed => {
                    let reason = state
                        .status_reason()
                        .unwrap_or("provider reported FAILED")
                        .to_string();
                    warn!(%reason, "Cluster creation failed");
                    return Err(Error::Rejected(format!(
                        "cluster {} failed: {reason}",
                        state.name()
                    )));
                }
                phase => debug!(%phase, attempt, "Cluster not ready yet"),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ready_timeout(&state, started));
            }
            let delay = calculate_backoff(attempt, self.poll.initial_interval, self.poll.max_interval)
                .min(deadline - now);
            attempt += 1;

            tokio::select! {
                _ = cancel.cancelled() => return Err(cancelled(&state)),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Delete the cluster and wait until the provider no longer reports it
    #[instrument(skip(self, state), fields(cluster = %state.name(), phase = %state.phase()))]
    pub async fn teardown(&self, mut state: ClusterState) -> Result<ClusterState> {
        if state.phase() == ClusterPhase::Deleted {
            return Ok(state);
        }
        state.transition(ClusterPhase::Deleting)?;

        let deleted = retry_transient(&self.retry, "delete_cluster", || {
            self.provider.delete_cluster(state.name())
        })
        .await;
        match deleted {
            Ok(()) => {}
            Err(Error::NotFound { .. }) => {
                state.transition(ClusterPhase::Deleted)?;
                return Ok(state);
            }
            Err(e) => return Err(e),
        }

        let started = Instant::now();
        let deadline = started + self.poll.delete_timeout;
        let mut attempt = 0u32;
        loop {
            match tokio::time::timeout_at(deadline, self.describe(state.name())).await {
                Err(_) => break,
                Ok(Err(Error::NotFound { .. })) => {
                    state.transition(ClusterPhase::Deleted)?;
                    info!(elapsed_s = started.elapsed().as_secs(), "Cluster deleted");
                    return Ok(state);
                }
                Ok(Err(e)) => return Err(e),
                Ok(Ok(desc)) => debug!(status = ?desc.status, "Cluster still deleting"),
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let delay = calculate_backoff(attempt, self.poll.initial_interval, self.poll.max_interval)
                .min(deadline - now);
            attempt += 1;
            tokio::time::sleep(delay).await;
        }

        Err(Error::timeout(
            format!("cluster {} to be deleted", state.name()),
            started.elapsed(),
        ))
    }

    /// Current state of an existing cluster, or `None` if there is none
    pub async fn lookup(&self, name: &str) -> Result<Option<ClusterState>> {
        let desc = match self.describe(name).await {
            Ok(desc) => desc,
            Err(Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        let mut state = ClusterState::observed(
            ClusterHandle {
                name: desc.name.clone(),
                arn: desc.arn.clone(),
            },
            desc.status.phase(),
            desc.version.clone(),
            desc.authentication_mode,
        );
        state.set_connection(desc.endpoint, desc.certificate_authority_data);
        Ok(Some(state))
    }

    async fn describe(&self, name: &str) -> Result<ClusterDescription> {
        retry_transient(&self.retry, "describe_cluster", || {
            self.provider.describe_cluster(name)
        })
        .await
    }
}

/// Fold a provider description into the observed state
fn observe(state: &mut ClusterState, desc: &ClusterDescription) -> Result<()> {
    let phase = desc.status.phase();
    // A freshly accepted create may still be reported as pending
    if phase == ClusterPhase::Pending {
        return Ok(());
    }
    state.transition(phase)?;
    match phase {
        ClusterPhase::Active => {
            state.set_connection(
                desc.endpoint.clone(),
                desc.certificate_authority_data.clone(),
            );
        }
        ClusterPhase::Failed => {
            let reason = (!desc.health_issues.is_empty()).then(|| desc.health_issues.join("; "));
            state.set_status_reason(reason);
        }
        _ => {}
    }
    Ok(())
}

fn ready_timeout(state: &ClusterState, started: Instant) -> Error {
    warn!(cluster = %state.name(), phase = %state.phase(), "Timed out waiting for cluster");
    Error::timeout(
        format!("cluster {} to become active", state.name()),
        started.elapsed(),
    )
}

fn deleted_while_waiting(state: &ClusterState) -> Error {
    warn!(cluster = %state.name(), "Cluster deleted while waiting for it to become active");
    Error::Rejected(format!("cluster {} deleted during creation", state.name()))
}

fn cancelled(state: &ClusterState) -> Error {
    info!(cluster = %state.name(), "Wait for cluster cancelled");
    Error::Cancelled(format!("waiting for cluster {}", state.name()))
}

/// Apply the selection rule to the subnets of `vpc_id`
pub fn resolve_subnets(
    selection: &SubnetSelection,
    available: &[Subnet],
    vpc_id: &str,
) -> Result<Vec<String>> {
    let ids: Vec<String> = match selection {
        SubnetSelection::Public => available
            .iter()
            .filter(|s| s.public)
            .map(|s| s.id.clone())
            .collect(),
        SubnetSelection::Private => available
            .iter()
            .filter(|s| !s.public)
            .map(|s| s.id.clone())
            .collect(),
        SubnetSelection::Explicit(wanted) => {
            let missing: Vec<&str> = wanted
                .iter()
                .filter(|id| !available.iter().any(|s| &s.id == *id))
                .map(String::as_str)
                .collect();
            if !missing.is_empty() {
                return Err(Error::ValidationError(vec![SpecValidationError::new(
                    "spec.subnets.ids",
                    format!("subnets {} are not in {vpc_id}", missing.join(", ")),
                    "List subnets that belong to the cluster VPC.",
                )]));
            }
            wanted.clone()
        }
    };

    if ids.is_empty() {
        return Err(Error::ValidationError(vec![SpecValidationError::new(
            "spec.subnets",
            format!("subnet selection {selection:?} matched no subnets in {vpc_id}"),
            "Pick a selection rule that matches subnets in the VPC, or list subnet ids.",
        )]));
    }
    Ok(ids)
}

/// Idempotency token for one create, reused across its retries
fn new_request_token() -> String {
    format!("{:032x}", rand::thread_rng().gen::<u128>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::test_support::role;
    use crate::provider::SimulatedProvider;

    fn poll() -> PollConfig {
        PollConfig {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(8),
            ready_timeout: Duration::from_secs(60),
            delete_timeout: Duration::from_secs(60),
        }
    }

    fn controller(provider: &SimulatedProvider) -> ProvisioningController {
        ProvisioningController::new(Arc::new(provider.clone()))
            .with_poll_config(poll())
            .with_retry(RetryConfig {
                max_attempts: 4,
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(100),
                backoff_multiplier: 2.0,
            })
    }

    async fn spec(provider: &SimulatedProvider, name: &str) -> ClusterSpec {
        let svc = role(provider, &format!("{name}-svc"), "eks.amazonaws.com").await;
        ClusterSpec::new(name, "vpc-0abc", "1.28").with_service_role(svc.arn)
    }

    #[tokio::test(start_paused = true)]
    async fn test_provision_and_await_ready() {
        let provider = SimulatedProvider::new().with_creation_latency(3);
        let controller = controller(&provider);
        let spec = spec(&provider, "demo").await;

        let state = controller.provision(&spec).await.unwrap();
        assert_eq!(state.phase(), ClusterPhase::Creating);
        assert!(state.arn().ends_with(":cluster/demo"));

        let state = controller
            .await_ready(state, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(state.phase(), ClusterPhase::Active);
        assert!(state.endpoint().is_some());
        assert!(state.certificate_authority().is_some());
        assert_eq!(provider.calls_to("create_cluster").await, 1);
        assert_eq!(provider.calls_to("describe_cluster").await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsupported_version_issues_no_create() {
        let provider = SimulatedProvider::new().with_supported_versions(&["1.29", "1.30"]);
        let controller = controller(&provider);
        let spec = spec(&provider, "demo").await;

        let err = controller.provision(&spec).await.unwrap_err();
        match err {
            Error::UnsupportedVersion {
                requested,
                supported,
            } => {
                assert_eq!(requested, "1.28");
                assert_eq!(supported, vec!["1.29", "1.30"]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(provider.calls_to("create_cluster").await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_ready_times_out_within_one_interval() {
        let provider = SimulatedProvider::new().with_creation_latency(u32::MAX);
        let controller = controller(&provider);
        let spec = spec(&provider, "demo").await;
        let state = controller.provision(&spec).await.unwrap();

        let started = Instant::now();
        let err = controller
            .await_ready(state, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Timeout { .. }));
        let elapsed = started.elapsed();
        assert!(elapsed >= poll().ready_timeout);
        assert!(elapsed <= poll().ready_timeout + poll().max_interval);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_cluster_is_rejected_not_timeout() {
        let provider = SimulatedProvider::new().with_creation_latency(2);
        provider
            .fail_creates("InsufficientCapacity: no capacity in zone")
            .await;
        let controller = controller(&provider);
        let spec = spec(&provider, "demo").await;
        let state = controller.provision(&spec).await.unwrap();

        let err = controller
            .await_ready(state, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Rejected(ref m) if m.contains("InsufficientCapacity")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cluster_deleted_mid_create_is_rejected() {
        let provider = SimulatedProvider::new().with_creation_latency(u32::MAX);
        let controller = controller(&provider);
        let spec = spec(&provider, "demo").await;
        let state = controller.provision(&spec).await.unwrap();

        provider.delete_cluster("demo").await.unwrap();

        let err = controller
            .await_ready(state, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), Some(crate::error::FailureKind::Rejected));
        assert!(err.to_string().contains("deleted during creation"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_version_creates_nothing() {
        let provider = SimulatedProvider::new().with_supported_versions(&["1.29"]);
        let controller = controller(&provider);

        assert!(controller.check_version("1.29").await.is_ok());
        let err = controller.check_version("1.28").await.unwrap_err();
        assert_eq!(err.kind(), Some(crate::error::FailureKind::UnsupportedVersion));
        assert_eq!(provider.calls_to("supported_versions").await, 2);
        assert!(provider
            .calls()
            .await
            .iter()
            .all(|c| c.method == "supported_versions"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_ready_is_cancellable() {
        let provider = SimulatedProvider::new().with_creation_latency(u32::MAX);
        let controller = controller(&provider);
        let spec = spec(&provider, "demo").await;
        let state = controller.provision(&spec).await.unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = controller.await_ready(state, &cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
        assert!(started.elapsed() < poll().ready_timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_retry_reuses_request_token() {
        let provider = SimulatedProvider::new().with_creation_latency(1);
        provider.lose_create_responses(1).await;
        let controller = controller(&provider);
        let spec = spec(&provider, "demo").await;

        // A second create with a fresh token would be refused as a duplicate
        let state = controller.provision(&spec).await.unwrap();
        assert_eq!(state.phase(), ClusterPhase::Creating);
        assert_eq!(provider.calls_to("create_cluster").await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_rejection_is_not_retried() {
        let provider = SimulatedProvider::new();
        provider
            .reject_creates("InvalidParameterException: role cannot be assumed")
            .await;
        let controller = controller(&provider);
        let spec = spec(&provider, "demo").await;

        let err = controller.provision(&spec).await.unwrap_err();
        assert!(matches!(err, Error::Rejected(_)));
        assert_eq!(provider.calls_to("create_cluster").await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_subnet_selection_fails_before_create() {
        let provider = SimulatedProvider::new().with_subnets(vec![Subnet {
            id: "subnet-priv-a".into(),
            availability_zone: "local-1a".into(),
            public: false,
        }]);
        let controller = controller(&provider);
        let spec = spec(&provider, "demo").await;

        let err = controller.provision(&spec).await.unwrap_err();
        assert!(matches!(err, Error::ValidationError(ref e) if e[0].field == "spec.subnets"));
        assert_eq!(provider.calls_to("create_cluster").await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_waits_for_deletion() {
        let provider = SimulatedProvider::new().with_creation_latency(1);
        let controller = controller(&provider);
        let spec = spec(&provider, "demo").await;
        let state = controller.provision(&spec).await.unwrap();
        let state = controller
            .await_ready(state, &CancellationToken::new())
            .await
            .unwrap();

        let state = controller.teardown(state).await.unwrap();
        assert_eq!(state.phase(), ClusterPhase::Deleted);
        assert!(!provider.cluster_exists("demo").await);
        assert!(controller.lookup("demo").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_rejects_creating_cluster() {
        let provider = SimulatedProvider::new().with_creation_latency(u32::MAX);
        let controller = controller(&provider);
        let spec = spec(&provider, "demo").await;
        let state = controller.provision(&spec).await.unwrap();

        let err = controller.teardown(state).await.unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                from: ClusterPhase::Creating,
                to: ClusterPhase::Deleting,
                ..
            }
        ));
        assert_eq!(provider.calls_to("delete_cluster").await, 0);
    }

    #[test]
    fn test_resolve_subnets() {
        let available = vec![
            Subnet {
                id: "subnet-1".into(),
                availability_zone: "az-a".into(),
                public: true,
            },
            Subnet {
                id: "subnet-2".into(),
                availability_zone: "az-b".into(),
                public: false,
            },
        ];
        assert_eq!(
            resolve_subnets(&SubnetSelection::Public, &available, "vpc").unwrap(),
            vec!["subnet-1"]
        );
        assert_eq!(
            resolve_subnets(&SubnetSelection::Private, &available, "vpc").unwrap(),
            vec!["subnet-2"]
        );
        assert!(matches!(
            resolve_subnets(
                &SubnetSelection::Explicit(vec!["subnet-9".into()]),
                &available,
                "vpc"
            ),
            Err(Error::ValidationError(_))
        ));
    }

    #[test]
    fn test_request_tokens_are_unique() {
        assert_ne!(new_request_token(), new_request_token());
        assert_eq!(new_request_token().len(), 32);
    }
}
