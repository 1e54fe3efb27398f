//! In-memory provider
//!
//! Behaves like a slow, eventually consistent control plane: clusters sit in
//! CREATING for a configurable number of describe calls before turning
//! ACTIVE, deletes take a few describes to disappear, and failures can be
//! injected per call. Every call is recorded for later inspection.
//!
//! [`SimulatedCluster`] exposes the objects of the clusters this provider
//! created and enforces the access entries bound to them, so the executor
//! can run against it end to end.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::debug;

use super::{
    AccessEntryDescription, AssociatedPolicy, CloudProvider, ClusterDescription, ClusterToken,
    CreateClusterRequest, CreateRoleRequest, ProviderClusterStatus, Subnet,
};
use crate::controller::executor::{ClusterConnection, ClusterConnector};
use crate::error::{Error, Result};
use crate::model::{
    AccessScope, ClusterState, ObjectKind, PolicyDocument, RoleRef, TrustPrincipal,
    CLUSTER_ADMIN_POLICY_ARN, CLUSTER_VIEW_POLICY_ARN,
};

const DEFAULT_ACCOUNT: &str = "000000000000";
const DEFAULT_REGION: &str = "local-1";
const TOKEN_PREFIX: &str = "k8s-sim-v1.";

/// One recorded provider call
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderCall {
    pub method: &'static str,
    pub target: String,
}

#[derive(Debug)]
struct SimCluster {
    description: ClusterDescription,
    request_token: String,
    describes_until_settled: u32,
    failure_reason: Option<String>,
    access_entries: BTreeMap<String, Vec<AssociatedPolicy>>,
    objects: BTreeMap<(ObjectKind, Option<String>, String), Value>,
}

#[derive(Debug)]
struct SimRole {
    role: RoleRef,
    trust: TrustPrincipal,
    managed_policies: Vec<String>,
    inline_policies: BTreeMap<String, PolicyDocument>,
}

#[derive(Debug, Default)]
struct Inner {
    clusters: HashMap<String, SimCluster>,
    roles: HashMap<String, SimRole>,
    calls: Vec<ProviderCall>,
    throttle_remaining: u32,
    reject_creates: Option<String>,
    fail_creates: Option<String>,
    lost_create_responses: u32,
}

/// In-memory [`CloudProvider`]
#[derive(Clone)]
pub struct SimulatedProvider {
    inner: Arc<Mutex<Inner>>,
    account: String,
    region: String,
    supported_versions: Vec<String>,
    subnets: Vec<Subnet>,
    access_policies: Vec<String>,
    describes_until_active: u32,
    describes_until_deleted: u32,
    read_delay: Duration,
    open_connections: Arc<AtomicUsize>,
}

impl Default for SimulatedProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedProvider {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            account: DEFAULT_ACCOUNT.to_string(),
            region: DEFAULT_REGION.to_string(),
            supported_versions: ["1.27", "1.28", "1.29", "1.30"]
                .iter()
                .map(|v| v.to_string())
                .collect(),
            subnets: vec![
                subnet("subnet-pub-a", "a", true),
                subnet("subnet-pub-b", "b", true),
                subnet("subnet-priv-a", "a", false),
                subnet("subnet-priv-b", "b", false),
            ],
            access_policies: vec![
                CLUSTER_VIEW_POLICY_ARN.to_string(),
                "arn:aws:eks::aws:cluster-access-policy/AmazonEKSEditPolicy".to_string(),
                "arn:aws:eks::aws:cluster-access-policy/AmazonEKSAdminPolicy".to_string(),
                CLUSTER_ADMIN_POLICY_ARN.to_string(),
            ],
            describes_until_active: 3,
            describes_until_deleted: 2,
            read_delay: Duration::ZERO,
            open_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_identity(mut self, account: impl Into<String>, region: impl Into<String>) -> Self {
        self.account = account.into();
        self.region = region.into();
        self
    }

    pub fn with_supported_versions(mut self, versions: &[&str]) -> Self {
        self.supported_versions = versions.iter().map(|v| v.to_string()).collect();
        self
    }

    pub fn with_subnets(mut self, subnets: Vec<Subnet>) -> Self {
        self.subnets = subnets;
        self
    }

    /// Number of describe calls a new cluster spends in CREATING.
    /// `u32::MAX` keeps it there forever.
    pub fn with_creation_latency(mut self, describes: u32) -> Self {
        self.describes_until_active = describes;
        self
    }

    /// Delay applied to every object read through [`SimulatedCluster`]
    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = delay;
        self
    }

    /// Fail the next `n` calls with `Throttled`
    pub async fn throttle_next(&self, n: u32) {
        self.inner.lock().await.throttle_remaining = n;
    }

    /// Refuse cluster creation outright
    pub async fn reject_creates(&self, reason: impl Into<String>) {
        self.inner.lock().await.reject_creates = Some(reason.into());
    }

    /// Accept cluster creation, then fail it asynchronously
    pub async fn fail_creates(&self, reason: impl Into<String>) {
        self.inner.lock().await.fail_creates = Some(reason.into());
    }

    /// Accept the next `n` cluster creates but answer them with
    /// `ProviderUnavailable`, as if the response was lost in transit
    pub async fn lose_create_responses(&self, n: u32) {
        self.inner.lock().await.lost_create_responses = n;
    }

    /// Recorded calls, oldest first
    pub async fn calls(&self) -> Vec<ProviderCall> {
        self.inner.lock().await.calls.clone()
    }

    pub async fn calls_to(&self, method: &str) -> usize {
        self.inner
            .lock()
            .await
            .calls
            .iter()
            .filter(|c| c.method == method)
            .count()
    }

    pub async fn cluster_exists(&self, name: &str) -> bool {
        self.inner.lock().await.clusters.contains_key(name)
    }

    pub async fn role_exists(&self, name: &str) -> bool {
        self.inner.lock().await.roles.contains_key(name)
    }

    pub async fn role_inline_policy(&self, role: &str, policy: &str) -> Option<PolicyDocument> {
        self.inner
            .lock()
            .await
            .roles
            .get(role)
            .and_then(|r| r.inline_policies.get(policy).cloned())
    }

    pub async fn role_managed_policies(&self, role: &str) -> Vec<String> {
        self.inner
            .lock()
            .await
            .roles
            .get(role)
            .map(|r| r.managed_policies.clone())
            .unwrap_or_default()
    }

    pub async fn role_trust(&self, role: &str) -> Option<TrustPrincipal> {
        self.inner
            .lock()
            .await
            .roles
            .get(role)
            .map(|r| r.trust.clone())
    }

    /// Replace or insert an object in a cluster's store
    pub async fn put_object(
        &self,
        cluster: &str,
        kind: ObjectKind,
        namespace: Option<&str>,
        object: Value,
    ) -> Result<()> {
        let name = object["metadata"]["name"]
            .as_str()
            .ok_or_else(|| Error::ConfigError("object has no metadata.name".into()))?
            .to_string();
        let mut inner = self.inner.lock().await;
        let sim = inner
            .clusters
            .get_mut(cluster)
            .ok_or_else(|| Error::not_found("Cluster", cluster))?;
        sim.objects
            .insert((kind, namespace.map(str::to_string), name), object);
        Ok(())
    }

    /// Connector for the clusters of this provider
    pub fn cluster_connector(&self) -> SimulatedCluster {
        SimulatedCluster {
            provider: self.clone(),
        }
    }

    /// Connections opened through [`SimulatedCluster`] and not yet released
    pub fn open_connections(&self) -> usize {
        self.open_connections.load(Ordering::SeqCst)
    }

    fn cluster_arn(&self, name: &str) -> String {
        format!(
            "arn:aws:eks:{}:{}:cluster/{}",
            self.region, self.account, name
        )
    }

    fn role_arn(&self, name: &str) -> String {
        format!("arn:aws:iam::{}:role/{}", self.account, name)
    }

    /// Record the call and hand back the locked state
    async fn enter(&self, method: &'static str, target: &str) -> tokio::sync::MutexGuard<'_, Inner> {
        let mut inner = self.inner.lock().await;
        inner.calls.push(ProviderCall {
            method,
            target: target.to_string(),
        });
        inner
    }
}

fn subnet(id: &str, zone: &str, public: bool) -> Subnet {
    Subnet {
        id: id.to_string(),
        availability_zone: format!("{DEFAULT_REGION}{zone}"),
        public,
    }
}

fn throttled(inner: &mut Inner, method: &str) -> Result<()> {
    if inner.throttle_remaining > 0 {
        inner.throttle_remaining -= 1;
        debug!(method, "Simulated throttle");
        return Err(Error::Throttled(format!("{method}: rate exceeded")));
    }
    Ok(())
}

fn seed_objects(cluster: &str) -> BTreeMap<(ObjectKind, Option<String>, String), Value> {
    let mut objects = BTreeMap::new();
    for ns in ["default", "kube-system", "kube-public"] {
        objects.insert(
            (ObjectKind::Namespace, None, ns.to_string()),
            json!({
                "apiVersion": "v1",
                "kind": "Namespace",
                "metadata": { "name": ns, "uid": new_uid() },
                "status": { "phase": "Active" }
            }),
        );
        objects.insert(
            (
                ObjectKind::ConfigMap,
                Some(ns.to_string()),
                "kube-root-ca.crt".to_string(),
            ),
            json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {
                    "name": "kube-root-ca.crt",
                    "namespace": ns,
                    "uid": new_uid(),
                    "annotations": { "kubernetes.io/description": format!("CA bundle of {cluster}") }
                },
                "data": { "ca.crt": "-----BEGIN CERTIFICATE-----\nsimulated\n-----END CERTIFICATE-----\n" }
            }),
        );
    }
    objects
}

fn new_uid() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 16] = rng.gen();
    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

#[async_trait]
impl CloudProvider for SimulatedProvider {
    async fn supported_versions(&self) -> Result<Vec<String>> {
        let mut inner = self.enter("supported_versions", "").await;
        throttled(&mut inner, "supported_versions")?;
        Ok(self.supported_versions.clone())
    }

    async fn list_subnets(&self, vpc_id: &str) -> Result<Vec<Subnet>> {
        let mut inner = self.enter("list_subnets", vpc_id).await;
        throttled(&mut inner, "list_subnets")?;
        Ok(self.subnets.clone())
    }

    async fn create_cluster(&self, request: &CreateClusterRequest) -> Result<ClusterDescription> {
        let mut inner = self.enter("create_cluster", &request.name).await;
        throttled(&mut inner, "create_cluster")?;

        if let Some(existing) = inner.clusters.get(&request.name) {
            if existing.request_token == request.client_request_token {
                return Ok(existing.description.clone());
            }
            return Err(Error::Rejected(format!(
                "ResourceInUseException: cluster {} already exists",
                request.name
            )));
        }
        if let Some(reason) = &inner.reject_creates {
            return Err(Error::Rejected(reason.clone()));
        }
        if !self.supported_versions.contains(&request.version) {
            return Err(Error::Rejected(format!(
                "InvalidParameterException: unsupported Kubernetes version {}",
                request.version
            )));
        }
        let role_known = inner.roles.values().any(|r| r.role.arn == request.role_arn);
        if !role_known {
            return Err(Error::Rejected(format!(
                "InvalidParameterException: role {} does not exist",
                request.role_arn
            )));
        }

        let mut failure_reason = inner.fail_creates.clone();
        let zones: std::collections::BTreeSet<_> = self
            .subnets
            .iter()
            .filter(|s| request.subnet_ids.contains(&s.id))
            .map(|s| s.availability_zone.as_str())
            .collect();
        if failure_reason.is_none() && zones.len() < 2 {
            failure_reason = Some(
                "UnsupportedAvailabilityZoneException: subnets must span at least two availability zones"
                    .to_string(),
            );
        }

        let description = ClusterDescription {
            name: request.name.clone(),
            arn: self.cluster_arn(&request.name),
            status: ProviderClusterStatus::Creating,
            version: request.version.clone(),
            endpoint: None,
            certificate_authority_data: None,
            authentication_mode: request.authentication_mode,
            health_issues: Vec::new(),
        };
        inner.clusters.insert(
            request.name.clone(),
            SimCluster {
                description: description.clone(),
                request_token: request.client_request_token.clone(),
                describes_until_settled: self.describes_until_active,
                failure_reason,
                access_entries: BTreeMap::new(),
                objects: seed_objects(&request.name),
            },
        );
        if inner.lost_create_responses > 0 {
            inner.lost_create_responses -= 1;
            return Err(Error::ProviderUnavailable(
                "create_cluster: connection reset by peer".to_string(),
            ));
        }
        Ok(description)
    }

    async fn describe_cluster(&self, name: &str) -> Result<ClusterDescription> {
        let mut inner = self.enter("describe_cluster", name).await;
        throttled(&mut inner, "describe_cluster")?;

        let sim = inner
            .clusters
            .get_mut(name)
            .ok_or_else(|| Error::not_found("Cluster", name))?;

        if sim.describes_until_settled > 0 && sim.describes_until_settled != u32::MAX {
            sim.describes_until_settled -= 1;
        }
        if sim.describes_until_settled == 0 {
            let status = sim.description.status;
            match status {
                ProviderClusterStatus::Creating => match &sim.failure_reason {
                    Some(reason) => {
                        sim.description.status = ProviderClusterStatus::Failed;
                        sim.description.health_issues = vec![reason.clone()];
                    }
                    None => {
                        sim.description.status = ProviderClusterStatus::Active;
                        sim.description.endpoint =
                            Some(format!("https://{name}.{}.sim.local", self.region));
                        sim.description.certificate_authority_data =
                            Some("LS0tLS1CRUdJTiBDRVJUSUZJQ0FURS0tLS0t".to_string());
                    }
                },
                ProviderClusterStatus::Deleting => {
                    inner.clusters.remove(name);
                    return Err(Error::not_found("Cluster", name));
                }
                _ => {}
            }
        }
        Ok(sim.description.clone())
    }

    async fn delete_cluster(&self, name: &str) -> Result<()> {
        let mut inner = self.enter("delete_cluster", name).await;
        throttled(&mut inner, "delete_cluster")?;

        let sim = inner
            .clusters
            .get_mut(name)
            .ok_or_else(|| Error::not_found("Cluster", name))?;
        if !sim.access_entries.is_empty() {
            debug!(cluster = name, "Deleting cluster with access entries still present");
        }
        sim.description.status = ProviderClusterStatus::Deleting;
        sim.describes_until_settled = self.describes_until_deleted;
        Ok(())
    }

    async fn create_role(&self, request: &CreateRoleRequest) -> Result<RoleRef> {
        let mut inner = self.enter("create_role", &request.name).await;
        throttled(&mut inner, "create_role")?;

        if let Some(existing) = inner.roles.get(&request.name) {
            if existing.trust != request.trust {
                return Err(Error::Rejected(format!(
                    "EntityAlreadyExists: role {} exists with a different trust policy",
                    request.name
                )));
            }
            return Ok(existing.role.clone());
        }
        let role = RoleRef {
            name: request.name.clone(),
            arn: self.role_arn(&request.name),
        };
        inner.roles.insert(
            request.name.clone(),
            SimRole {
                role: role.clone(),
                trust: request.trust.clone(),
                managed_policies: Vec::new(),
                inline_policies: BTreeMap::new(),
            },
        );
        Ok(role)
    }

    async fn delete_role(&self, name: &str) -> Result<()> {
        let mut inner = self.enter("delete_role", name).await;
        throttled(&mut inner, "delete_role")?;
        inner
            .roles
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("Role", name))
    }

    async fn attach_managed_policy(&self, role_name: &str, policy_arn: &str) -> Result<()> {
        let mut inner = self.enter("attach_managed_policy", role_name).await;
        throttled(&mut inner, "attach_managed_policy")?;
        let role = inner
            .roles
            .get_mut(role_name)
            .ok_or_else(|| Error::not_found("Role", role_name))?;
        if !role.managed_policies.iter().any(|p| p == policy_arn) {
            role.managed_policies.push(policy_arn.to_string());
        }
        Ok(())
    }

    async fn put_inline_policy(
        &self,
        role_name: &str,
        policy_name: &str,
        document: &PolicyDocument,
    ) -> Result<()> {
        let mut inner = self.enter("put_inline_policy", role_name).await;
        throttled(&mut inner, "put_inline_policy")?;
        let role = inner
            .roles
            .get_mut(role_name)
            .ok_or_else(|| Error::not_found("Role", role_name))?;
        role.inline_policies
            .insert(policy_name.to_string(), document.clone());
        Ok(())
    }

    async fn list_access_policies(&self) -> Result<Vec<String>> {
        let mut inner = self.enter("list_access_policies", "").await;
        throttled(&mut inner, "list_access_policies")?;
        Ok(self.access_policies.clone())
    }

    async fn create_access_entry(&self, cluster: &str, principal_arn: &str) -> Result<()> {
        let mut inner = self.enter("create_access_entry", principal_arn).await;
        throttled(&mut inner, "create_access_entry")?;
        let sim = inner
            .clusters
            .get_mut(cluster)
            .ok_or_else(|| Error::not_found("Cluster", cluster))?;
        if sim.description.status != ProviderClusterStatus::Active {
            return Err(Error::Rejected(format!(
                "ResourceNotReady: cluster {cluster} is not active"
            )));
        }
        sim.access_entries
            .entry(principal_arn.to_string())
            .or_default();
        Ok(())
    }

    async fn associate_access_policy(
        &self,
        cluster: &str,
        principal_arn: &str,
        policy_arn: &str,
        scope: &AccessScope,
    ) -> Result<()> {
        let mut inner = self.enter("associate_access_policy", principal_arn).await;
        throttled(&mut inner, "associate_access_policy")?;
        if !self.access_policies.iter().any(|p| p == policy_arn) {
            return Err(Error::Rejected(format!(
                "InvalidParameterException: unknown access policy {policy_arn}"
            )));
        }
        let sim = inner
            .clusters
            .get_mut(cluster)
            .ok_or_else(|| Error::not_found("Cluster", cluster))?;
        let policies = sim
            .access_entries
            .get_mut(principal_arn)
            .ok_or_else(|| Error::not_found("AccessEntry", principal_arn))?;
        policies.retain(|p| p.policy_arn != policy_arn);
        policies.push(AssociatedPolicy {
            policy_arn: policy_arn.to_string(),
            scope: scope.clone(),
        });
        Ok(())
    }

    async fn describe_access_entry(
        &self,
        cluster: &str,
        principal_arn: &str,
    ) -> Result<AccessEntryDescription> {
        let mut inner = self.enter("describe_access_entry", principal_arn).await;
        throttled(&mut inner, "describe_access_entry")?;
        let sim = inner
            .clusters
            .get(cluster)
            .ok_or_else(|| Error::not_found("Cluster", cluster))?;
        let policies = sim
            .access_entries
            .get(principal_arn)
            .ok_or_else(|| Error::not_found("AccessEntry", principal_arn))?;
        Ok(AccessEntryDescription {
            cluster_name: cluster.to_string(),
            principal_arn: principal_arn.to_string(),
            policies: policies.clone(),
        })
    }

    async fn delete_access_entry(&self, cluster: &str, principal_arn: &str) -> Result<()> {
        let mut inner = self.enter("delete_access_entry", principal_arn).await;
        throttled(&mut inner, "delete_access_entry")?;
        let sim = inner
            .clusters
            .get_mut(cluster)
            .ok_or_else(|| Error::not_found("Cluster", cluster))?;
        sim.access_entries
            .remove(principal_arn)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("AccessEntry", principal_arn))
    }

    async fn cluster_token(&self, cluster: &str, role_arn: &str) -> Result<ClusterToken> {
        let mut inner = self.enter("cluster_token", cluster).await;
        throttled(&mut inner, "cluster_token")?;
        if !inner.clusters.contains_key(cluster) {
            return Err(Error::not_found("Cluster", cluster));
        }
        Ok(ClusterToken {
            token: format!("{TOKEN_PREFIX}{role_arn}"),
            expires_at: Utc::now() + chrono::Duration::minutes(15),
        })
    }
}

/// Cluster API of the clusters created by a [`SimulatedProvider`]
#[derive(Clone)]
pub struct SimulatedCluster {
    provider: SimulatedProvider,
}

#[async_trait]
impl ClusterConnector for SimulatedCluster {
    async fn connect(
        &self,
        cluster: &ClusterState,
        token: &ClusterToken,
    ) -> Result<Box<dyn ClusterConnection>> {
        let principal = token
            .token
            .strip_prefix(TOKEN_PREFIX)
            .ok_or_else(|| Error::InvalidScope("unrecognized bearer token".into()))?
            .to_string();
        if !self
            .provider
            .inner
            .lock()
            .await
            .clusters
            .contains_key(cluster.name())
        {
            return Err(Error::not_found("Cluster", cluster.name()));
        }
        self.provider
            .open_connections
            .fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimulatedConnection {
            provider: self.provider.clone(),
            cluster: cluster.name().to_string(),
            principal,
        }))
    }
}

struct SimulatedConnection {
    provider: SimulatedProvider,
    cluster: String,
    principal: String,
}

impl Drop for SimulatedConnection {
    fn drop(&mut self) {
        self.provider
            .open_connections
            .fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ClusterConnection for SimulatedConnection {
    async fn get_object(
        &self,
        kind: ObjectKind,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<Option<Value>> {
        if !self.provider.read_delay.is_zero() {
            tokio::time::sleep(self.provider.read_delay).await;
        }

        let inner = self.provider.inner.lock().await;
        let sim = inner
            .clusters
            .get(&self.cluster)
            .ok_or_else(|| Error::not_found("Cluster", &self.cluster))?;

        let allowed = sim
            .access_entries
            .get(&self.principal)
            .map(|policies| {
                policies.iter().any(|p| {
                    p.scope.covers(namespace)
                        && (kind != ObjectKind::Secret || p.policy_arn != CLUSTER_VIEW_POLICY_ARN)
                })
            })
            .unwrap_or(false);
        if !allowed {
            return Err(Error::InvalidScope(format!(
                "{} is forbidden from reading {kind} {name}",
                self.principal
            )));
        }

        Ok(sim
            .objects
            .get(&(kind, namespace.map(str::to_string), name.to_string()))
            .cloned())
    }
}
