//! Post-provision executor
//!
//! Reads one object from a freshly provisioned cluster and extracts a single
//! field from it. The whole read (token issue, connect, get) is bounded by the
//! request timeout, and the connection is owned by that bounded future, so it
//! is released whether the read succeeds, fails or times out.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{
    ConfigMap, Namespace, Node, Pod, Secret, Service, ServiceAccount,
};
use kube::api::{Api, ApiResource, DynamicObject};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use super::jsonpath::FieldPath;
use crate::error::{Error, Result};
use crate::model::{AuthorizedIdentity, ClusterState, ExecutionRequest, ExecutionResult, ObjectKind};
use crate::provider::{CloudProvider, ClusterToken};

/// Opens authenticated connections to a cluster API
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    async fn connect(
        &self,
        cluster: &ClusterState,
        token: &ClusterToken,
    ) -> Result<Box<dyn ClusterConnection>>;
}

/// One open connection. Dropping it releases the connection.
#[async_trait]
pub trait ClusterConnection: Send + Sync {
    /// Fetch an object as JSON. `Ok(None)` when it does not exist.
    async fn get_object(
        &self,
        kind: ObjectKind,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<Option<Value>>;
}

fn api_resource(kind: ObjectKind) -> ApiResource {
    match kind {
        ObjectKind::ConfigMap => ApiResource::erase::<ConfigMap>(&()),
        ObjectKind::Secret => ApiResource::erase::<Secret>(&()),
        ObjectKind::Service => ApiResource::erase::<Service>(&()),
        ObjectKind::ServiceAccount => ApiResource::erase::<ServiceAccount>(&()),
        ObjectKind::Pod => ApiResource::erase::<Pod>(&()),
        ObjectKind::Namespace => ApiResource::erase::<Namespace>(&()),
        ObjectKind::Node => ApiResource::erase::<Node>(&()),
        ObjectKind::Deployment => ApiResource::erase::<Deployment>(&()),
        ObjectKind::StatefulSet => ApiResource::erase::<StatefulSet>(&()),
        ObjectKind::DaemonSet => ApiResource::erase::<DaemonSet>(&()),
    }
}

/// Build a single-context kubeconfig for `cluster`, authenticating with a
/// bearer token.
pub fn render_kubeconfig(cluster: &ClusterState, token: &ClusterToken) -> Result<Kubeconfig> {
    let server = cluster.endpoint().ok_or_else(|| {
        Error::ConfigError(format!("cluster {} has no API endpoint yet", cluster.name()))
    })?;

    let mut cluster_entry = json!({ "server": server });
    if let Some(ca) = cluster.certificate_authority() {
        cluster_entry["certificate-authority-data"] = json!(ca);
    }

    let document = json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{ "name": cluster.name(), "cluster": cluster_entry }],
        "users": [{ "name": "execution", "user": { "token": token.token } }],
        "contexts": [{
            "name": cluster.name(),
            "context": { "cluster": cluster.name(), "user": "execution" }
        }],
        "current-context": cluster.name(),
    });
    Ok(serde_json::from_value(document)?)
}

/// [`ClusterConnector`] backed by `kube::Client`
#[derive(Clone, Debug, Default)]
pub struct KubeConnector;

#[async_trait]
impl ClusterConnector for KubeConnector {
    async fn connect(
        &self,
        cluster: &ClusterState,
        token: &ClusterToken,
    ) -> Result<Box<dyn ClusterConnection>> {
        let kubeconfig = render_kubeconfig(cluster, token)?;
        let config =
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?;
        let client = Client::try_from(config)?;
        debug!(cluster = %cluster.name(), "Connected to cluster API");
        Ok(Box::new(KubeConnection { client }))
    }
}

struct KubeConnection {
    client: Client,
}

#[async_trait]
impl ClusterConnection for KubeConnection {
    async fn get_object(
        &self,
        kind: ObjectKind,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<Option<Value>> {
        let ar = api_resource(kind);
        let api: Api<DynamicObject> = match namespace {
            Some(ns) if kind.is_namespaced() => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        };

        match api.get(name).await {
            Ok(object) => Ok(Some(serde_json::to_value(object)?)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(kube::Error::Api(ae)) if ae.code == 401 || ae.code == 403 => {
                Err(Error::InvalidScope(ae.message))
            }
            Err(e) => Err(Error::KubeError(e)),
        }
    }
}

/// Runs bounded reads against live clusters
#[derive(Clone)]
pub struct PostProvisionExecutor {
    provider: Arc<dyn CloudProvider>,
    connector: Arc<dyn ClusterConnector>,
}

impl PostProvisionExecutor {
    pub fn new(provider: Arc<dyn CloudProvider>, connector: Arc<dyn ClusterConnector>) -> Self {
        Self {
            provider,
            connector,
        }
    }

    /// Read `request` from `cluster` as `identity`.
    ///
    /// Never mutates the cluster, so running it twice yields the same result.
    #[instrument(skip_all, fields(cluster = %cluster.name(), object = %request.describe()))]
    pub async fn execute(
        &self,
        cluster: &ClusterState,
        identity: &AuthorizedIdentity,
        request: &ExecutionRequest,
    ) -> ExecutionResult {
        match self.read(cluster, identity, request).await {
            Ok(value) => {
                info!(path = %request.json_path, "Post-provision read succeeded");
                ExecutionResult::succeeded(value)
            }
            Err(e) => {
                warn!(error = %e, "Post-provision read failed");
                ExecutionResult::from_error(&e)
            }
        }
    }

    async fn read(
        &self,
        cluster: &ClusterState,
        identity: &AuthorizedIdentity,
        request: &ExecutionRequest,
    ) -> Result<String> {
        cluster.ensure_active()?;
        check_scope(cluster, identity, request)?;
        let path = FieldPath::parse(&request.json_path)?;

        let fetch = async {
            let token = self
                .provider
                .cluster_token(cluster.name(), identity.role_arn())
                .await?;
            let connection = self.connector.connect(cluster, &token).await?;
            let namespace = request.namespace.as_deref();
            connection
                .get_object(request.object_type, &request.name, namespace)
                .await?
                .ok_or_else(|| Error::not_found(request.object_type.to_string(), request.describe()))
        };

        let object = tokio::time::timeout(request.timeout, fetch)
            .await
            .map_err(|_| Error::timeout(format!("read of {}", request.describe()), request.timeout))??;

        path.extract(&object)
    }
}

/// The binding must belong to this cluster and reach the requested object
fn check_scope(
    cluster: &ClusterState,
    identity: &AuthorizedIdentity,
    request: &ExecutionRequest,
) -> Result<()> {
    let binding = identity.binding();
    if binding.cluster().arn != cluster.arn() {
        return Err(Error::InvalidScope(format!(
            "binding is for cluster {}, not {}",
            binding.cluster().name,
            cluster.name()
        )));
    }
    if !binding.scope.covers(request.namespace.as_deref()) {
        return Err(Error::InvalidScope(format!(
            "{} is outside binding scope {}",
            request.describe(),
            binding.scope
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::controller::test_support::{active_cluster, role};
    use crate::model::{
        AccessBinding, AccessScope, ClusterPhase, ClusterPrincipal, ClusterSpec,
        ExecutionIdentity, ManagementApiGrant, ResourceScope, TrustPrincipal,
        CLUSTER_VIEW_POLICY_ARN, FUNCTION_RUNTIME_SERVICE,
    };
    use crate::provider::SimulatedProvider;
    use std::time::Duration;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Fixture {
        provider: SimulatedProvider,
        cluster: ClusterState,
        identity: AuthorizedIdentity,
    }

    /// Active simulated cluster plus an identity bound with `scope`
    async fn fixture(scope: AccessScope, policy: &str) -> Fixture {
        let provider = SimulatedProvider::new().with_creation_latency(1);
        let cluster = active_cluster(&provider, "demo").await;

        let exec_role = role(&provider, "kubectl", FUNCTION_RUNTIME_SERVICE).await;
        provider.create_access_entry("demo", &exec_role.arn).await.unwrap();
        provider
            .associate_access_policy("demo", &exec_role.arn, policy, &scope)
            .await
            .unwrap();

        let identity = ExecutionIdentity {
            role: exec_role.clone(),
            trust: TrustPrincipal::service(FUNCTION_RUNTIME_SERVICE),
        };
        let grant = ManagementApiGrant {
            role: exec_role.clone(),
            policy_name: "describe".into(),
            actions: vec!["eks:DescribeCluster".into()],
            resource: ResourceScope::Cluster(cluster.arn().to_string()),
        };
        let binding = AccessBinding {
            principal: ClusterPrincipal {
                principal_arn: exec_role.arn.clone(),
                cluster: cluster.handle().clone(),
            },
            scope,
            policy_arn: policy.to_string(),
            confirmed: true,
        };
        let identity = AuthorizedIdentity::new(&identity, &grant, &binding).unwrap();

        Fixture {
            provider,
            cluster,
            identity,
        }
    }

    fn request(kind: &str, name: &str, ns: Option<&str>, path: &str) -> ExecutionRequest {
        ExecutionRequest::new(
            kind,
            name,
            ns.map(str::to_string),
            path,
            Duration::from_secs(30),
        )
        .unwrap()
    }

    fn simulated_executor(f: &Fixture) -> PostProvisionExecutor {
        PostProvisionExecutor::new(
            Arc::new(f.provider.clone()),
            Arc::new(f.provider.cluster_connector()),
        )
    }

    #[tokio::test]
    async fn test_reads_root_ca_uid_and_is_idempotent() {
        let f = fixture(AccessScope::Cluster, CLUSTER_VIEW_POLICY_ARN).await;
        let executor = simulated_executor(&f);
        let req = request("ConfigMap", "kube-root-ca.crt", None, "$.metadata.uid");

        let first = executor.execute(&f.cluster, &f.identity, &req).await;
        let second = executor.execute(&f.cluster, &f.identity, &req).await;

        assert!(first.is_success(), "{first:?}");
        assert_eq!(first.value().map(str::len), Some(36));
        assert_eq!(first, second);
        assert_eq!(f.provider.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() {
        let f = fixture(AccessScope::Cluster, CLUSTER_VIEW_POLICY_ARN).await;
        let result = simulated_executor(&f)
            .execute(
                &f.cluster,
                &f.identity,
                &request("ConfigMap", "does-not-exist", None, "$.metadata.uid"),
            )
            .await;
        assert_eq!(result.failure(), Some(FailureKind::NotFound));
        assert_eq!(result.value(), None);
    }

    #[tokio::test]
    async fn test_missing_field_is_invalid_path() {
        let f = fixture(AccessScope::Cluster, CLUSTER_VIEW_POLICY_ARN).await;
        let result = simulated_executor(&f)
            .execute(
                &f.cluster,
                &f.identity,
                &request("ConfigMap", "kube-root-ca.crt", None, "$.metadata.nonexistent"),
            )
            .await;
        assert_eq!(result.failure(), Some(FailureKind::InvalidPath));
    }

    #[tokio::test]
    async fn test_namespace_outside_binding_scope() {
        let f = fixture(
            AccessScope::Namespaced(vec!["default".into()]),
            CLUSTER_VIEW_POLICY_ARN,
        )
        .await;
        let executor = simulated_executor(&f);

        let ok = executor
            .execute(
                &f.cluster,
                &f.identity,
                &request("ConfigMap", "kube-root-ca.crt", None, "$.metadata.uid"),
            )
            .await;
        assert!(ok.is_success());

        let denied = executor
            .execute(
                &f.cluster,
                &f.identity,
                &request("ConfigMap", "kube-root-ca.crt", Some("kube-system"), "$.metadata.uid"),
            )
            .await;
        assert_eq!(denied.failure(), Some(FailureKind::InvalidScope));

        let cluster_scoped = executor
            .execute(
                &f.cluster,
                &f.identity,
                &request("Namespace", "default", None, "$.metadata.uid"),
            )
            .await;
        assert_eq!(cluster_scoped.failure(), Some(FailureKind::InvalidScope));
    }

    #[tokio::test]
    async fn test_view_policy_cannot_read_secrets() {
        let f = fixture(AccessScope::Cluster, CLUSTER_VIEW_POLICY_ARN).await;
        let result = simulated_executor(&f)
            .execute(
                &f.cluster,
                &f.identity,
                &request("Secret", "anything", None, "$.data"),
            )
            .await;
        assert_eq!(result.failure(), Some(FailureKind::InvalidScope));
    }

    #[tokio::test]
    async fn test_requires_active_cluster() {
        let f = fixture(AccessScope::Cluster, CLUSTER_VIEW_POLICY_ARN).await;
        let mut deleting = f.cluster.clone();
        deleting.transition(ClusterPhase::Deleting).unwrap();

        let result = simulated_executor(&f)
            .execute(
                &deleting,
                &f.identity,
                &request("ConfigMap", "kube-root-ca.crt", None, "$.metadata.uid"),
            )
            .await;
        assert_eq!(result.failure(), Some(FailureKind::ClusterNotReady));
        assert_eq!(f.provider.calls_to("cluster_token").await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_releases_connection() {
        let mut f = fixture(AccessScope::Cluster, CLUSTER_VIEW_POLICY_ARN).await;
        f.provider = f.provider.clone().with_read_delay(Duration::from_secs(60));
        let executor = simulated_executor(&f);

        let result = executor
            .execute(
                &f.cluster,
                &f.identity,
                &request("ConfigMap", "kube-root-ca.crt", None, "$.metadata.uid"),
            )
            .await;

        assert_eq!(result.failure(), Some(FailureKind::Timeout));
        assert_eq!(result.value(), None);
        assert_eq!(f.provider.open_connections(), 0);
    }

    #[test]
    fn test_render_kubeconfig() {
        let mut cluster =
            ClusterState::pending(&ClusterSpec::new("demo", "vpc-1", "1.28"), "arn:demo");
        let token = ClusterToken {
            token: "abc".into(),
            expires_at: chrono::Utc::now(),
        };
        assert!(matches!(
            render_kubeconfig(&cluster, &token),
            Err(Error::ConfigError(_))
        ));

        cluster.set_connection(Some("https://demo.example".into()), Some("Q0E=".into()));
        let kc = render_kubeconfig(&cluster, &token).unwrap();
        assert_eq!(kc.current_context.as_deref(), Some("demo"));
        assert_eq!(kc.clusters.len(), 1);
        assert_eq!(kc.auth_infos.len(), 1);
    }

    /// Point the fixture's cluster at a fake API server
    fn against(server: &MockServer, mut cluster: ClusterState) -> ClusterState {
        cluster.set_connection(Some(server.uri()), None);
        cluster
    }

    #[tokio::test]
    async fn test_kube_connector_reads_config_map() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/namespaces/default/configmaps/kube-root-ca.crt"))
            .and(header("authorization", "Bearer k8s-sim-v1.arn:aws:iam::000000000000:role/kubectl"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {
                    "name": "kube-root-ca.crt",
                    "namespace": "default",
                    "uid": "5f1c3a2e-0000-4000-8000-000000000001"
                },
                "data": { "ca.crt": "pem" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let f = fixture(AccessScope::Cluster, CLUSTER_VIEW_POLICY_ARN).await;
        let cluster = against(&server, f.cluster.clone());
        let executor = PostProvisionExecutor::new(Arc::new(f.provider.clone()), Arc::new(KubeConnector));

        let result = executor
            .execute(
                &cluster,
                &f.identity,
                &request("ConfigMap", "kube-root-ca.crt", None, "$.metadata.uid"),
            )
            .await;
        assert_eq!(result.value(), Some("5f1c3a2e-0000-4000-8000-000000000001"));
    }

    #[tokio::test]
    async fn test_kube_connector_maps_api_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/namespaces/default/configmaps/missing"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "kind": "Status",
                "apiVersion": "v1",
                "metadata": {},
                "status": "Failure",
                "message": "configmaps \"missing\" not found",
                "reason": "NotFound",
                "code": 404
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/nodes/worker-1"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                "kind": "Status",
                "apiVersion": "v1",
                "metadata": {},
                "status": "Failure",
                "message": "nodes \"worker-1\" is forbidden",
                "reason": "Forbidden",
                "code": 403
            })))
            .mount(&server)
            .await;

        let f = fixture(AccessScope::Cluster, CLUSTER_VIEW_POLICY_ARN).await;
        let cluster = against(&server, f.cluster.clone());
        let executor = PostProvisionExecutor::new(Arc::new(f.provider.clone()), Arc::new(KubeConnector));

        let missing = executor
            .execute(
                &cluster,
                &f.identity,
                &request("ConfigMap", "missing", None, "$.metadata.uid"),
            )
            .await;
        assert_eq!(missing.failure(), Some(FailureKind::NotFound));

        let forbidden = executor
            .execute(
                &cluster,
                &f.identity,
                &request("Node", "worker-1", None, "$.metadata.uid"),
            )
            .await;
        assert_eq!(forbidden.failure(), Some(FailureKind::InvalidScope));
    }
}
