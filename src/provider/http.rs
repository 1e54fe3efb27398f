//! HTTP client for a JSON control-plane gateway
//!
//! Resource layout:
//!
//! | Method | Path |
//! |--------|------|
//! | GET | `/v1/versions` |
//! | GET | `/v1/vpcs/{vpc}/subnets` |
//! | POST / GET / DELETE | `/v1/clusters[/{name}]` |
//! | POST | `/v1/clusters/{name}/token` |
//! | GET | `/v1/access-policies` |
//! | POST / GET / DELETE | `/v1/clusters/{name}/access-entries[/{principal}]` |
//! | POST | `/v1/clusters/{name}/access-entries/{principal}/policies` |
//! | POST / DELETE | `/v1/roles[/{name}]` |
//! | POST | `/v1/roles/{name}/managed-policies` |
//! | PUT | `/v1/roles/{name}/inline-policies/{policy}` |
//!
//! Path segments are percent-encoded, so principal ARNs can be used as-is.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{
    AccessEntryDescription, CloudProvider, ClusterDescription, ClusterToken,
    CreateClusterRequest, CreateRoleRequest, Subnet,
};
use crate::error::{Error, Result};
use crate::model::{AccessScope, PolicyDocument, RoleRef};

/// Error body returned by the gateway
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VersionsBody {
    versions: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SubnetsBody {
    subnets: Vec<Subnet>,
}

#[derive(Debug, Deserialize)]
struct AccessPoliciesBody {
    policies: Vec<String>,
}

/// [`CloudProvider`] backed by an HTTP gateway
#[derive(Clone)]
pub struct HttpProvider {
    client: Client,
    base_url: Url,
    timeout: Duration,
    auth_token: Option<String>,
}

impl HttpProvider {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| Error::ConfigError(format!("invalid provider endpoint {base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(Error::ConfigError(format!(
                "provider endpoint {base_url} cannot be used as a base URL"
            )));
        }
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("cluster-provisioner/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(Error::HttpError)?;
        Ok(Self {
            client,
            base_url,
            timeout,
            auth_token: None,
        })
    }

    /// Send `Authorization: Bearer <token>` with every request
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().push("v1");
            for segment in segments {
                path.push(segment);
            }
        }
        url
    }

    fn request(&self, method: Method, segments: &[&str]) -> RequestBuilder {
        let url = self.url(segments);
        debug!(%method, %url, "Provider request");
        let builder = self.client.request(method, url);
        match &self.auth_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, operation: &str, builder: RequestBuilder) -> Result<Response> {
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::timeout(operation, self.timeout)
            } else {
                Error::HttpError(e)
            }
        })?;
        if response.status().is_success() {
            return Ok(response);
        }
        Err(map_status(operation, response).await)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        operation: &str,
        builder: RequestBuilder,
    ) -> Result<T> {
        let response = self.send(operation, builder).await?;
        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

/// Translate a non-success response into the error taxonomy
async fn map_status(operation: &str, response: Response) -> Error {
    let status = response.status();
    let body: Option<ErrorBody> = response.json().await.ok();
    let detail = body
        .map(|b| match (b.code, b.message) {
            (Some(code), Some(message)) => format!("{code}: {message}"),
            (Some(code), None) => code,
            (None, Some(message)) => message,
            (None, None) => status.to_string(),
        })
        .unwrap_or_else(|| status.to_string());
    let detail = format!("{operation}: {detail}");

    match status {
        StatusCode::NOT_FOUND => Error::NotFound {
            kind: "Resource".to_string(),
            name: detail,
        },
        StatusCode::TOO_MANY_REQUESTS => Error::Throttled(detail),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            Error::timeout(detail, Duration::ZERO)
        }
        StatusCode::BAD_REQUEST
        | StatusCode::CONFLICT
        | StatusCode::UNPROCESSABLE_ENTITY
        | StatusCode::FORBIDDEN => Error::Rejected(detail),
        s if s.is_server_error() => Error::ProviderUnavailable(detail),
        _ => Error::Rejected(detail),
    }
}

#[async_trait]
impl CloudProvider for HttpProvider {
    async fn supported_versions(&self) -> Result<Vec<String>> {
        let body: VersionsBody = self
            .send_json("supported_versions", self.request(Method::GET, &["versions"]))
            .await?;
        Ok(body.versions)
    }

    async fn list_subnets(&self, vpc_id: &str) -> Result<Vec<Subnet>> {
        let body: SubnetsBody = self
            .send_json(
                "list_subnets",
                self.request(Method::GET, &["vpcs", vpc_id, "subnets"]),
            )
            .await?;
        Ok(body.subnets)
    }

    async fn create_cluster(&self, request: &CreateClusterRequest) -> Result<ClusterDescription> {
        self.send_json(
            "create_cluster",
            self.request(Method::POST, &["clusters"]).json(request),
        )
        .await
    }

    async fn describe_cluster(&self, name: &str) -> Result<ClusterDescription> {
        self.send_json(
            "describe_cluster",
            self.request(Method::GET, &["clusters", name]),
        )
        .await
    }

    async fn delete_cluster(&self, name: &str) -> Result<()> {
        self.send(
            "delete_cluster",
            self.request(Method::DELETE, &["clusters", name]),
        )
        .await?;
        Ok(())
    }

    async fn create_role(&self, request: &CreateRoleRequest) -> Result<RoleRef> {
        self.send_json(
            "create_role",
            self.request(Method::POST, &["roles"]).json(request),
        )
        .await
    }

    async fn delete_role(&self, name: &str) -> Result<()> {
        self.send("delete_role", self.request(Method::DELETE, &["roles", name]))
            .await?;
        Ok(())
    }

    async fn attach_managed_policy(&self, role_name: &str, policy_arn: &str) -> Result<()> {
        self.send(
            "attach_managed_policy",
            self.request(Method::POST, &["roles", role_name, "managed-policies"])
                .json(&json!({ "policyArn": policy_arn })),
        )
        .await?;
        Ok(())
    }

    async fn put_inline_policy(
        &self,
        role_name: &str,
        policy_name: &str,
        document: &PolicyDocument,
    ) -> Result<()> {
        self.send(
            "put_inline_policy",
            self.request(
                Method::PUT,
                &["roles", role_name, "inline-policies", policy_name],
            )
            .json(document),
        )
        .await?;
        Ok(())
    }

    async fn list_access_policies(&self) -> Result<Vec<String>> {
        let body: AccessPoliciesBody = self
            .send_json(
                "list_access_policies",
                self.request(Method::GET, &["access-policies"]),
            )
            .await?;
        Ok(body.policies)
    }

    async fn create_access_entry(&self, cluster: &str, principal_arn: &str) -> Result<()> {
        self.send(
            "create_access_entry",
            self.request(Method::POST, &["clusters", cluster, "access-entries"])
                .json(&json!({ "principalArn": principal_arn })),
        )
        .await?;
        Ok(())
    }

    async fn associate_access_policy(
        &self,
        cluster: &str,
        principal_arn: &str,
        policy_arn: &str,
        scope: &AccessScope,
    ) -> Result<()> {
        self.send(
            "associate_access_policy",
            self.request(
                Method::POST,
                &["clusters", cluster, "access-entries", principal_arn, "policies"],
            )
            .json(&json!({ "policyArn": policy_arn, "accessScope": scope })),
        )
        .await?;
        Ok(())
    }

    async fn describe_access_entry(
        &self,
        cluster: &str,
        principal_arn: &str,
    ) -> Result<AccessEntryDescription> {
        self.send_json(
            "describe_access_entry",
            self.request(
                Method::GET,
                &["clusters", cluster, "access-entries", principal_arn],
            ),
        )
        .await
    }

    async fn delete_access_entry(&self, cluster: &str, principal_arn: &str) -> Result<()> {
        self.send(
            "delete_access_entry",
            self.request(
                Method::DELETE,
                &["clusters", cluster, "access-entries", principal_arn],
            ),
        )
        .await?;
        Ok(())
    }

    async fn cluster_token(&self, cluster: &str, role_arn: &str) -> Result<ClusterToken> {
        self.send_json(
            "cluster_token",
            self.request(Method::POST, &["clusters", cluster, "token"])
                .json(&json!({ "roleArn": role_arn })),
        )
        .await
    }
}
