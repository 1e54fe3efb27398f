//! Deployment configuration
//!
//! One `DeploymentConfig` describes one deployment: where it goes, what
//! cluster to create, how the execution identity is scoped and what to read
//! once the cluster is up. It is loaded from TOML or YAML and passed
//! explicitly to every component; nothing reads configuration globally.
//!
//! ```toml
//! account = "123456789012"
//! region = "ap-southeast-2"
//!
//! [cluster]
//! name = "demo"
//! vpc_id = "vpc-0abc123"
//! version = "1.28"
//!
//! [access]
//! scope = { type = "namespaced", namespaces = ["default"] }
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::controller::{OutputFormat, PollConfig, DEFAULT_OUTPUT_KEY};
use crate::error::{Error, Result};
use crate::model::{
    AccessMode, AccessScope, ClusterSpec, EndpointAccess, ExecutionRequest, SpecValidationError,
    SubnetSelection, CLUSTER_VIEW_POLICY_ARN, FUNCTION_RUNTIME_SERVICE,
};
use crate::retry::RetryConfig;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeploymentConfig {
    /// 12-digit account the deployment targets
    pub account: String,
    pub region: String,
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub access: AccessConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub polling: PollingConfig,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    pub name: String,
    pub vpc_id: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub access_mode: AccessMode,
    #[serde(default)]
    pub subnets: SubnetSelection,
    #[serde(default)]
    pub endpoint_access: EndpointAccess,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccessConfig {
    /// In-cluster access policy bound to the execution identity
    #[serde(default = "default_policy_arn")]
    pub policy_arn: String,
    #[serde(default = "default_scope")]
    pub scope: AccessScope,
    /// Management-API actions granted on the cluster ARN
    #[serde(default = "default_management_actions")]
    pub management_actions: Vec<String>,
    /// Service allowed to assume the execution identity
    #[serde(default = "default_trusted_service")]
    pub trusted_service: String,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            policy_arn: default_policy_arn(),
            scope: default_scope(),
            management_actions: default_management_actions(),
            trusted_service: default_trusted_service(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutionConfig {
    #[serde(default = "default_object_type")]
    pub object_type: String,
    #[serde(default = "default_object_name")]
    pub object_name: String,
    #[serde(default = "default_object_namespace")]
    pub object_namespace: Option<String>,
    #[serde(default = "default_json_path")]
    pub json_path: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Total attempts when a read times out
    #[serde(default = "default_execution_attempts")]
    pub attempts: u32,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            object_type: default_object_type(),
            object_name: default_object_name(),
            object_namespace: default_object_namespace(),
            json_path: default_json_path(),
            timeout_seconds: default_timeout_seconds(),
            attempts: default_execution_attempts(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputConfig {
    #[serde(default = "default_output_key")]
    pub key: String,
    #[serde(default)]
    pub format: OutputFormat,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            key: default_output_key(),
            format: OutputFormat::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    /// Base URL of the control-plane gateway
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
    /// Attempts per provider call on transient failures
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            request_timeout_seconds: default_request_timeout_seconds(),
            max_attempts: default_max_attempts(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PollingConfig {
    #[serde(default = "default_initial_interval_seconds")]
    pub initial_interval_seconds: u64,
    #[serde(default = "default_max_interval_seconds")]
    pub max_interval_seconds: u64,
    #[serde(default = "default_ready_timeout_seconds")]
    pub ready_timeout_seconds: u64,
    #[serde(default = "default_delete_timeout_seconds")]
    pub delete_timeout_seconds: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            initial_interval_seconds: default_initial_interval_seconds(),
            max_interval_seconds: default_max_interval_seconds(),
            ready_timeout_seconds: default_ready_timeout_seconds(),
            delete_timeout_seconds: default_delete_timeout_seconds(),
        }
    }
}

fn default_version() -> String {
    "1.28".to_string()
}

fn default_policy_arn() -> String {
    CLUSTER_VIEW_POLICY_ARN.to_string()
}

fn default_scope() -> AccessScope {
    AccessScope::Cluster
}

fn default_management_actions() -> Vec<String> {
    vec!["eks:DescribeCluster".to_string()]
}

fn default_trusted_service() -> String {
    FUNCTION_RUNTIME_SERVICE.to_string()
}

fn default_object_type() -> String {
    "ConfigMap".to_string()
}

fn default_object_name() -> String {
    "kube-root-ca.crt".to_string()
}

fn default_object_namespace() -> Option<String> {
    Some("default".to_string())
}

fn default_json_path() -> String {
    "$.metadata.uid".to_string()
}

fn default_timeout_seconds() -> u64 {
    30
}

fn default_execution_attempts() -> u32 {
    3
}

fn default_output_key() -> String {
    DEFAULT_OUTPUT_KEY.to_string()
}

fn default_request_timeout_seconds() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_interval_seconds() -> u64 {
    10
}

fn default_max_interval_seconds() -> u64 {
    60
}

fn default_ready_timeout_seconds() -> u64 {
    30 * 60
}

fn default_delete_timeout_seconds() -> u64 {
    20 * 60
}

/// Values left over from a template, e.g. `FILL ME IN` or `<account-id>`
fn is_placeholder(value: &str) -> bool {
    let v = value.trim();
    v.is_empty()
        || v.to_ascii_uppercase().contains("FILL ME IN")
        || v.eq_ignore_ascii_case("changeme")
        || (v.starts_with('<') && v.ends_with('>'))
}

impl DeploymentConfig {
    /// Load from a `.toml`, `.yaml` or `.yml` file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml(&raw),
            Some("yaml") | Some("yml") => Self::from_yaml(&raw),
            _ => Err(Error::ConfigError(format!(
                "{} must have a .toml, .yaml or .yml extension",
                path.display()
            ))),
        }
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Apply command-line or environment overrides
    pub fn with_overrides(mut self, account: Option<String>, region: Option<String>) -> Self {
        if let Some(account) = account {
            self.account = account;
        }
        if let Some(region) = region {
            self.region = region;
        }
        self
    }

    pub fn validate(&self) -> Result<(), Vec<SpecValidationError>> {
        let mut errors = Vec::new();

        if is_placeholder(&self.account) {
            errors.push(SpecValidationError::new(
                "account",
                format!("'{}' is a placeholder", self.account),
                "Set account to the 12-digit id of the target account, or pass --account.",
            ));
        } else if self.account.len() != 12 || !self.account.chars().all(|c| c.is_ascii_digit()) {
            errors.push(SpecValidationError::new(
                "account",
                format!("'{}' is not a 12-digit account id", self.account),
                "Use the numeric account id, e.g. 123456789012.",
            ));
        }

        if is_placeholder(&self.region) {
            errors.push(SpecValidationError::new(
                "region",
                format!("'{}' is a placeholder", self.region),
                "Set region, e.g. ap-southeast-2, or pass --region.",
            ));
        } else if !self
            .region
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            errors.push(SpecValidationError::new(
                "region",
                format!("'{}' is not a region name", self.region),
                "Use a region code such as ap-southeast-2.",
            ));
        }

        if is_placeholder(&self.cluster.vpc_id) {
            errors.push(SpecValidationError::new(
                "cluster.vpc_id",
                format!("'{}' is a placeholder", self.cluster.vpc_id),
                "Set cluster.vpc_id to the id of an existing VPC.",
            ));
        }

        if let Err(spec_errors) = self.cluster_spec().validate() {
            errors.extend(
                spec_errors
                    .into_iter()
                    .filter(|e| e.field != "spec.network.vpcId"),
            );
        }

        if self.access.management_actions.is_empty() {
            errors.push(SpecValidationError::new(
                "access.management_actions",
                "at least one management action is required",
                "Grant eks:DescribeCluster so the execution identity can locate the cluster.",
            ));
        }
        if is_placeholder(&self.access.policy_arn) {
            errors.push(SpecValidationError::new(
                "access.policy_arn",
                "access policy must be set",
                "Use an access policy ARN such as the read-only AmazonEKSViewPolicy.",
            ));
        }

        match self.execution_request() {
            Ok(_) => {}
            Err(Error::ValidationError(e)) => errors.extend(e),
            Err(e) => errors.push(SpecValidationError::new(
                "execution",
                e.to_string(),
                "Fix the execution section.",
            )),
        }
        if self.execution.attempts == 0 {
            errors.push(SpecValidationError::new(
                "execution.attempts",
                "attempts must be at least 1",
                "Set execution.attempts to 1 to disable retries.",
            ));
        }

        if let Some(endpoint) = &self.provider.endpoint {
            if reqwest::Url::parse(endpoint).is_err() {
                errors.push(SpecValidationError::new(
                    "provider.endpoint",
                    format!("'{endpoint}' is not a URL"),
                    "Use the gateway base URL, e.g. https://gateway.internal/.",
                ));
            }
        }
        if self.provider.request_timeout_seconds == 0 || self.provider.max_attempts == 0 {
            errors.push(SpecValidationError::new(
                "provider",
                "request_timeout_seconds and max_attempts must be greater than zero",
                "Remove the overrides to use the defaults.",
            ));
        }

        let p = &self.polling;
        if p.initial_interval_seconds == 0
            || p.ready_timeout_seconds == 0
            || p.delete_timeout_seconds == 0
            || p.max_interval_seconds < p.initial_interval_seconds
        {
            errors.push(SpecValidationError::new(
                "polling",
                "intervals and timeouts must be positive and max_interval_seconds >= initial_interval_seconds",
                "Remove the overrides to use the defaults.",
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn cluster_spec(&self) -> ClusterSpec {
        let c = &self.cluster;
        let mut spec = ClusterSpec::new(&c.name, &c.vpc_id, &c.version)
            .with_subnets(c.subnets.clone())
            .with_access_mode(c.access_mode)
            .with_endpoint_access(c.endpoint_access);
        spec.tags = c.tags.clone();
        spec
    }

    pub fn execution_request(&self) -> Result<ExecutionRequest> {
        let e = &self.execution;
        ExecutionRequest::new(
            &e.object_type,
            &e.object_name,
            e.object_namespace.clone(),
            &e.json_path,
            Duration::from_secs(e.timeout_seconds),
        )
    }

    pub fn poll_config(&self) -> PollConfig {
        PollConfig {
            initial_interval: Duration::from_secs(self.polling.initial_interval_seconds),
            max_interval: Duration::from_secs(self.polling.max_interval_seconds),
            ready_timeout: Duration::from_secs(self.polling.ready_timeout_seconds),
            delete_timeout: Duration::from_secs(self.polling.delete_timeout_seconds),
        }
    }

    pub fn provider_retry(&self) -> RetryConfig {
        RetryConfig::with_max_attempts(self.provider.max_attempts)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider.request_timeout_seconds)
    }

    /// ARN of a role in the target account
    pub fn role_arn(&self, role_name: &str) -> String {
        format!("arn:aws:iam::{}:role/{}", self.account, role_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
account = "123456789012"
region = "ap-southeast-2"

[cluster]
name = "demo"
vpc_id = "vpc-0abc123"
"#;

    #[test]
    fn test_defaults() {
        let config = DeploymentConfig::from_toml(MINIMAL).unwrap();
        assert!(config.validate().is_ok(), "{:?}", config.validate());

        assert_eq!(config.cluster.version, "1.28");
        assert_eq!(config.cluster.access_mode, AccessMode::ApiAndConfigMap);
        assert_eq!(config.cluster.subnets, SubnetSelection::Public);
        assert_eq!(config.access.policy_arn, CLUSTER_VIEW_POLICY_ARN);
        assert_eq!(config.access.management_actions, vec!["eks:DescribeCluster"]);
        assert_eq!(config.output.key, "demo-output");

        let request = config.execution_request().unwrap();
        assert_eq!(request.describe(), "ConfigMap default/kube-root-ca.crt");
        assert_eq!(request.json_path, "$.metadata.uid");
        assert_eq!(request.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_placeholders_rejected() {
        let raw = r#"
account = "FILL ME IN"
region = "ap-southeast-2"

[cluster]
name = "demo"
vpc_id = "FILL ME IN"
"#;
        let config = DeploymentConfig::from_toml(raw).unwrap();
        let errors = config.validate().unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["account", "cluster.vpc_id"]);
    }

    #[test]
    fn test_overrides_fix_placeholders() {
        let raw = MINIMAL.replace("123456789012", "<account-id>");
        let config = DeploymentConfig::from_toml(&raw).unwrap();
        assert!(config.validate().is_err());

        let config = config.with_overrides(Some("210987654321".into()), None);
        assert!(config.validate().is_ok());
        assert_eq!(config.region, "ap-southeast-2");
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let raw = format!("{MINIMAL}\n[output]\nkey = \"x\"\nfromat = \"json\"\n");
        assert!(DeploymentConfig::from_toml(&raw).is_err());
    }

    #[test]
    fn test_load_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        write!(
            file,
            r#"
account: "123456789012"
region: ap-southeast-2
cluster:
  name: demo
  vpc_id: vpc-0abc123
  subnets:
    type: explicit
    ids: [subnet-a, subnet-b]
access:
  scope:
    type: namespaced
    namespaces: [default]
output:
  format: json
"#
        )
        .unwrap();

        let config = DeploymentConfig::load(file.path()).unwrap();
        assert_eq!(
            config.cluster.subnets,
            SubnetSelection::Explicit(vec!["subnet-a".into(), "subnet-b".into()])
        );
        assert_eq!(
            config.access.scope,
            AccessScope::Namespaced(vec!["default".into()])
        );
        assert_eq!(config.output.format, OutputFormat::Json);
    }

    #[test]
    fn test_load_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            "{MINIMAL}\n[execution]\nobject_type = \"Namespace\"\nobject_name = \"kube-system\"\n"
        )
        .unwrap();

        let config = DeploymentConfig::load(file.path()).unwrap();
        let request = config.execution_request().unwrap();
        assert_eq!(request.namespace, None);
    }

    #[test]
    fn test_load_rejects_unknown_extension() {
        let file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        assert!(matches!(
            DeploymentConfig::load(file.path()),
            Err(Error::ConfigError(_))
        ));
    }

    #[test]
    fn test_bad_execution_surfaces_field_errors() {
        let raw = format!("{MINIMAL}\n[execution]\njson_path = \"$.metadata[\"\ntimeout_seconds = 0\n");
        let config = DeploymentConfig::from_toml(&raw).unwrap();
        let errors = config.validate().unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"execution.jsonPath"));
        assert!(fields.contains(&"execution.timeoutSeconds"));
    }

    #[test]
    fn test_role_arn() {
        let config = DeploymentConfig::from_toml(MINIMAL).unwrap();
        assert_eq!(
            config.role_arn("demo-execution"),
            "arn:aws:iam::123456789012:role/demo-execution"
        );
    }

    #[test]
    fn test_shipped_demo_needs_filling_in() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/demo.toml");
        let config = DeploymentConfig::load(&path).unwrap();
        assert_eq!(config.cluster.name, "demo");
        assert_eq!(config.cluster.endpoint_access, EndpointAccess::default());

        let errors = config.validate().unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["account", "cluster.vpc_id"]);

        let mut filled = config.with_overrides(Some("123456789012".into()), None);
        filled.cluster.vpc_id = "vpc-0abc123".into();
        assert!(filled.validate().is_ok());
    }
}
