//! Provisioning lifecycle
//!
//! Each component owns one slice of a deployment: the provisioning
//! controller drives the cluster to Active, the access broker creates
//! identities and bindings, the executor performs the post-provision read
//! and the reporter publishes its result. [`Deployment`] sequences them.

pub mod access;
pub mod conditions;
mod deployment;
pub mod executor;
mod jsonpath;
pub mod provisioning;
mod reporter;
#[cfg(test)]
mod test_support;

pub use access::{AccessBroker, MANAGEMENT_POLICY_NAME};
pub use deployment::{teardown, Deployment, DeploymentRecord, TeardownSummary};
pub use executor::{
    render_kubeconfig, ClusterConnection, ClusterConnector, KubeConnector, PostProvisionExecutor,
};
pub use jsonpath::{FieldPath, Segment};
pub use provisioning::{resolve_subnets, PollConfig, ProvisioningController};
pub use reporter::{OutputFormat, OutputReporter, StackOutput, DEFAULT_OUTPUT_KEY};
