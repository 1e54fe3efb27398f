//! Cluster provisioner: stands up a managed Kubernetes control plane,
//! authorizes an execution identity against it, runs one read inside the
//! new cluster and publishes the result as a stack output.

pub mod config;
pub mod controller;
pub mod error;
pub mod model;
pub mod provider;
pub mod retry;
pub mod telemetry;

pub use crate::error::{Error, FailureKind, Result};
