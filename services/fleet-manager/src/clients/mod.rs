//! Client seams for the two external systems the manager drives.
//!
//! Both the orchestrator and the cloud fleet API are reached through traits
//! so the reconciliation engine can be exercised against deterministic
//! in-memory fakes. Production implementations live in `cluster` (kube) and
//! `fleets` (EC2); the fakes live in `fake`.

mod cluster;
mod fake;
mod fleets;

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1 as core_v1;
use thiserror::Error;

use crate::config::Size;

pub use cluster::KubeClusterApi;
pub use fake::{FakeClusterApi, FakeFleetApi, NodeBuilder, PodBuilder};
pub use fleets::Ec2FleetApi;

/// Errors surfaced by either client. The control loop maps these into
/// snapshot or actuation errors depending on which phase raised them.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("orchestrator api error: {0}")]
    Orchestrator(#[from] kube::Error),

    #[error("cloud api error: {0}")]
    Cloud(String),

    #[error("no active fleet matches {0}")]
    FleetNotFound(String),

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Fault(String),
}

/// Tag set that identifies one managed fleet in the cloud account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetSelector {
    pub cluster: String,
    pub sector: String,
    pub size: Size,
}

impl fmt::Display for FleetSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cluster={} sector={} size={}",
            self.cluster, self.sector, self.size
        )
    }
}

/// Observed state of a cloud fleet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetObservation {
    /// Opaque cloud identifier for the fleet.
    pub fleet_id: String,

    /// Target capacity the cloud is currently maintaining.
    pub target_capacity: u32,

    /// Instance ids currently associated with the fleet, joined to the
    /// cluster or not.
    pub instance_ids: Vec<String>,
}

/// Read and write access to the container orchestrator.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Lists every node in the cluster.
    async fn list_nodes(&self) -> Result<Vec<core_v1::Node>, ClientError>;

    /// Lists pods across all namespaces.
    async fn list_pods(&self) -> Result<Vec<core_v1::Pod>, ClientError>;

    /// Patches a node's schedulability. Cordoning also applies the
    /// manager's marker label so externally applied cordons stay
    /// distinguishable; uncordoning removes it.
    async fn set_unschedulable(
        &self,
        node_name: &str,
        unschedulable: bool,
    ) -> Result<(), ClientError>;
}

/// Read and write access to the cloud fleet API.
#[async_trait]
pub trait FleetApi: Send + Sync {
    /// Resolves a fleet by its tag set and reads its current state.
    async fn describe_fleet(
        &self,
        selector: &FleetSelector,
    ) -> Result<FleetObservation, ClientError>;

    /// Sets the fleet's total target capacity.
    async fn modify_target_capacity(
        &self,
        fleet_id: &str,
        target_capacity: u32,
    ) -> Result<(), ClientError>;
}

/// Bounds an external call with a timeout, mapping expiry into
/// [`ClientError::Timeout`].
pub async fn bounded<T, F>(timeout: Duration, call: F) -> Result<T, ClientError>
where
    F: Future<Output = Result<T, ClientError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(ClientError::Timeout(timeout)),
    }
}
