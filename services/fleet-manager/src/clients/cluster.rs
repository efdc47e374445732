//! Kubernetes implementation of the orchestrator client.

use async_trait::async_trait;
use k8s_openapi::api::core::v1 as core_v1;
use kube::api::{Api, ListParams, Patch, PatchParams};
use tracing::debug;

use super::{ClientError, ClusterApi};
use crate::snapshot::CORDONED_LABEL;

/// Orchestrator client backed by the in-cluster (or kubeconfig) API server.
pub struct KubeClusterApi {
    nodes: Api<core_v1::Node>,
    pods: Api<core_v1::Pod>,
}

impl KubeClusterApi {
    /// Connects using the ambient environment: the in-cluster service
    /// account when deployed, the local kubeconfig otherwise.
    pub async fn connect() -> Result<Self, ClientError> {
        let client = kube::Client::try_default().await?;
        Ok(Self::new(client))
    }

    /// Wraps an existing client.
    pub fn new(client: kube::Client) -> Self {
        Self {
            nodes: Api::all(client.clone()),
            pods: Api::all(client),
        }
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn list_nodes(&self) -> Result<Vec<core_v1::Node>, ClientError> {
        let list = self.nodes.list(&ListParams::default()).await?;
        debug!(count = list.items.len(), "Listed cluster nodes");
        Ok(list.items)
    }

    async fn list_pods(&self) -> Result<Vec<core_v1::Pod>, ClientError> {
        let list = self.pods.list(&ListParams::default()).await?;
        debug!(count = list.items.len(), "Listed cluster pods");
        Ok(list.items)
    }

    async fn set_unschedulable(
        &self,
        node_name: &str,
        unschedulable: bool,
    ) -> Result<(), ClientError> {
        // A merge patch with a null label value removes the marker when
        // uncordoning.
        let marker = if unschedulable {
            serde_json::Value::String("true".to_string())
        } else {
            serde_json::Value::Null
        };
        let patch = serde_json::json!({
            "metadata": { "labels": { CORDONED_LABEL: marker } },
            "spec": { "unschedulable": unschedulable },
        });

        self.nodes
            .patch(node_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        debug!(node = node_name, unschedulable, "Patched node schedulability");
        Ok(())
    }
}
