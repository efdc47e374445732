//! Deterministic in-memory client implementations.
//!
//! The fakes hold scripted cluster and cloud state behind a mutex, record
//! every write, and can be told to fail specific operations. Given the same
//! scripted state, a reconciliation tick is fully reproducible.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use k8s_openapi::api::core::v1 as core_v1;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference, Time};

use super::{ClientError, ClusterApi, FleetApi, FleetObservation, FleetSelector};
use crate::catalog;
use crate::config::{Kind, Size};
use crate::snapshot::{
    CLUSTER_LABEL, CORDONED_LABEL, FLEET_LABEL, KIND_LABEL, LIFECYCLE_LABEL, SECTOR_LABEL,
    SIZE_LABEL,
};

/// Builds orchestrator node objects carrying the managed-fleet label
/// contract.
pub struct NodeBuilder {
    name: String,
    labels: BTreeMap<String, String>,
    unschedulable: bool,
    allocatable: (String, String),
    created_at: DateTime<Utc>,
}

impl NodeBuilder {
    /// A schedulable node in the given cluster and fleet, with the
    /// catalog's nominal allocatable resources and a fixed creation time.
    pub fn new(name: &str, cluster: &str, sector: &str, size: Size, kind: Kind) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(CLUSTER_LABEL.to_string(), cluster.to_string());
        labels.insert(SECTOR_LABEL.to_string(), sector.to_string());
        labels.insert(SIZE_LABEL.to_string(), size.to_string());
        labels.insert(KIND_LABEL.to_string(), kind.to_string());
        labels.insert(FLEET_LABEL.to_string(), format!("{sector}-{size}"));
        labels.insert(LIFECYCLE_LABEL.to_string(), "OnDemand".to_string());

        let nominal = catalog::nominal(size, kind);
        Self {
            name: name.to_string(),
            labels,
            unschedulable: false,
            allocatable: (nominal.cpu.to_string(), nominal.memory.to_string()),
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    /// Marks the node unschedulable without the manager's marker label, as
    /// an operator's `kubectl cordon` would.
    #[must_use]
    pub fn unschedulable(mut self) -> Self {
        self.unschedulable = true;
        self
    }

    /// Marks the node cordoned by this manager.
    #[must_use]
    pub fn cordoned_by_manager(mut self) -> Self {
        self.unschedulable = true;
        self.labels
            .insert(CORDONED_LABEL.to_string(), "true".to_string());
        self
    }

    /// Overrides the creation timestamp.
    #[must_use]
    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Replaces or removes a label.
    #[must_use]
    pub fn label(mut self, key: &str, value: Option<&str>) -> Self {
        match value {
            Some(value) => {
                self.labels.insert(key.to_string(), value.to_string());
            }
            None => {
                self.labels.remove(key);
            }
        }
        self
    }

    /// Builds the orchestrator object.
    #[must_use]
    pub fn build(self) -> core_v1::Node {
        let mut allocatable = BTreeMap::new();
        allocatable.insert("cpu".to_string(), Quantity(self.allocatable.0));
        allocatable.insert("memory".to_string(), Quantity(self.allocatable.1));

        core_v1::Node {
            metadata: ObjectMeta {
                name: Some(self.name),
                labels: Some(self.labels),
                creation_timestamp: Some(Time(self.created_at)),
                ..Default::default()
            },
            spec: Some(core_v1::NodeSpec {
                unschedulable: Some(self.unschedulable),
                ..Default::default()
            }),
            status: Some(core_v1::NodeStatus {
                allocatable: Some(allocatable),
                ..Default::default()
            }),
        }
    }
}

/// Builds orchestrator pod objects.
pub struct PodBuilder {
    namespace: String,
    name: String,
    phase: String,
    node_selector: BTreeMap<String, String>,
    node_name: Option<String>,
    requests: Option<(String, String)>,
    daemonset_owned: bool,
}

impl PodBuilder {
    /// A pending pod with no node selector and no resource requests.
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            phase: "Pending".to_string(),
            node_selector: BTreeMap::new(),
            node_name: None,
            requests: None,
            daemonset_owned: false,
        }
    }

    /// Steers the pod to a sector.
    #[must_use]
    pub fn sector(mut self, sector: &str) -> Self {
        self.node_selector
            .insert(SECTOR_LABEL.to_string(), sector.to_string());
        self
    }

    /// Pins the pod to an explicit fleet size.
    #[must_use]
    pub fn size(mut self, size: Size) -> Self {
        self.node_selector
            .insert(SIZE_LABEL.to_string(), size.to_string());
        self
    }

    /// Sets the pod phase string.
    #[must_use]
    pub fn phase(mut self, phase: &str) -> Self {
        self.phase = phase.to_string();
        self
    }

    /// Binds the pod to a node.
    #[must_use]
    pub fn on_node(mut self, node_name: &str) -> Self {
        self.node_name = Some(node_name.to_string());
        self
    }

    /// Sets well-formed container resource requests.
    #[must_use]
    pub fn requests(self, cpu: &str, memory: &str) -> Self {
        self.raw_requests(cpu, memory)
    }

    /// Sets request strings verbatim, valid or not.
    #[must_use]
    pub fn raw_requests(mut self, cpu: &str, memory: &str) -> Self {
        self.requests = Some((cpu.to_string(), memory.to_string()));
        self
    }

    /// Marks the pod as owned by a DaemonSet.
    #[must_use]
    pub fn daemonset_owned(mut self) -> Self {
        self.daemonset_owned = true;
        self
    }

    /// Builds the orchestrator object.
    #[must_use]
    pub fn build(self) -> core_v1::Pod {
        let resources = self.requests.map(|(cpu, memory)| {
            let mut requests = BTreeMap::new();
            requests.insert("cpu".to_string(), Quantity(cpu));
            requests.insert("memory".to_string(), Quantity(memory));
            core_v1::ResourceRequirements {
                requests: Some(requests),
                ..Default::default()
            }
        });

        let owner_references = self.daemonset_owned.then(|| {
            vec![OwnerReference {
                api_version: "apps/v1".to_string(),
                kind: "DaemonSet".to_string(),
                name: format!("{}-owner", self.name),
                uid: "00000000-0000-0000-0000-000000000000".to_string(),
                controller: Some(true),
                ..Default::default()
            }]
        });

        core_v1::Pod {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace),
                owner_references,
                ..Default::default()
            },
            spec: Some(core_v1::PodSpec {
                containers: vec![core_v1::Container {
                    name: "main".to_string(),
                    resources,
                    ..Default::default()
                }],
                node_selector: (!self.node_selector.is_empty()).then_some(self.node_selector),
                node_name: self.node_name,
                ..Default::default()
            }),
            status: Some(core_v1::PodStatus {
                phase: Some(self.phase),
                ..Default::default()
            }),
        }
    }
}

#[derive(Default)]
struct FakeClusterState {
    nodes: Vec<core_v1::Node>,
    pods: Vec<core_v1::Pod>,
    list_fault: Option<String>,
    patch_fault: Option<String>,
    patches: Vec<(String, bool)>,
}

/// Scriptable orchestrator fake.
#[derive(Default)]
pub struct FakeClusterApi {
    state: Mutex<FakeClusterState>,
}

impl FakeClusterApi {
    /// An empty cluster.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node object.
    pub fn add_node(&self, node: core_v1::Node) {
        self.state.lock().unwrap().nodes.push(node);
    }

    /// Adds a pod object.
    pub fn add_pod(&self, pod: core_v1::Pod) {
        self.state.lock().unwrap().pods.push(pod);
    }

    /// Replaces the pod set.
    pub fn set_pods(&self, pods: Vec<core_v1::Pod>) {
        self.state.lock().unwrap().pods = pods;
    }

    /// Makes every list call fail with the given message.
    pub fn fail_lists(&self, message: &str) {
        self.state.lock().unwrap().list_fault = Some(message.to_string());
    }

    /// Makes every schedulability patch fail with the given message.
    pub fn fail_patches(&self, message: &str) {
        self.state.lock().unwrap().patch_fault = Some(message.to_string());
    }

    /// Every `(node, unschedulable)` patch applied, in order.
    #[must_use]
    pub fn patches(&self) -> Vec<(String, bool)> {
        self.state.lock().unwrap().patches.clone()
    }

    /// Looks up a stored node object by name.
    #[must_use]
    pub fn node(&self, name: &str) -> Option<core_v1::Node> {
        self.state
            .lock()
            .unwrap()
            .nodes
            .iter()
            .find(|n| n.metadata.name.as_deref() == Some(name))
            .cloned()
    }
}

#[async_trait]
impl ClusterApi for FakeClusterApi {
    async fn list_nodes(&self) -> Result<Vec<core_v1::Node>, ClientError> {
        let state = self.state.lock().unwrap();
        if let Some(message) = &state.list_fault {
            return Err(ClientError::Fault(message.clone()));
        }
        Ok(state.nodes.clone())
    }

    async fn list_pods(&self) -> Result<Vec<core_v1::Pod>, ClientError> {
        let state = self.state.lock().unwrap();
        if let Some(message) = &state.list_fault {
            return Err(ClientError::Fault(message.clone()));
        }
        Ok(state.pods.clone())
    }

    async fn set_unschedulable(
        &self,
        node_name: &str,
        unschedulable: bool,
    ) -> Result<(), ClientError> {
        let mut state = self.state.lock().unwrap();
        if let Some(message) = &state.patch_fault {
            return Err(ClientError::Fault(message.clone()));
        }

        let node = state
            .nodes
            .iter_mut()
            .find(|n| n.metadata.name.as_deref() == Some(node_name))
            .ok_or_else(|| ClientError::Fault(format!("no such node: {node_name}")))?;

        node.spec.get_or_insert_with(Default::default).unschedulable = Some(unschedulable);
        let labels = node.metadata.labels.get_or_insert_with(Default::default);
        if unschedulable {
            labels.insert(CORDONED_LABEL.to_string(), "true".to_string());
        } else {
            labels.remove(CORDONED_LABEL);
        }

        state.patches.push((node_name.to_string(), unschedulable));
        Ok(())
    }
}

struct FakeFleet {
    fleet_id: String,
    cluster: String,
    sector: String,
    size: Size,
    target_capacity: u32,
    instance_ids: Vec<String>,
}

#[derive(Default)]
struct FakeFleetState {
    fleets: Vec<FakeFleet>,
    describe_fault: Option<String>,
    modify_fault: Option<String>,
    modifications: Vec<(String, u32)>,
}

/// Scriptable cloud fleet fake.
#[derive(Default)]
pub struct FakeFleetApi {
    state: Mutex<FakeFleetState>,
}

impl FakeFleetApi {
    /// An empty cloud account.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fleet with the given tag identity and target capacity.
    pub fn add_fleet(
        &self,
        fleet_id: &str,
        cluster: &str,
        sector: &str,
        size: Size,
        target_capacity: u32,
    ) {
        self.state.lock().unwrap().fleets.push(FakeFleet {
            fleet_id: fleet_id.to_string(),
            cluster: cluster.to_string(),
            sector: sector.to_string(),
            size,
            target_capacity,
            instance_ids: Vec::new(),
        });
    }

    /// Associates instance ids with a registered fleet.
    pub fn set_instances(&self, fleet_id: &str, instance_ids: Vec<String>) {
        let mut state = self.state.lock().unwrap();
        if let Some(fleet) = state.fleets.iter_mut().find(|f| f.fleet_id == fleet_id) {
            fleet.instance_ids = instance_ids;
        }
    }

    /// Makes every describe call fail with the given message.
    pub fn fail_describes(&self, message: &str) {
        self.state.lock().unwrap().describe_fault = Some(message.to_string());
    }

    /// Makes every capacity modification fail with the given message.
    pub fn fail_modifies(&self, message: &str) {
        self.state.lock().unwrap().modify_fault = Some(message.to_string());
    }

    /// Current target capacity of a registered fleet.
    #[must_use]
    pub fn target_of(&self, fleet_id: &str) -> Option<u32> {
        self.state
            .lock()
            .unwrap()
            .fleets
            .iter()
            .find(|f| f.fleet_id == fleet_id)
            .map(|f| f.target_capacity)
    }

    /// Every `(fleet_id, target)` modification applied, in order.
    #[must_use]
    pub fn modifications(&self) -> Vec<(String, u32)> {
        self.state.lock().unwrap().modifications.clone()
    }
}

#[async_trait]
impl FleetApi for FakeFleetApi {
    async fn describe_fleet(
        &self,
        selector: &FleetSelector,
    ) -> Result<FleetObservation, ClientError> {
        let state = self.state.lock().unwrap();
        if let Some(message) = &state.describe_fault {
            return Err(ClientError::Fault(message.clone()));
        }

        state
            .fleets
            .iter()
            .find(|f| {
                f.cluster == selector.cluster
                    && f.sector == selector.sector
                    && f.size == selector.size
            })
            .map(|f| FleetObservation {
                fleet_id: f.fleet_id.clone(),
                target_capacity: f.target_capacity,
                instance_ids: f.instance_ids.clone(),
            })
            .ok_or_else(|| ClientError::FleetNotFound(selector.to_string()))
    }

    async fn modify_target_capacity(
        &self,
        fleet_id: &str,
        target_capacity: u32,
    ) -> Result<(), ClientError> {
        let mut state = self.state.lock().unwrap();
        if let Some(message) = &state.modify_fault {
            return Err(ClientError::Fault(message.clone()));
        }

        let fleet = state
            .fleets
            .iter_mut()
            .find(|f| f.fleet_id == fleet_id)
            .ok_or_else(|| ClientError::Fault(format!("no such fleet: {fleet_id}")))?;
        fleet.target_capacity = target_capacity;
        state.modifications.push((fleet_id.to_string(), target_capacity));
        Ok(())
    }
}
