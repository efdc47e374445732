//! Cluster and fleet snapshot readers.
//!
//! Each tick starts by normalizing the orchestrator's nodes and pods, plus
//! the cloud's view of every configured fleet, into plain records. Nothing
//! downstream of this module touches an API object.

use std::collections::BTreeMap;

use armada_quantity::{Cpu, Memory, Resources};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1 as core_v1;
use thiserror::Error;
use tracing::{debug, warn};

use crate::catalog;
use crate::clients::{bounded, ClientError, ClusterApi, FleetApi, FleetSelector};
use crate::config::{Config, FleetKey, Kind, Size};

/// Node label carrying the cluster name.
pub const CLUSTER_LABEL: &str = "cluster";
/// Node label (and pod node-selector key) carrying the sector name.
pub const SECTOR_LABEL: &str = "sector";
/// Node label (and pod node-selector key) carrying the t-shirt size.
pub const SIZE_LABEL: &str = "size";
/// Node label carrying the fleet kind.
pub const KIND_LABEL: &str = "kind";
/// Node label carrying the `{sector}-{size}` fleet name.
pub const FLEET_LABEL: &str = "fleet";
/// Node label carrying the instance lifecycle (`Ec2Spot` or `OnDemand`).
pub const LIFECYCLE_LABEL: &str = "lifecycle";
/// Marker label distinguishing cordons applied by this manager from cordons
/// applied by operators.
pub const CORDONED_LABEL: &str = "armada.io/cordoned";

/// A snapshot read failure. Cluster failures abort the tick; fleet failures
/// exclude one fleet.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("cluster snapshot failed: {0}")]
    Cluster(#[source] ClientError),

    #[error("fleet {fleet} snapshot failed: {source}")]
    Fleet {
        fleet: FleetKey,
        #[source]
        source: ClientError,
    },
}

/// Pod lifecycle phase as reported by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    fn parse(phase: Option<&str>) -> PodPhase {
        match phase {
            Some("Pending") => PodPhase::Pending,
            Some("Running") => PodPhase::Running,
            Some("Succeeded") => PodPhase::Succeeded,
            Some("Failed") => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }

    /// Terminal pods hold no capacity and are dropped from snapshots.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, PodPhase::Succeeded | PodPhase::Failed)
    }
}

/// A managed worker node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub name: String,
    pub fleet: FleetKey,
    pub lifecycle: Option<String>,
    /// False when the node is cordoned, by anyone.
    pub schedulable: bool,
    /// True only for cordons this manager applied (marker label present).
    pub cordoned_by_manager: bool,
    pub allocatable: Resources,
    pub created_at: Option<DateTime<Utc>>,
}

/// A non-terminal pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pod {
    pub namespace: String,
    pub name: String,
    pub phase: PodPhase,
    pub node_name: Option<String>,
    pub node_selector: BTreeMap<String, String>,
    pub requests: Resources,
}

impl Pod {
    /// `namespace/name`, for logs.
    #[must_use]
    pub fn id(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// The orchestrator's state at the start of a tick.
#[derive(Debug, Clone, Default)]
pub struct ClusterSnapshot {
    pub nodes: Vec<Node>,
    pub pods: Vec<Pod>,
}

impl ClusterSnapshot {
    /// Nodes belonging to the given fleet.
    pub fn fleet_nodes(&self, key: &FleetKey) -> Vec<&Node> {
        self.nodes.iter().filter(|n| &n.fleet == key).collect()
    }
}

/// The cloud's state for one managed fleet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetState {
    pub key: FleetKey,
    pub fleet_id: String,
    pub target_capacity: u32,
    pub instance_ids: Vec<String>,
}

/// Reads and normalizes the cluster state. Any read failure aborts the
/// whole snapshot; a partial view must never produce a plan.
pub async fn read_cluster(
    api: &dyn ClusterApi,
    config: &Config,
) -> Result<ClusterSnapshot, SnapshotError> {
    let timeout = config.call_timeout();
    let raw_nodes = bounded(timeout, api.list_nodes())
        .await
        .map_err(SnapshotError::Cluster)?;
    let raw_pods = bounded(timeout, api.list_pods())
        .await
        .map_err(SnapshotError::Cluster)?;

    let nodes: Vec<Node> = raw_nodes
        .into_iter()
        .filter_map(|n| node_record(config, n))
        .collect();
    let pods: Vec<Pod> = raw_pods.into_iter().filter_map(pod_record).collect();

    debug!(
        nodes = nodes.len(),
        pods = pods.len(),
        "Normalized cluster snapshot"
    );
    Ok(ClusterSnapshot { nodes, pods })
}

/// Reads every configured fleet from the cloud. Fleets that cannot be read
/// are reported individually and excluded from this tick; the rest proceed.
pub async fn read_fleets(
    api: &dyn FleetApi,
    config: &Config,
) -> (BTreeMap<FleetKey, FleetState>, Vec<SnapshotError>) {
    let timeout = config.call_timeout();
    let mut states = BTreeMap::new();
    let mut errors = Vec::new();

    for (key, _spec) in config.fleets() {
        let selector = FleetSelector {
            cluster: config.cluster_name.clone(),
            sector: key.sector.clone(),
            size: key.size,
        };
        match bounded(timeout, api.describe_fleet(&selector)).await {
            Ok(observation) => {
                states.insert(
                    key.clone(),
                    FleetState {
                        key,
                        fleet_id: observation.fleet_id,
                        target_capacity: observation.target_capacity,
                        instance_ids: observation.instance_ids,
                    },
                );
            }
            Err(source) => errors.push(SnapshotError::Fleet { fleet: key, source }),
        }
    }

    (states, errors)
}

/// Normalizes one orchestrator node, returning `None` for nodes this
/// manager does not own.
fn node_record(config: &Config, node: core_v1::Node) -> Option<Node> {
    let name = node.metadata.name.clone()?;
    let labels = node.metadata.labels.as_ref()?;

    if labels.get(CLUSTER_LABEL) != Some(&config.cluster_name) {
        return None;
    }
    let sector_name = labels.get(SECTOR_LABEL)?;
    let sector = config.sectors.get(sector_name)?;

    let size: Size = match labels.get(SIZE_LABEL)?.parse() {
        Ok(size) => size,
        Err(_) => {
            warn!(node = %name, "Node has an unrecognized size label; skipping");
            return None;
        }
    };
    let kind: Kind = match labels.get(KIND_LABEL)?.parse() {
        Ok(kind) => kind,
        Err(_) => {
            warn!(node = %name, "Node has an unrecognized kind label; skipping");
            return None;
        }
    };
    if kind != sector.kind {
        warn!(
            node = %name,
            sector = %sector_name,
            node_kind = %kind,
            sector_kind = %sector.kind,
            "Node kind label disagrees with its sector's configuration; skipping"
        );
        return None;
    }

    let key = FleetKey {
        sector: sector_name.clone(),
        size,
        kind,
    };
    if let Some(fleet_label) = labels.get(FLEET_LABEL) {
        if fleet_label != &key.name() {
            warn!(
                node = %name,
                fleet_label = %fleet_label,
                expected = %key,
                "Node fleet label disagrees with its sector/size labels; skipping"
            );
            return None;
        }
    }

    let schedulable = !node
        .spec
        .as_ref()
        .and_then(|s| s.unschedulable)
        .unwrap_or(false);
    let cordoned_by_manager =
        !schedulable && labels.get(CORDONED_LABEL).map(String::as_str) == Some("true");

    let allocatable = node
        .status
        .as_ref()
        .and_then(|s| s.allocatable.as_ref())
        .map(|quantities| parse_resource_map(&name, quantities))
        .unwrap_or(Resources::ZERO);

    // A node reporting less than its size class is supposed to provide
    // means the reservation assumptions no longer hold for it.
    let reserved = Resources::new(config.reserved_cpus, config.reserved_memory);
    let expected = catalog::schedulable(size, kind, reserved);
    if !allocatable.is_zero() && !expected.fits_within(&allocatable) {
        warn!(
            node = %name,
            allocatable_cpu = %allocatable.cpu,
            allocatable_memory = %allocatable.memory,
            expected_cpu = %expected.cpu,
            expected_memory = %expected.memory,
            "Node reports less allocatable capacity than its size class provides"
        );
    }

    let lifecycle = labels.get(LIFECYCLE_LABEL).cloned();
    let created_at = node.metadata.creation_timestamp.as_ref().map(|t| t.0);

    Some(Node {
        name,
        fleet: key,
        lifecycle,
        schedulable,
        cordoned_by_manager,
        allocatable,
        created_at,
    })
}

/// Normalizes one pod, returning `None` for pods that hold no capacity:
/// terminal phases and DaemonSet members (which occupy every node by
/// construction and add no scalable demand).
fn pod_record(pod: core_v1::Pod) -> Option<Pod> {
    let name = pod.metadata.name.clone()?;
    let namespace = pod.metadata.namespace.clone().unwrap_or_default();

    let phase = PodPhase::parse(pod.status.as_ref().and_then(|s| s.phase.as_deref()));
    if phase.is_terminal() {
        return None;
    }

    let owned_by_daemonset = pod
        .metadata
        .owner_references
        .as_ref()
        .is_some_and(|refs| refs.iter().any(|r| r.kind == "DaemonSet"));
    if owned_by_daemonset {
        return None;
    }

    let spec = pod.spec?;
    let mut requests = Resources::ZERO;
    for container in &spec.containers {
        if let Some(container_requests) = container
            .resources
            .as_ref()
            .and_then(|r| r.requests.as_ref())
        {
            match parse_requests(container_requests) {
                Ok(resources) => requests += resources,
                Err(err) => {
                    // A malformed request mid-run is not fatal; the pod
                    // counts as zero demand.
                    warn!(
                        pod = %format!("{namespace}/{name}"),
                        error = %err,
                        "Pod has a malformed resource request; treating as zero"
                    );
                    requests = Resources::ZERO;
                    break;
                }
            }
        }
    }

    Some(Pod {
        namespace,
        name,
        phase,
        node_name: spec.node_name,
        node_selector: spec.node_selector.unwrap_or_default(),
        requests,
    })
}

fn parse_requests(
    quantities: &BTreeMap<String, k8s_openapi::apimachinery::pkg::api::resource::Quantity>,
) -> Result<Resources, armada_quantity::QuantityError> {
    let cpu = match quantities.get("cpu") {
        Some(q) => Cpu::parse(&q.0)?,
        None => Cpu::ZERO,
    };
    let memory = match quantities.get("memory") {
        Some(q) => Memory::parse(&q.0)?,
        None => Memory::ZERO,
    };
    Ok(Resources::new(cpu, memory))
}

fn parse_resource_map(
    node: &str,
    quantities: &BTreeMap<String, k8s_openapi::apimachinery::pkg::api::resource::Quantity>,
) -> Resources {
    match parse_requests(quantities) {
        Ok(resources) => resources,
        Err(err) => {
            warn!(node, error = %err, "Node reports malformed allocatable resources");
            Resources::ZERO
        }
    }
}
