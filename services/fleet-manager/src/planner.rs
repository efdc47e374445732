//! The capacity planner.
//!
//! Pure decision kernel: given one sector's demand, its fleets' schedulable
//! per-node capacities, their observed targets, and their nodes, produce a
//! per-fleet plan. The planner performs no I/O and carries no state between
//! ticks; the same inputs always produce the same plans.
//!
//! Sizing walks the sector's sizes from largest to smallest. Each pod is
//! first homed at the smallest size whose node can hold its
//! headroom-inflated request (a pod that overflows a small node must not be
//! split across two of them), then larger sizes absorb integer node-chunks
//! of the total demand and the smallest size picks up the residual, rounded
//! up. Batch workloads end up on a few large hosts plus small hosts for the
//! tail.

use std::collections::{BTreeMap, BTreeSet};

use armada_quantity::Resources;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::config::{FleetKey, Size};
use crate::demand::SectorDemand;
use crate::snapshot::Node;

/// Everything the planner needs to know about one fleet.
#[derive(Debug, Clone)]
pub struct FleetInput<'a> {
    pub key: FleetKey,
    pub min_capacity: u32,
    /// Schedulable per-node capacity, after reservation.
    pub capacity: Resources,
    /// Target capacity the cloud currently maintains.
    pub current_target: u32,
    /// Cluster nodes currently belonging to this fleet.
    pub nodes: Vec<&'a Node>,
}

/// The planner's decision for one fleet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetPlan {
    pub key: FleetKey,
    pub desired_target: u32,
    pub current_target: u32,
    /// Nodes to mark unschedulable. Disjoint from `uncordon`.
    pub cordon: BTreeSet<String>,
    /// Manager-cordoned nodes to return to service.
    pub uncordon: BTreeSet<String>,
}

impl FleetPlan {
    /// True when the plan matches the observed state and nothing needs to
    /// be actuated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.desired_target == self.current_target
            && self.cordon.is_empty()
            && self.uncordon.is_empty()
    }
}

/// Plans one sector. `fleets` carries the sector's fleets in any order;
/// planning is deterministic regardless.
pub fn plan_sector(
    demand: &SectorDemand,
    headroom_permille: u64,
    fleets: &[FleetInput<'_>],
) -> Vec<FleetPlan> {
    let mut fleets: Vec<&FleetInput<'_>> = fleets.iter().collect();
    fleets.sort_by_key(|f| f.key.size);

    for fleet in &fleets {
        if !is_usable(fleet.capacity) {
            warn!(
                fleet = %fleet.key,
                "Reservation exhausts this fleet's per-node capacity; it can never satisfy demand"
            );
        }
    }

    let candidates = size_candidates(demand, headroom_permille, &fleets);
    let pods_per_node = count_sector_pods_per_node(demand);

    fleets
        .iter()
        .map(|fleet| {
            let candidate = candidates.get(&fleet.key.size).copied().unwrap_or(0);
            let desired_target = candidate.max(u64::from(fleet.min_capacity)).min(u64::from(u32::MAX)) as u32;
            plan_fleet(fleet, desired_target, &pods_per_node)
        })
        .collect()
}

/// Per-size node counts covering the sector's demand.
fn size_candidates(
    demand: &SectorDemand,
    headroom_permille: u64,
    fleets: &[&FleetInput<'_>],
) -> BTreeMap<Size, u64> {
    let usable: Vec<&FleetInput<'_>> = fleets
        .iter()
        .copied()
        .filter(|f| is_usable(f.capacity))
        .collect();

    let mut candidates = BTreeMap::new();
    if usable.is_empty() {
        if !demand.total.is_zero() {
            warn!("Sector has demand but no fleet with usable capacity");
        }
        return candidates;
    }

    // Inflate each pod's request by the headroom factor, exactly once.
    let inflated: Vec<Resources> = demand
        .pods
        .iter()
        .map(|pod| {
            let request = pod.requests.scale_ceil(headroom_permille, 1000);
            debug!(pod = %pod.id(), cpu = %request.cpu, memory = %request.memory, "Inflated pod request");
            request
        })
        .collect();

    // Home each pod at the smallest size whose node can hold it whole. An
    // explicit size selector pins the home; a pod too big for every size is
    // homed at the largest and flagged.
    let mut homed: BTreeMap<Size, Resources> = BTreeMap::new();
    let mut total = Resources::ZERO;
    for (pod, request) in demand.pods.iter().zip(&inflated) {
        let pinned = pod
            .pinned_size
            .and_then(|size| usable.iter().find(|f| f.key.size == size));
        let home = match pinned {
            Some(fleet) => fleet.key.size,
            None => match usable.iter().find(|f| request.fits_within(&f.capacity)) {
                Some(fleet) => fleet.key.size,
                None => {
                    let largest = usable.last().expect("usable is non-empty");
                    warn!(
                        pod = %pod.id(),
                        cpu = %request.cpu,
                        memory = %request.memory,
                        "Pod request exceeds every node size in its sector"
                    );
                    largest.key.size
                }
            },
        };
        *homed.entry(home).or_default() += *request;
        total += *request;
    }

    // Largest first: cover demand that cannot descend, take integer
    // node-chunks of the rest, and let the smallest size absorb the
    // residual.
    let mut residual = total;
    let mut uncovered_homed = Resources::ZERO;
    for (position, fleet) in usable.iter().enumerate().rev() {
        uncovered_homed += homed.get(&fleet.key.size).copied().unwrap_or(Resources::ZERO);

        let count = if position == 0 {
            nodes_ceil(residual, fleet.capacity)
        } else {
            let greedy = nodes_floor(residual, fleet.capacity);
            let required = nodes_ceil(uncovered_homed, fleet.capacity);
            greedy.max(required)
        };

        let provided = fleet.capacity * count;
        residual = residual.saturating_sub(provided);
        uncovered_homed = uncovered_homed.saturating_sub(provided);
        candidates.insert(fleet.key.size, count);
    }

    candidates
}

fn plan_fleet(
    fleet: &FleetInput<'_>,
    desired_target: u32,
    pods_per_node: &BTreeMap<&str, usize>,
) -> FleetPlan {
    let mut cordon = BTreeSet::new();
    let mut uncordon = BTreeSet::new();

    if desired_target < fleet.current_target {
        // Scaling in: pick the surplus nodes to take out of service,
        // preferring nodes we already cordoned, then the least loaded,
        // then the oldest, with the name as the final deterministic
        // tie-break. Cordons applied by operators are not ours to manage
        // and are never selected.
        let surplus = (fleet.current_target - desired_target) as usize;
        let mut candidates: Vec<&Node> = fleet
            .nodes
            .iter()
            .copied()
            .filter(|n| n.cordoned_by_manager || n.schedulable)
            .collect();
        candidates.sort_by_key(|n| {
            (
                !n.cordoned_by_manager,
                pods_per_node.get(n.name.as_str()).copied().unwrap_or(0),
                n.created_at.unwrap_or(DateTime::<Utc>::MAX_UTC),
                n.name.clone(),
            )
        });

        for node in candidates.into_iter().take(surplus) {
            if !node.cordoned_by_manager {
                debug!(
                    fleet = %fleet.key,
                    node = %node.name,
                    lifecycle = node.lifecycle.as_deref().unwrap_or("unknown"),
                    "Selected node for cordon"
                );
                cordon.insert(node.name.clone());
            }
        }
    } else {
        // Not scaling in: return manager-cordoned nodes to service, newest
        // first, but only as many as the target still needs. Surplus nodes
        // the cloud has not yet reaped stay cordoned instead of bouncing
        // back into service.
        let schedulable = fleet.nodes.iter().filter(|n| n.schedulable).count();
        let needed = (desired_target as usize).saturating_sub(schedulable);
        if needed > 0 {
            let mut cordoned: Vec<&Node> = fleet
                .nodes
                .iter()
                .copied()
                .filter(|n| n.cordoned_by_manager)
                .collect();
            cordoned.sort_by_key(|n| {
                (
                    std::cmp::Reverse(n.created_at.unwrap_or(DateTime::<Utc>::MAX_UTC)),
                    n.name.clone(),
                )
            });
            for node in cordoned.into_iter().take(needed) {
                uncordon.insert(node.name.clone());
            }
        }
    }

    FleetPlan {
        key: fleet.key.clone(),
        desired_target,
        current_target: fleet.current_target,
        cordon,
        uncordon,
    }
}

fn is_usable(capacity: Resources) -> bool {
    !capacity.cpu.is_zero() && !capacity.memory.is_zero()
}

/// Nodes needed to cover `demand` at `capacity` per node, rounding up; the
/// binding dimension wins.
fn nodes_ceil(demand: Resources, capacity: Resources) -> u64 {
    demand
        .cpu
        .ceil_div(capacity.cpu)
        .max(demand.memory.ceil_div(capacity.memory))
}

/// Whole nodes of `capacity` that fit inside `demand`, rounding down; the
/// binding dimension wins.
fn nodes_floor(demand: Resources, capacity: Resources) -> u64 {
    (demand.cpu.millis() / capacity.cpu.millis())
        .max(demand.memory.bytes() / capacity.memory.bytes())
}

/// Pods bound to each node, counted against this sector.
fn count_sector_pods_per_node(demand: &SectorDemand) -> BTreeMap<&str, usize> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for pod in &demand.pods {
        if let Some(node_name) = pod.node_name.as_deref() {
            *counts.entry(node_name).or_default() += 1;
        }
    }
    counts
}
