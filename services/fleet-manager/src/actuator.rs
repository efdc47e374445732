//! Applies planner decisions to the cluster and the cloud.
//!
//! Per fleet the write order is fixed: uncordon first (never drive
//! schedulable capacity below demand), then cordon, then adjust the fleet
//! target. The three steps are best-effort and independent; a failure is
//! logged and the next tick converges whatever is left.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::{info, warn};

use crate::clients::{bounded, ClientError, ClusterApi, FleetApi};
use crate::config::{Config, FleetKey};
use crate::planner::FleetPlan;
use crate::snapshot::FleetState;

/// A failed write against either API. The affected fleet retries next tick.
#[derive(Debug, Error)]
#[error("{op} failed for fleet {fleet}: {source}")]
pub struct ActuationError {
    pub fleet: FleetKey,
    pub op: &'static str,
    #[source]
    pub source: ClientError,
}

/// What one tick's actuation did.
#[derive(Debug, Default)]
pub struct ActuationSummary {
    pub targets_changed: usize,
    pub cordoned: usize,
    pub uncordoned: usize,
    pub errors: Vec<ActuationError>,
}

impl ActuationSummary {
    /// True when no write was applied or attempted.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.targets_changed == 0
            && self.cordoned == 0
            && self.uncordoned == 0
            && self.errors.is_empty()
    }
}

/// Applies every non-empty plan. Without `live`, writes are logged and
/// skipped.
pub async fn apply(
    config: &Config,
    live: bool,
    plans: &[FleetPlan],
    states: &BTreeMap<FleetKey, FleetState>,
    cluster: &dyn ClusterApi,
    fleets: &dyn FleetApi,
) -> ActuationSummary {
    let timeout = config.call_timeout();
    let mut summary = ActuationSummary::default();

    for plan in plans {
        if plan.is_empty() {
            continue;
        }
        let Some(state) = states.get(&plan.key) else {
            // Planned from a stale state; nothing to write against.
            continue;
        };

        for node in &plan.uncordon {
            if !live {
                info!(fleet = %plan.key, node = %node, "Dry-run: would uncordon node");
                continue;
            }
            match bounded(timeout, cluster.set_unschedulable(node, false)).await {
                Ok(()) => {
                    info!(fleet = %plan.key, node = %node, "Uncordoned node");
                    summary.uncordoned += 1;
                }
                Err(source) => summary.errors.push(ActuationError {
                    fleet: plan.key.clone(),
                    op: "uncordon",
                    source,
                }),
            }
        }

        for node in &plan.cordon {
            if !live {
                info!(fleet = %plan.key, node = %node, "Dry-run: would cordon node");
                continue;
            }
            match bounded(timeout, cluster.set_unschedulable(node, true)).await {
                Ok(()) => {
                    info!(fleet = %plan.key, node = %node, "Cordoned node");
                    summary.cordoned += 1;
                }
                Err(source) => summary.errors.push(ActuationError {
                    fleet: plan.key.clone(),
                    op: "cordon",
                    source,
                }),
            }
        }

        if plan.desired_target != plan.current_target {
            if !live {
                info!(
                    fleet = %plan.key,
                    fleet_id = %state.fleet_id,
                    current_target = plan.current_target,
                    desired_target = plan.desired_target,
                    "Dry-run: would modify fleet target capacity"
                );
                continue;
            }
            match bounded(
                timeout,
                fleets.modify_target_capacity(&state.fleet_id, plan.desired_target),
            )
            .await
            {
                Ok(()) => {
                    info!(
                        fleet = %plan.key,
                        fleet_id = %state.fleet_id,
                        current_target = plan.current_target,
                        desired_target = plan.desired_target,
                        "Modified fleet target capacity"
                    );
                    summary.targets_changed += 1;
                }
                Err(source) => summary.errors.push(ActuationError {
                    fleet: plan.key.clone(),
                    op: "modify target capacity",
                    source,
                }),
            }
        }
    }

    for error in &summary.errors {
        warn!(error = %error, "Actuation step failed; will retry next tick");
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use crate::clients::{FakeClusterApi, FakeFleetApi, NodeBuilder};
    use crate::config::{Kind, Size};

    fn config() -> Config {
        Config::from_yaml(
            r#"
cluster_name: batch-prod
sectors:
  primary:
    kind: memory
    fleets:
      - size: small
"#,
        )
        .unwrap()
    }

    fn key() -> FleetKey {
        FleetKey {
            sector: "primary".to_string(),
            size: Size::Small,
            kind: Kind::Memory,
        }
    }

    fn state() -> BTreeMap<FleetKey, FleetState> {
        let mut states = BTreeMap::new();
        states.insert(
            key(),
            FleetState {
                key: key(),
                fleet_id: "fleet-a".to_string(),
                target_capacity: 3,
                instance_ids: vec![],
            },
        );
        states
    }

    fn plan(cordon: &[&str], uncordon: &[&str], desired: u32) -> FleetPlan {
        FleetPlan {
            key: key(),
            desired_target: desired,
            current_target: 3,
            cordon: cordon.iter().map(|s| s.to_string()).collect(),
            uncordon: uncordon.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn cluster_with(names: &[&str]) -> FakeClusterApi {
        let api = FakeClusterApi::new();
        for name in names {
            api.add_node(
                NodeBuilder::new(name, "batch-prod", "primary", Size::Small, Kind::Memory).build(),
            );
        }
        api
    }

    #[tokio::test]
    async fn test_live_apply_orders_uncordon_before_cordon() {
        let config = config();
        let cluster = cluster_with(&["node-a", "node-b"]);
        let fleets = FakeFleetApi::new();
        fleets.add_fleet("fleet-a", "batch-prod", "primary", Size::Small, 3);

        let plans = vec![plan(&["node-b"], &["node-a"], 2)];
        let summary = apply(&config, true, &plans, &state(), &cluster, &fleets).await;

        assert!(summary.errors.is_empty());
        assert_eq!(
            cluster.patches(),
            vec![("node-a".to_string(), false), ("node-b".to_string(), true)]
        );
        assert_eq!(fleets.modifications(), vec![("fleet-a".to_string(), 2)]);
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let config = config();
        let cluster = cluster_with(&["node-a"]);
        let fleets = FakeFleetApi::new();
        fleets.add_fleet("fleet-a", "batch-prod", "primary", Size::Small, 3);

        let plans = vec![plan(&["node-a"], &[], 1)];
        let summary = apply(&config, false, &plans, &state(), &cluster, &fleets).await;

        assert!(summary.is_noop());
        assert!(cluster.patches().is_empty());
        assert!(fleets.modifications().is_empty());
        assert_eq!(fleets.target_of("fleet-a"), Some(3));
    }

    #[tokio::test]
    async fn test_empty_plans_are_skipped() {
        let config = config();
        let cluster = cluster_with(&[]);
        let fleets = FakeFleetApi::new();
        fleets.add_fleet("fleet-a", "batch-prod", "primary", Size::Small, 3);

        let plans = vec![FleetPlan {
            key: key(),
            desired_target: 3,
            current_target: 3,
            cordon: BTreeSet::new(),
            uncordon: BTreeSet::new(),
        }];
        let summary = apply(&config, true, &plans, &state(), &cluster, &fleets).await;
        assert!(summary.is_noop());
        assert!(fleets.modifications().is_empty());
    }

    #[tokio::test]
    async fn test_partial_failure_does_not_roll_back() {
        let config = config();
        let cluster = cluster_with(&["node-a"]);
        let fleets = FakeFleetApi::new();
        fleets.add_fleet("fleet-a", "batch-prod", "primary", Size::Small, 3);
        fleets.fail_modifies("throttled");

        let plans = vec![plan(&["node-a"], &[], 2)];
        let summary = apply(&config, true, &plans, &state(), &cluster, &fleets).await;

        // The cordon landed even though the capacity change failed.
        assert_eq!(summary.cordoned, 1);
        assert_eq!(summary.errors.len(), 1);
        assert_eq!(summary.errors[0].op, "modify target capacity");
        assert_eq!(cluster.patches(), vec![("node-a".to_string(), true)]);
        assert_eq!(fleets.target_of("fleet-a"), Some(3));
    }
}
