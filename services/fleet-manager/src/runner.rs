//! The control loop.
//!
//! One tick is a full reconciliation: snapshot the cluster and every
//! configured fleet, project demand onto sectors, plan each fleet, and
//! actuate. No state survives between ticks other than the configuration;
//! whatever a tick could not observe or write, the next tick picks up.

use std::sync::Arc;
use std::time::Duration;

use armada_quantity::Resources;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::actuator::{self, ActuationSummary};
use crate::catalog;
use crate::clients::{ClusterApi, FleetApi};
use crate::config::{Config, FleetKey};
use crate::demand;
use crate::planner::{self, FleetInput, FleetPlan};
use crate::snapshot::{self, SnapshotError};

/// Outcome of a single reconciliation tick.
#[derive(Debug)]
pub struct TickOutcome {
    /// Plans for every fleet with a healthy cloud read, empty ones
    /// included.
    pub plans: Vec<FleetPlan>,

    /// Fleets excluded from this tick.
    pub fleet_errors: Vec<SnapshotError>,

    /// What actuation did with the plans.
    pub actuation: ActuationSummary,
}

impl TickOutcome {
    /// True when the tick observed a fully converged system.
    #[must_use]
    pub fn is_converged(&self) -> bool {
        self.plans.iter().all(FleetPlan::is_empty)
            && self.fleet_errors.is_empty()
            && self.actuation.is_noop()
    }
}

/// The reconciliation engine, wired to its two actuator seams.
pub struct Manager {
    config: Config,
    live: bool,
    cluster: Arc<dyn ClusterApi>,
    fleets: Arc<dyn FleetApi>,
}

impl Manager {
    /// Creates a manager. Without `live`, every write is logged and
    /// skipped.
    pub fn new(
        config: Config,
        live: bool,
        cluster: Arc<dyn ClusterApi>,
        fleets: Arc<dyn FleetApi>,
    ) -> Self {
        Self {
            config,
            live,
            cluster,
            fleets,
        }
    }

    /// Runs one reconciliation tick. A cluster read failure aborts the tick
    /// before any planning; per-fleet cloud failures exclude only the
    /// affected fleet.
    pub async fn tick(&self) -> Result<TickOutcome, SnapshotError> {
        let cluster_snapshot = snapshot::read_cluster(self.cluster.as_ref(), &self.config).await?;
        let (fleet_states, fleet_errors) =
            snapshot::read_fleets(self.fleets.as_ref(), &self.config).await;
        for fleet_error in &fleet_errors {
            warn!(error = %fleet_error, "Excluding fleet from this tick");
        }
        for state in fleet_states.values() {
            let joined = cluster_snapshot.fleet_nodes(&state.key).len();
            if state.instance_ids.len() > joined {
                debug!(
                    fleet = %state.key,
                    instances = state.instance_ids.len(),
                    joined,
                    "Fleet has instances not yet joined to the cluster"
                );
            }
        }

        let sector_demand = demand::project(&self.config, &cluster_snapshot.pods);
        let headroom = self.config.headroom_permille();
        let reserved = Resources::new(self.config.reserved_cpus, self.config.reserved_memory);

        let mut plans = Vec::new();
        for (sector_name, sector) in &self.config.sectors {
            // Every configured fleet participates in demand packing, even
            // one whose cloud read failed; its own plan is withheld below
            // so no action is taken on stale data.
            let inputs: Vec<FleetInput<'_>> = sector
                .fleets_by_size()
                .iter()
                .map(|spec| {
                    let key = FleetKey {
                        sector: sector_name.clone(),
                        size: spec.size,
                        kind: sector.kind,
                    };
                    FleetInput {
                        min_capacity: spec.min_capacity,
                        capacity: catalog::schedulable(spec.size, sector.kind, reserved),
                        current_target: fleet_states
                            .get(&key)
                            .map(|s| s.target_capacity)
                            .unwrap_or(0),
                        nodes: cluster_snapshot.fleet_nodes(&key),
                        key,
                    }
                })
                .collect();

            let demand = &sector_demand[sector_name];
            plans.extend(
                planner::plan_sector(demand, headroom, &inputs)
                    .into_iter()
                    .filter(|plan| fleet_states.contains_key(&plan.key)),
            );
        }

        let actuation = actuator::apply(
            &self.config,
            self.live,
            &plans,
            &fleet_states,
            self.cluster.as_ref(),
            self.fleets.as_ref(),
        )
        .await;

        Ok(TickOutcome {
            plans,
            fleet_errors,
            actuation,
        })
    }

    /// Runs the loop until shutdown is signaled. Each iteration completes,
    /// including its actuation, before the loop observes the signal.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            live = self.live,
            sleep_interval_secs = self.config.sleep_interval,
            cluster = %self.config.cluster_name,
            "Starting reconciliation loop"
        );

        let mut interval = tokio::time::interval(Duration::from_secs(self.config.sleep_interval));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick().await {
                        Ok(outcome) => self.log_outcome(&outcome),
                        Err(e) => error!(error = %e, "Skipping tick"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Reconciliation loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Steady state stays quiet; changes and errors are loud.
    fn log_outcome(&self, outcome: &TickOutcome) {
        if outcome.is_converged() {
            debug!(fleets = outcome.plans.len(), "Reconciliation pass complete, no changes");
            return;
        }

        for plan in &outcome.plans {
            if plan.is_empty() {
                continue;
            }
            info!(
                fleet = %plan.key,
                current_target = plan.current_target,
                desired_target = plan.desired_target,
                cordon = plan.cordon.len(),
                uncordon = plan.uncordon.len(),
                "Reallocating fleet"
            );
        }
        info!(
            live = self.live,
            fleets = outcome.plans.len(),
            excluded = outcome.fleet_errors.len(),
            targets_changed = outcome.actuation.targets_changed,
            cordoned = outcome.actuation.cordoned,
            uncordoned = outcome.actuation.uncordoned,
            actuation_errors = outcome.actuation.errors.len(),
            "Reconciliation pass complete"
        );
    }
}
