//! Full reconciliation ticks against the deterministic fakes.
//!
//! These exercise the whole pipeline the way the control loop runs it:
//! snapshot, project, plan, actuate, and then a second tick to verify the
//! system converged.

use std::sync::Arc;

use armada_fleet_manager::clients::{FakeClusterApi, FakeFleetApi, NodeBuilder, PodBuilder};
use armada_fleet_manager::config::{Config, Kind, Size};
use armada_fleet_manager::runner::Manager;
use chrono::{TimeZone, Utc};

const CLUSTER: &str = "batch-prod";

fn primary_config() -> Config {
    Config::from_yaml(
        r#"
cluster_name: batch-prod
default_over_subscription: 0.2
reserved_cpus: "1"
reserved_memory: "2.5Gi"
sectors:
  primary:
    kind: memory
    fleets:
      - size: small
        min_capacity: 0
      - size: medium
        min_capacity: 0
"#,
    )
    .unwrap()
}

fn manager(
    config: Config,
    live: bool,
    cluster: &Arc<FakeClusterApi>,
    fleets: &Arc<FakeFleetApi>,
) -> Manager {
    Manager::new(config, live, cluster.clone(), fleets.clone())
}

#[tokio::test]
async fn scale_up_from_zero_converges_in_one_tick() {
    let cluster = Arc::new(FakeClusterApi::new());
    let fleets = Arc::new(FakeFleetApi::new());
    fleets.add_fleet("fleet-small", CLUSTER, "primary", Size::Small, 0);
    fleets.add_fleet("fleet-medium", CLUSTER, "primary", Size::Medium, 0);
    cluster.add_pod(
        PodBuilder::new("jobs", "queued")
            .sector("primary")
            .requests("3", "20Gi")
            .build(),
    );

    let manager = manager(primary_config(), true, &cluster, &fleets);

    let outcome = manager.tick().await.unwrap();
    assert!(outcome.fleet_errors.is_empty());
    assert_eq!(outcome.actuation.targets_changed, 1);
    assert_eq!(fleets.modifications(), vec![("fleet-medium".to_string(), 1)]);
    assert_eq!(fleets.target_of("fleet-medium"), Some(1));
    assert_eq!(fleets.target_of("fleet-small"), Some(0));

    // The applied state re-reads as converged.
    let second = manager.tick().await.unwrap();
    assert!(second.is_converged());
    assert_eq!(fleets.modifications().len(), 1);
}

#[tokio::test]
async fn dry_run_plans_but_writes_nothing() {
    let cluster = Arc::new(FakeClusterApi::new());
    let fleets = Arc::new(FakeFleetApi::new());
    fleets.add_fleet("fleet-small", CLUSTER, "primary", Size::Small, 0);
    fleets.add_fleet("fleet-medium", CLUSTER, "primary", Size::Medium, 0);
    cluster.add_pod(
        PodBuilder::new("jobs", "queued")
            .sector("primary")
            .requests("3", "20Gi")
            .build(),
    );

    let manager = manager(primary_config(), false, &cluster, &fleets);

    let outcome = manager.tick().await.unwrap();
    let medium = outcome
        .plans
        .iter()
        .find(|p| p.key.size == Size::Medium)
        .unwrap();
    assert_eq!(medium.desired_target, 1);

    // The plan exists; nothing was written.
    assert!(outcome.actuation.is_noop());
    assert!(fleets.modifications().is_empty());
    assert!(cluster.patches().is_empty());
}

#[tokio::test]
async fn cluster_read_failure_aborts_the_tick_without_writes() {
    let cluster = Arc::new(FakeClusterApi::new());
    let fleets = Arc::new(FakeFleetApi::new());
    fleets.add_fleet("fleet-small", CLUSTER, "primary", Size::Small, 3);
    cluster.fail_lists("api server unavailable");

    let manager = manager(primary_config(), true, &cluster, &fleets);

    assert!(manager.tick().await.is_err());
    assert!(fleets.modifications().is_empty());
    assert!(cluster.patches().is_empty());
}

#[tokio::test]
async fn missing_fleet_is_excluded_while_others_proceed() {
    let config = Config::from_yaml(
        r#"
cluster_name: batch-prod
default_over_subscription: 0.2
reserved_cpus: "1"
reserved_memory: "2.5Gi"
sectors:
  primary:
    kind: memory
    fleets:
      - size: small
        min_capacity: 1
  coordinate:
    kind: cpu
    fleets:
      - size: small
        min_capacity: 2
"#,
    )
    .unwrap();

    let cluster = Arc::new(FakeClusterApi::new());
    let fleets = Arc::new(FakeFleetApi::new());
    // Only the primary fleet exists in the cloud.
    fleets.add_fleet("fleet-primary-small", CLUSTER, "primary", Size::Small, 0);

    let manager = manager(config, true, &cluster, &fleets);

    let outcome = manager.tick().await.unwrap();
    assert_eq!(outcome.fleet_errors.len(), 1);
    assert!(outcome.fleet_errors[0]
        .to_string()
        .contains("coordinate-small"));

    // The healthy fleet was still raised to its minimum.
    assert_eq!(
        fleets.modifications(),
        vec![("fleet-primary-small".to_string(), 1)]
    );
    // No plan was emitted for the unreadable fleet.
    assert!(outcome.plans.iter().all(|p| p.key.sector == "primary"));
}

#[tokio::test]
async fn scale_in_cordons_surplus_then_holds_steady() {
    let config = Config::from_yaml(
        r#"
cluster_name: batch-prod
default_over_subscription: 0.2
reserved_cpus: "1"
reserved_memory: "2.5Gi"
sectors:
  primary:
    kind: memory
    fleets:
      - size: small
        min_capacity: 1
"#,
    )
    .unwrap();

    let cluster = Arc::new(FakeClusterApi::new());
    let fleets = Arc::new(FakeFleetApi::new());
    fleets.add_fleet("fleet-small", CLUSTER, "primary", Size::Small, 3);
    for (name, year) in [("node-a", 2022), ("node-b", 2023), ("node-c", 2024)] {
        cluster.add_node(
            NodeBuilder::new(name, CLUSTER, "primary", Size::Small, Kind::Memory)
                .created_at(Utc.with_ymd_and_hms(year, 1, 1, 0, 0, 0).unwrap())
                .build(),
        );
    }

    let manager = manager(config, true, &cluster, &fleets);

    let outcome = manager.tick().await.unwrap();
    assert_eq!(outcome.actuation.cordoned, 2);
    assert_eq!(
        cluster.patches(),
        vec![("node-a".to_string(), true), ("node-b".to_string(), true)]
    );
    assert_eq!(fleets.target_of("fleet-small"), Some(1));

    // Next tick: target matches, the cordoned nodes wait for the cloud to
    // reap them, and nothing flaps.
    let second = manager.tick().await.unwrap();
    assert!(second.is_converged());
    assert_eq!(cluster.patches().len(), 2);
}

#[tokio::test]
async fn returning_demand_uncordons_before_anything_else() {
    let config = Config::from_yaml(
        r#"
cluster_name: batch-prod
default_over_subscription: 0.0
reserved_cpus: "1"
reserved_memory: "2.5Gi"
sectors:
  primary:
    kind: memory
    fleets:
      - size: small
        min_capacity: 1
"#,
    )
    .unwrap();

    let cluster = Arc::new(FakeClusterApi::new());
    let fleets = Arc::new(FakeFleetApi::new());
    fleets.add_fleet("fleet-small", CLUSTER, "primary", Size::Small, 2);
    for name in ["node-a", "node-b"] {
        cluster.add_node(
            NodeBuilder::new(name, CLUSTER, "primary", Size::Small, Kind::Memory)
                .cordoned_by_manager()
                .build(),
        );
    }
    for name in ["burst-1", "burst-2"] {
        cluster.add_pod(
            PodBuilder::new("jobs", name)
                .sector("primary")
                .requests("2", "20Gi")
                .build(),
        );
    }

    let manager = manager(config, true, &cluster, &fleets);

    let outcome = manager.tick().await.unwrap();
    assert_eq!(outcome.actuation.uncordoned, 2);
    assert_eq!(outcome.actuation.cordoned, 0);
    assert_eq!(
        cluster.patches(),
        vec![("node-a".to_string(), false), ("node-b".to_string(), false)]
    );
    // Target already matched demand; only schedulability changed, and the
    // manager's marker label came off with the cordon.
    assert!(fleets.modifications().is_empty());
    let node = cluster.node("node-a").unwrap();
    assert_eq!(node.spec.unwrap().unschedulable, Some(false));
    assert!(!node
        .metadata
        .labels
        .unwrap()
        .contains_key("armada.io/cordoned"));

    let second = manager.tick().await.unwrap();
    assert!(second.is_converged());
}

#[tokio::test]
async fn operator_cordons_are_preserved() {
    let config = Config::from_yaml(
        r#"
cluster_name: batch-prod
default_over_subscription: 0.2
reserved_cpus: "1"
reserved_memory: "2.5Gi"
sectors:
  primary:
    kind: memory
    fleets:
      - size: small
        min_capacity: 0
"#,
    )
    .unwrap();

    let cluster = Arc::new(FakeClusterApi::new());
    let fleets = Arc::new(FakeFleetApi::new());
    fleets.add_fleet("fleet-small", CLUSTER, "primary", Size::Small, 1);
    cluster.add_node(
        NodeBuilder::new("node-held", CLUSTER, "primary", Size::Small, Kind::Memory)
            .unschedulable()
            .build(),
    );

    let manager = manager(config, true, &cluster, &fleets);

    // Scaling 1 -> 0: the operator's cordon is not ours to touch, so the
    // target drops but no node is patched.
    let outcome = manager.tick().await.unwrap();
    assert_eq!(fleets.target_of("fleet-small"), Some(0));
    assert!(cluster.patches().is_empty());
    assert_eq!(outcome.actuation.cordoned, 0);
}
