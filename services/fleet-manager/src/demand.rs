//! Projects pod resource demand onto sectors.
//!
//! A pod contributes to exactly one configured sector, chosen by its
//! `sector` node selector. Pods without the selector, or selecting a sector
//! this manager does not know, are someone else's problem and are ignored.
//! Both queued and running work count: a pod already bound to a node still
//! needs its capacity to keep existing.

use std::collections::BTreeMap;

use armada_quantity::Resources;
use tracing::{debug, warn};

use crate::config::{Config, Size};
use crate::snapshot::{Pod, PodPhase, SECTOR_LABEL, SIZE_LABEL};

/// One pod's contribution to its sector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodDemand {
    pub namespace: String,
    pub name: String,
    /// Raw summed container requests, before any headroom factor.
    pub requests: Resources,
    /// Node the pod is bound to, if any.
    pub node_name: Option<String>,
    /// Fleet size the pod pinned through an explicit `size` selector.
    pub pinned_size: Option<Size>,
}

impl PodDemand {
    /// `namespace/name`, for logs.
    #[must_use]
    pub fn id(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// Exact demand totals and member pods for one sector.
#[derive(Debug, Clone, Default)]
pub struct SectorDemand {
    pub total: Resources,
    pub pods: Vec<PodDemand>,
}

/// Computes demand for every configured sector. Sectors with no matching
/// pods are present with zero demand, so idle fleets still get planned down
/// to their minimum capacity.
pub fn project(config: &Config, pods: &[Pod]) -> BTreeMap<String, SectorDemand> {
    let mut demand: BTreeMap<String, SectorDemand> = config
        .sectors
        .keys()
        .map(|name| (name.clone(), SectorDemand::default()))
        .collect();

    for pod in pods {
        let Some(sector_name) = pod.node_selector.get(SECTOR_LABEL) else {
            continue;
        };
        let Some(sector_demand) = demand.get_mut(sector_name) else {
            debug!(
                pod = %pod.id(),
                sector = %sector_name,
                "Pod selects an unconfigured sector; ignoring"
            );
            continue;
        };

        let pinned_size = match pod.node_selector.get(SIZE_LABEL) {
            Some(value) => match value.parse::<Size>() {
                Ok(size) => Some(size),
                Err(_) => {
                    warn!(
                        pod = %pod.id(),
                        size = %value,
                        "Pod pins an unrecognized size; treating as unpinned"
                    );
                    None
                }
            },
            None => None,
        };

        if pod.phase == PodPhase::Unknown {
            debug!(pod = %pod.id(), "Pod phase is unknown; counting it as running");
        }

        sector_demand.total += pod.requests;
        sector_demand.pods.push(PodDemand {
            namespace: pod.namespace.clone(),
            name: pod.name.clone(),
            requests: pod.requests,
            node_name: pod.node_name.clone(),
            pinned_size,
        });
    }

    demand
}

#[cfg(test)]
mod tests {
    use super::*;
    use armada_quantity::{Cpu, Memory};
    use crate::snapshot::PodPhase;

    fn config() -> Config {
        Config::from_yaml(
            r#"
cluster_name: batch-prod
sectors:
  primary:
    kind: memory
    fleets:
      - size: small
  coordinate:
    kind: cpu
    fleets:
      - size: small
"#,
        )
        .unwrap()
    }

    fn pod(name: &str, selector: &[(&str, &str)], cpu: &str, memory: &str) -> Pod {
        Pod {
            namespace: "jobs".to_string(),
            name: name.to_string(),
            phase: PodPhase::Pending,
            node_name: None,
            node_selector: selector
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            requests: Resources::new(Cpu::parse(cpu).unwrap(), Memory::parse(memory).unwrap()),
        }
    }

    #[test]
    fn test_pods_route_by_sector_selector() {
        let config = config();
        let pods = vec![
            pod("a", &[("sector", "primary")], "1", "4Gi"),
            pod("b", &[("sector", "primary")], "500m", "2Gi"),
            pod("c", &[("sector", "coordinate")], "2", "1Gi"),
        ];

        let demand = project(&config, &pods);
        let primary = &demand["primary"];
        assert_eq!(primary.pods.len(), 2);
        assert_eq!(primary.total.cpu, Cpu::from_millis(1500));
        assert_eq!(primary.total.memory, Memory::parse("6Gi").unwrap());

        let coordinate = &demand["coordinate"];
        assert_eq!(coordinate.pods.len(), 1);
        assert_eq!(coordinate.total.cpu, Cpu::from_cores(2));
    }

    #[test]
    fn test_unselected_and_unknown_sectors_are_ignored() {
        let config = config();
        let pods = vec![
            pod("no-selector", &[], "8", "32Gi"),
            pod("unknown", &[("sector", "warehouse")], "8", "32Gi"),
        ];

        let demand = project(&config, &pods);
        assert!(demand["primary"].total.is_zero());
        assert!(demand["primary"].pods.is_empty());
        assert!(demand["coordinate"].total.is_zero());
    }

    #[test]
    fn test_bound_pods_still_count() {
        let config = config();
        let mut bound = pod("bound", &[("sector", "primary")], "1", "4Gi");
        bound.node_name = Some("node-1".to_string());

        let demand = project(&config, &[bound]);
        assert_eq!(demand["primary"].pods.len(), 1);
        assert_eq!(
            demand["primary"].pods[0].node_name.as_deref(),
            Some("node-1")
        );
    }

    #[test]
    fn test_size_selector_pins_home_size() {
        let config = config();
        let pods = vec![
            pod("pinned", &[("sector", "primary"), ("size", "small")], "1", "1Gi"),
            pod("bogus", &[("sector", "primary"), ("size", "jumbo")], "1", "1Gi"),
        ];

        let demand = project(&config, &pods);
        assert_eq!(demand["primary"].pods[0].pinned_size, Some(Size::Small));
        assert_eq!(demand["primary"].pods[1].pinned_size, None);
    }

    #[test]
    fn test_every_configured_sector_is_present() {
        let config = config();
        let demand = project(&config, &[]);
        assert_eq!(demand.len(), 2);
        assert!(demand.contains_key("primary"));
        assert!(demand.contains_key("coordinate"));
    }
}
