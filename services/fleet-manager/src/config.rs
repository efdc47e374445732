//! Typed configuration for the fleet manager.
//!
//! The configuration is loaded once at startup from a YAML document and
//! validated before the control loop starts. Sizes and kinds are enumerated
//! variants rather than free-form strings, so a bad sector definition fails
//! the process instead of silently producing an unmanageable fleet.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use armada_quantity::{Cpu, Memory};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default mounted path for the configuration document.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/armada/config.yaml";

/// Errors raised while loading or validating configuration. All of these are
/// fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("a cluster name must be supplied (config key `cluster_name` or env `ARMADA_CLUSTER_NAME`)")]
    MissingClusterName,

    #[error("no sectors configured; nothing to manage")]
    NoSectors,

    #[error("sector '{sector}' has no fleets")]
    EmptySector { sector: String },

    #[error("sector '{sector}' defines size '{size}' more than once")]
    DuplicateSize { sector: String, size: Size },

    #[error("sleep_interval must be at least 1 second")]
    InvalidSleepInterval,

    #[error("default_over_subscription must be a finite value >= 0")]
    InvalidOverSubscription,
}

/// T-shirt size of a fleet's nodes. Ordering follows capacity, smallest
/// first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Size {
    XSmall,
    Small,
    Medium,
    Large,
    XLarge,
}

impl Size {
    /// All sizes, smallest first.
    pub const ALL: [Size; 5] = [
        Size::XSmall,
        Size::Small,
        Size::Medium,
        Size::Large,
        Size::XLarge,
    ];

    /// The label/tag value for this size.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Size::XSmall => "xsmall",
            Size::Small => "small",
            Size::Medium => "medium",
            Size::Large => "large",
            Size::XLarge => "xlarge",
        }
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Size {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "xsmall" => Ok(Size::XSmall),
            "small" => Ok(Size::Small),
            "medium" => Ok(Size::Medium),
            "large" => Ok(Size::Large),
            "xlarge" => Ok(Size::XLarge),
            other => Err(format!("unknown size '{other}'")),
        }
    }
}

/// Whether a fleet's instance family is optimized for memory or CPU.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Memory,
    Cpu,
}

impl Kind {
    /// The label/tag value for this kind.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Kind::Memory => "memory",
            Kind::Cpu => "cpu",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Kind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" => Ok(Kind::Memory),
            "cpu" => Ok(Kind::Cpu),
            other => Err(format!("unknown kind '{other}'")),
        }
    }
}

/// Unique identity of a managed fleet within the cluster.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FleetKey {
    pub sector: String,
    pub size: Size,
    pub kind: Kind,
}

impl FleetKey {
    /// The `{sector}-{size}` name that matches the `fleet` tag and node
    /// label applied by the infrastructure layer.
    #[must_use]
    pub fn name(&self) -> String {
        format!("{}-{}", self.sector, self.size)
    }
}

impl fmt::Display for FleetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.sector, self.size)
    }
}

/// One fleet within a sector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetSpec {
    pub size: Size,

    /// Floor for the fleet's target capacity. Zero lets the fleet scale
    /// down to nothing when there is no scheduling pressure.
    #[serde(default)]
    pub min_capacity: u32,
}

/// A named partition of the cluster. All fleets in a sector share one kind;
/// pods select into the sector via the `sector` node selector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sector {
    pub kind: Kind,
    pub fleets: Vec<FleetSpec>,
}

impl Sector {
    /// Fleet specs ordered smallest size first. `Config::validate` sorts the
    /// list, so this is the stored order.
    #[must_use]
    pub fn fleets_by_size(&self) -> &[FleetSpec] {
        &self.fleets
    }
}

/// Fleet manager configuration, immutable for the lifetime of the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Cluster this manager operates on; also the `cluster` tag and label
    /// value the infrastructure layer applies.
    #[serde(default)]
    pub cluster_name: String,

    /// Seconds between reconciliation ticks.
    #[serde(default = "default_sleep_interval")]
    pub sleep_interval: u64,

    /// Fractional headroom applied to demand so real capacity exceeds
    /// requested resources.
    #[serde(default = "default_over_subscription")]
    pub default_over_subscription: f64,

    /// CPU subtracted from each node's nominal capacity for system
    /// overhead.
    #[serde(default = "default_reserved_cpus")]
    pub reserved_cpus: Cpu,

    /// Memory subtracted from each node's nominal capacity for system
    /// overhead.
    #[serde(default = "default_reserved_memory")]
    pub reserved_memory: Memory,

    /// Managed sectors by name.
    #[serde(default)]
    pub sectors: BTreeMap<String, Sector>,
}

fn default_sleep_interval() -> u64 {
    20
}

fn default_over_subscription() -> f64 {
    0.2
}

fn default_reserved_cpus() -> Cpu {
    Cpu::from_cores(1)
}

fn default_reserved_memory() -> Memory {
    Memory::from_bytes(2_500_000_000)
}

impl Config {
    /// Loads and validates configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&contents)
    }

    /// Parses and validates configuration from a YAML document.
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let mut config: Config = serde_yaml::from_str(contents)?;

        if config.cluster_name.is_empty() {
            if let Ok(name) = std::env::var("ARMADA_CLUSTER_NAME") {
                config.cluster_name = name;
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates invariants and normalizes sector fleet ordering.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.cluster_name.is_empty() {
            return Err(ConfigError::MissingClusterName);
        }
        if self.sleep_interval < 1 {
            return Err(ConfigError::InvalidSleepInterval);
        }
        if !self.default_over_subscription.is_finite() || self.default_over_subscription < 0.0 {
            return Err(ConfigError::InvalidOverSubscription);
        }
        if self.sectors.is_empty() {
            return Err(ConfigError::NoSectors);
        }

        for (name, sector) in &mut self.sectors {
            if sector.fleets.is_empty() {
                return Err(ConfigError::EmptySector {
                    sector: name.clone(),
                });
            }
            sector.fleets.sort_by_key(|f| f.size);
            for pair in sector.fleets.windows(2) {
                if pair[0].size == pair[1].size {
                    return Err(ConfigError::DuplicateSize {
                        sector: name.clone(),
                        size: pair[0].size,
                    });
                }
            }
        }

        Ok(())
    }

    /// All configured fleets as `(key, spec)` pairs, sector by sector,
    /// smallest size first within each sector.
    pub fn fleets(&self) -> impl Iterator<Item = (FleetKey, &FleetSpec)> {
        self.sectors.iter().flat_map(|(name, sector)| {
            sector.fleets.iter().map(move |spec| {
                (
                    FleetKey {
                        sector: name.clone(),
                        size: spec.size,
                        kind: sector.kind,
                    },
                    spec,
                )
            })
        })
    }

    /// The demand headroom factor `(1 + default_over_subscription)` as an
    /// exact per-mille ratio for integer arithmetic.
    #[must_use]
    pub fn headroom_permille(&self) -> u64 {
        ((1.0 + self.default_over_subscription) * 1000.0).round() as u64
    }

    /// Timeout applied to each external call; bounded below the tick
    /// interval so a hung call cannot outlive its tick.
    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.sleep_interval.saturating_sub(1).clamp(1, 15))
    }
}
