//! Control plane configuration file parser.
//!
//! Every section has defaults, so an empty file yields a usable (if
//! restrictive) configuration: no instance types, no machine images, and
//! zero quota for anything not listed.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{AccountType, InstanceCategory};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControlPlaneConfig {
    pub region: String,
    /// Suffix appended to `{name}.{cloud_account_id}.{region}.` for
    /// instance DNS names.
    pub dns_domain_suffix: String,
    pub availability_zones: Vec<String>,
    pub instance_types: Vec<InstanceTypeConfig>,
    pub machine_images: Vec<MachineImageConfig>,
    pub quota: QuotaConfig,
    pub watch: WatchConfig,
    pub purge: PurgeConfig,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            region: "us-dev-1".to_string(),
            dns_domain_suffix: "cloud.example.com".to_string(),
            availability_zones: vec!["us-dev-1a".to_string()],
            instance_types: Vec::new(),
            machine_images: Vec::new(),
            quota: QuotaConfig::default(),
            watch: WatchConfig::default(),
            purge: PurgeConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceTypeConfig {
    pub name: String,
    pub category: InstanceCategory,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MachineImageConfig {
    pub name: String,
    /// Allowed instance categories. Empty means any.
    #[serde(default)]
    pub instance_categories: Vec<InstanceCategory>,
    /// Allowed instance type names. Empty means any.
    #[serde(default)]
    pub instance_types: Vec<String>,
}

/// Quota tables, keyed by quota resource key (`instances/{type}`,
/// `load_balancers`, ...).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QuotaConfig {
    /// Last-resort limits applied to every account.
    pub system_default: BTreeMap<String, u64>,
    /// Default limits per account tier.
    pub account_types: BTreeMap<AccountType, BTreeMap<String, u64>>,
    /// Explicit per-account-id overrides.
    pub accounts: BTreeMap<String, BTreeMap<String, u64>>,
    /// Account id to tier. Unlisted accounts are `STANDARD`.
    pub account_directory: BTreeMap<String, AccountType>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WatchConfig {
    /// Deltas buffered per watcher before it is disconnected.
    pub buffer: usize,
    pub bookmark_interval_secs: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            buffer: 1024,
            bookmark_interval_secs: 60,
        }
    }
}

impl WatchConfig {
    pub fn bookmark_interval(&self) -> Duration {
        Duration::from_secs(self.bookmark_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PurgeConfig {
    pub interval_secs: u64,
    /// Age a finalized record must reach before it is physically removed.
    pub grace_secs: u64,
    /// Upper bound on records removed per sweep.
    pub batch_limit: usize,
    pub deactivation_interval_secs: u64,
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3600,
            grace_secs: 24 * 3600,
            batch_limit: 3600,
            deactivation_interval_secs: 3600,
        }
    }
}

impl PurgeConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }

    pub fn deactivation_interval(&self) -> Duration {
        Duration::from_secs(self.deactivation_interval_secs.max(1))
    }
}

impl ControlPlaneConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ControlPlaneConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn instance_type(&self, name: &str) -> Option<&InstanceTypeConfig> {
        self.instance_types.iter().find(|t| t.name == name)
    }

    pub fn machine_image(&self, name: &str) -> Option<&MachineImageConfig> {
        self.machine_images.iter().find(|m| m.name == name)
    }
}

impl MachineImageConfig {
    /// Whether this image may boot on the given instance type.
    pub fn is_compatible_with(&self, instance_type: &InstanceTypeConfig) -> bool {
        let category_ok = self.instance_categories.is_empty()
            || self.instance_categories.contains(&instance_type.category);
        let type_ok =
            self.instance_types.is_empty() || self.instance_types.contains(&instance_type.name);
        category_ok && type_ok
    }
}
