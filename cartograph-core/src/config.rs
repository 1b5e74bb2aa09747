use crate::errors::ErrorKind;
use crate::prelude::*;
use crate::tenancy::TenantIsolation;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StorageKind {
    #[default]
    Embedded,
    Relational,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    #[serde(rename = "type", default)]
    pub kind: StorageKind,
    /// File path for persistent backends; empty or ":memory:" keeps data
    /// in-process.
    #[serde(default)]
    pub connection: String,
}

pub const DEFAULT_INTERVAL_MINUTES: u64 = 15;
pub const DEFAULT_FULL_SYNC_INTERVAL_HOURS: u64 = 6;
pub const DEFAULT_DISAPPEARANCE_GRACE_SYNCS: u32 = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u64,
    #[serde(default = "default_full_sync_interval_hours")]
    pub full_sync_interval_hours: u64,
    #[serde(default)]
    pub enable_drift_detection: bool,
    /// Consecutive full syncs a node may stay unobserved before it is marked
    /// deleted.
    #[serde(default = "default_grace_syncs")]
    pub disappearance_grace_syncs: u32,
}

fn default_interval_minutes() -> u64 {
    DEFAULT_INTERVAL_MINUTES
}

fn default_full_sync_interval_hours() -> u64 {
    DEFAULT_FULL_SYNC_INTERVAL_HOURS
}

fn default_grace_syncs() -> u32 {
    DEFAULT_DISAPPEARANCE_GRACE_SYNCS
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            interval_minutes: DEFAULT_INTERVAL_MINUTES,
            full_sync_interval_hours: DEFAULT_FULL_SYNC_INTERVAL_HOURS,
            enable_drift_detection: false,
            disappearance_grace_syncs: DEFAULT_DISAPPEARANCE_GRACE_SYNCS,
        }
    }
}

impl SyncConfig {
    pub fn light_interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes * 60)
    }

    pub fn full_interval(&self) -> Duration {
        Duration::from_secs(self.full_sync_interval_hours * 3600)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TenancyConfig {
    #[serde(default)]
    pub max_accounts: Option<usize>,
    #[serde(default)]
    pub max_nodes: Option<usize>,
    #[serde(default)]
    pub isolation: TenantIsolation,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    /// Provider identifiers to enable, e.g. ["aws", "kubernetes"].
    #[serde(default)]
    pub adapters: Vec<String>,
    #[serde(default)]
    pub tenancy: TenancyConfig,
}

impl Config {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Config = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sync.interval_minutes < 1 {
            return Err(
                ErrorKind::Validation("sync.intervalMinutes must be >= 1".to_string()).into(),
            );
        }
        if self.sync.full_sync_interval_hours < 1 {
            return Err(ErrorKind::Validation(
                "sync.fullSyncIntervalHours must be >= 1".to_string(),
            )
            .into());
        }
        if self.sync.disappearance_grace_syncs < 1 {
            return Err(ErrorKind::Validation(
                "sync.disappearanceGraceSyncs must be >= 1".to_string(),
            )
            .into());
        }
        if self.storage.kind == StorageKind::Relational && self.storage.connection.is_empty() {
            return Err(ErrorKind::Validation(
                "storage.connection is required for the relational backend".to_string(),
            )
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let config = Config::default();
        assert_eq!(config.sync.interval_minutes, 15);
        assert_eq!(config.sync.full_sync_interval_hours, 6);
        assert_eq!(config.sync.disappearance_grace_syncs, 2);
        assert_eq!(config.storage.kind, StorageKind::Embedded);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parses_full_toml_surface() {
        let raw = r#"
            adapters = ["aws", "kubernetes"]

            [storage]
            type = "relational"
            connection = "/var/lib/cartograph/graph.db"

            [sync]
            intervalMinutes = 5
            fullSyncIntervalHours = 12
            enableDriftDetection = true

            [tenancy]
            maxAccounts = 20
            maxNodes = 50000
            isolation = "schema"
        "#;
        let config = Config::from_toml_str(raw).unwrap();
        assert_eq!(config.storage.kind, StorageKind::Relational);
        assert_eq!(config.sync.interval_minutes, 5);
        assert!(config.sync.enable_drift_detection);
        assert_eq!(config.tenancy.max_nodes, Some(50000));
        assert_eq!(config.tenancy.isolation, TenantIsolation::Schema);
        assert_eq!(config.adapters, vec!["aws", "kubernetes"]);
        assert_eq!(config.sync.light_interval(), Duration::from_secs(300));
    }

    #[test]
    fn rejects_zero_intervals() {
        let raw = r#"
            [sync]
            intervalMinutes = 0
        "#;
        assert!(Config::from_toml_str(raw).is_err());
    }

    #[test]
    fn relational_backend_requires_connection() {
        let raw = r#"
            [storage]
            type = "relational"
        "#;
        assert!(Config::from_toml_str(raw).is_err());
    }
}
