use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, StoreError};

/// Sentinel instance id that asks the store to generate one at startup.
pub const AUTO_INSTANCE_ID: &str = "AUTO";
/// Default cluster heartbeat cadence.
pub const DEFAULT_CHECKIN_INTERVAL_MS: i64 = 7_500;
/// A trigger this far past its fire time counts as misfired.
pub const DEFAULT_MISFIRE_THRESHOLD_MS: i64 = 60_000;
/// Misfired triggers handled per recovery pass.
pub const DEFAULT_MAX_MISFIRES_PER_PASS: usize = 20;
/// A peer whose heartbeat is older than `checkin_interval × this` is failed.
pub const CHECKIN_FAILURE_FACTOR: i64 = 4;

/// Store configuration (tickvault.toml + TICKVAULT_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Unique id of this scheduler instance, or `AUTO` to generate one.
    #[serde(default = "default_instance_id")]
    pub instance_id: String,

    /// Enables the check-in heartbeat and failed-peer recovery.
    #[serde(default)]
    pub is_clustered: bool,

    /// How often `do_checkin` runs when clustered, in milliseconds.
    #[serde(default = "default_checkin_interval_ms")]
    pub cluster_checkin_interval_ms: i64,

    /// How late a WAITING trigger may fire before misfire policy applies.
    #[serde(default = "default_misfire_threshold_ms")]
    pub misfire_threshold_ms: i64,

    /// Batch size per `recover_misfired_jobs` pass.
    #[serde(default = "default_max_misfires")]
    pub max_misfires_to_handle_at_a_time: usize,

    /// Serialize plain inserts under the trigger lock. Bulk loaders can
    /// clear this and accept insert races on fresh rows.
    #[serde(default = "default_true")]
    pub lock_on_insert: bool,

    /// Database-row locks (cluster-safe) vs an in-process mutex
    /// (single-instance deployments only).
    #[serde(default = "default_true")]
    pub use_db_locks: bool,

    /// Dialect override for the row-lock statement. `?1` is the lock name.
    #[serde(default)]
    pub select_with_lock_sql: Option<String>,

    /// Path of the SQLite database file backing the store.
    #[serde(default = "default_data_source")]
    pub data_source: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            instance_id: default_instance_id(),
            is_clustered: false,
            cluster_checkin_interval_ms: default_checkin_interval_ms(),
            misfire_threshold_ms: default_misfire_threshold_ms(),
            max_misfires_to_handle_at_a_time: default_max_misfires(),
            lock_on_insert: true,
            use_db_locks: true,
            select_with_lock_sql: None,
            data_source: default_data_source(),
        }
    }
}

fn default_instance_id() -> String {
    AUTO_INSTANCE_ID.to_string()
}
fn default_checkin_interval_ms() -> i64 {
    DEFAULT_CHECKIN_INTERVAL_MS
}
fn default_misfire_threshold_ms() -> i64 {
    DEFAULT_MISFIRE_THRESHOLD_MS
}
fn default_max_misfires() -> usize {
    DEFAULT_MAX_MISFIRES_PER_PASS
}
fn default_true() -> bool {
    true
}
fn default_data_source() -> String {
    "tickvault.db".to_string()
}

impl StoreConfig {
    /// Load config from a TOML file with TICKVAULT_* env var overrides.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path.unwrap_or("tickvault.toml");

        let config: StoreConfig = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("TICKVAULT_"))
            .extract()
            .map_err(|e| StoreError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the store cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.misfire_threshold_ms < 1 {
            return Err(StoreError::Config(
                "misfire_threshold_ms must be at least 1".into(),
            ));
        }
        if self.cluster_checkin_interval_ms < 1 {
            return Err(StoreError::Config(
                "cluster_checkin_interval_ms must be at least 1".into(),
            ));
        }
        if self.is_clustered && !self.use_db_locks {
            // In-process locks cannot serialize peers in other processes.
            return Err(StoreError::Config(
                "clustered mode requires use_db_locks".into(),
            ));
        }
        if self.instance_id.trim().is_empty() {
            return Err(StoreError::Config("instance_id must not be empty".into()));
        }
        Ok(())
    }

    /// Resolve `AUTO` into a concrete per-process instance id.
    pub fn resolve_instance_id(&self) -> String {
        if self.instance_id != AUTO_INSTANCE_ID {
            return self.instance_id.clone();
        }
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        format!("{host}-{}", Uuid::new_v4().simple())
    }
}
