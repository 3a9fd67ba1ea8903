//! Explicit configuration, loaded once and passed by value/reference
//! into every constructor that needs it.
//!
//! The original `mm_cfg` module is process-wide mutable state; nothing
//! here is. Construct a [`Config`] with [`Config::load`] (or
//! [`Config::default`] for tests) and thread it through.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use mailman_retry::RetryConfig;
use serde::{Deserialize, Serialize};

/// The environment variable naming the administrative list used as
/// the `From` identity for site-generated notifications.
pub const SITE_LIST_ENV: &str = "MAILMAN_SITE_LIST";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(with = "humantime_serde", default = "default_lease")]
    pub lease: Duration,
    #[serde(with = "humantime_serde", default = "default_lock_timeout")]
    pub timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_retry_interval")]
    pub retry_interval: Duration,
}

fn default_lease() -> Duration {
    Duration::from_secs(15 * 60)
}
fn default_lock_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_retry_interval() -> Duration {
    Duration::from_millis(100)
}

impl Default for LockConfig {
    fn default() -> Self {
        Self { lease: default_lease(), timeout: default_lock_timeout(), retry_interval: default_retry_interval() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct QueueConfig {
    /// Worker count per runner name; a runner not listed here runs
    /// with a single worker (slice 0, range 1).
    #[serde(default)]
    pub workers: BTreeMap<String, u32>,
}

impl QueueConfig {
    pub fn worker_count(&self, runner: &str) -> u32 {
        self.workers.get(runner).copied().unwrap_or(1).max(1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModerationConfig {
    #[serde(with = "humantime_serde", default = "default_sweep_interval")]
    pub sweep_interval: Duration,
    #[serde(default = "default_max_days_to_hold")]
    pub max_days_to_hold: i64,
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(15 * 60)
}
fn default_max_days_to_hold() -> i64 {
    14
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self { sweep_interval: default_sweep_interval(), max_days_to_hold: default_max_days_to_hold() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BounceConfig {
    pub threshold: f64,
    pub stale_after_days: i64,
    #[serde(with = "humantime_serde", default = "default_warn_interval")]
    pub warn_interval: Duration,
    pub max_warnings: u32,
}

fn default_warn_interval() -> Duration {
    Duration::from_secs(3 * 24 * 3600)
}

impl Default for BounceConfig {
    fn default() -> Self {
        Self { threshold: 5.0, stale_after_days: 7, warn_interval: default_warn_interval(), max_warnings: 3 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MasterConfig {
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
}

fn default_max_restarts() -> u32 {
    5
}

/// All runtime knobs for the engine, loaded once at process start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root of the Mailman data tree (queues, list stores, pid file).
    #[serde(default = "default_prefix")]
    pub prefix: PathBuf,
    /// Administrative list used as the `From` identity for
    /// site-generated notifications. Overridden by `MAILMAN_SITE_LIST`.
    #[serde(default = "default_site_list")]
    pub site_list: String,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub moderation: ModerationConfig,
    #[serde(default)]
    pub bounce: BounceConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub master: MasterConfig,
}

fn default_prefix() -> PathBuf {
    PathBuf::from("/var/lib/mailman")
}

fn default_site_list() -> String {
    "mailman".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            site_list: default_site_list(),
            lock: LockConfig::default(),
            queue: QueueConfig::default(),
            moderation: ModerationConfig::default(),
            bounce: BounceConfig::default(),
            retry: RetryConfig::default(),
            master: MasterConfig::default(),
        }
    }
}

impl Config {
    /// Load from a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Defaults, with only environment overrides applied (no file).
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(site_list) = std::env::var(SITE_LIST_ENV) {
            self.site_list = site_list;
        }
    }

    pub fn queue_dir(&self, name: &str) -> PathBuf {
        self.prefix.join("qfiles").join(name)
    }

    pub fn list_data_dir(&self, list_name: &str) -> PathBuf {
        self.prefix.join("lists").join(list_name)
    }

    pub fn master_pid_path(&self) -> PathBuf {
        self.prefix.join("data").join("master-qrunner.pid")
    }

    pub fn master_lock_path(&self) -> PathBuf {
        self.prefix.join("locks").join("master-qrunner")
    }

    pub fn list_lock_path(&self, list_name: &str) -> PathBuf {
        self.prefix.join("locks").join(format!("{list_name}.lock"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_config_has_sane_values() {
        let config = Config::default();
        assert_eq!(config.site_list, "mailman");
        assert_eq!(config.moderation.max_days_to_hold, 14);
        assert_eq!(config.bounce.threshold, 5.0);
    }

    #[test]
    fn queue_worker_count_defaults_to_one() {
        let config = Config::default();
        assert_eq!(config.queue.worker_count("outgoing"), 1);
    }

    #[test]
    fn load_parses_toml_file() {
        let td = tempdir().unwrap();
        let path = td.path().join("mailman.toml");
        std::fs::write(
            &path,
            r#"
            prefix = "/opt/mailman"
            site_list = "sitelist"

            [bounce]
            threshold = 3.0
            stale_after_days = 10
            warn_interval = "2days"
            max_warnings = 2
            "#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.prefix, PathBuf::from("/opt/mailman"));
        assert_eq!(config.site_list, "sitelist");
        assert_eq!(config.bounce.threshold, 3.0);
        assert_eq!(config.bounce.warn_interval, Duration::from_secs(2 * 24 * 3600));
    }

    #[test]
    fn env_override_wins_over_file() {
        let td = tempdir().unwrap();
        let path = td.path().join("mailman.toml");
        std::fs::write(&path, "site_list = \"file-list\"\n").unwrap();

        // SAFETY: test-only, single-threaded within this test body.
        unsafe { std::env::set_var(SITE_LIST_ENV, "env-list") };
        let config = Config::load(&path).unwrap();
        unsafe { std::env::remove_var(SITE_LIST_ENV) };

        assert_eq!(config.site_list, "env-list");
    }

    #[test]
    fn queue_dir_paths_are_derived_from_prefix() {
        let config = Config { prefix: PathBuf::from("/srv/mailman"), ..Config::default() };
        assert_eq!(config.queue_dir("incoming"), PathBuf::from("/srv/mailman/qfiles/incoming"));
        assert_eq!(
            config.master_pid_path(),
            PathBuf::from("/srv/mailman/data/master-qrunner.pid")
        );
    }
}
