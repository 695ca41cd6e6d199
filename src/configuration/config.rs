use log::{debug, info};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::types::WarmPool;
use crate::build_context::POD_BINARY_NAME;
use crate::error_handling::types::ConfigError;
use crate::fleet_management::types::{AutostopPolicy, FleetSettings};

/// Overrides `work_dir` when set.
pub const ENV_WORK_DIR: &str = "PODFLEET_WORK_DIR";

/// Daemon configuration, read from a TOML file.
///
/// Every field has a default, so an empty file is a valid configuration that starts a
/// fleet with no warm pools.
///
/// # Examples
///
/// ```toml
/// work_dir = "/var/lib/podfleet"
/// listen_address = "0.0.0.0:7070"
/// public_url = "10.0.0.4:7070"
///
/// [[warm_pools]]
/// base = "python"
/// dependencies = ["numpy", { package = "scikit-learn", import = "sklearn" }]
/// count = 2
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root of image build contexts and pod working directories.
    pub work_dir: PathBuf,
    /// Address the pod channel listens on.
    pub listen_address: String,
    /// `host:port` pods dial back to, when it differs from `listen_address` (NAT, bridge
    /// networks). A `tcp://` prefix is accepted.
    pub public_url: Option<String>,
    pub container_label: String,
    pub data_mount: String,
    pub docker_binary: String,
    /// Directory of `Dockerfile_<base>` files shadowing the built-in templates.
    pub template_dir: Option<PathBuf>,
    /// `podfleet-pod` executable copied into images. Defaults to the one installed next
    /// to the daemon; it must run on the base images (build it for a musl target when in
    /// doubt).
    pub pod_binary: Option<PathBuf>,
    pub reconcile_interval_secs: u64,
    pub stop_timeout_secs: u64,
    pub startup_timeout_secs: u64,
    pub provision_delay_ms: u64,
    /// CPU percentage under which a leased pod counts as idle.
    pub autostop_cpu_threshold: f64,
    pub autostop_min_rearm_secs: u64,
    pub sync_interval_ms: u64,
    /// Remove labeled containers when the daemon exits.
    pub clear_on_shutdown: bool,
    pub warm_pools: Vec<WarmPool>,
}

impl Default for Config {
    fn default() -> Self {
        let fleet = FleetSettings::default();
        Self {
            work_dir: fleet.work_dir,
            listen_address: "0.0.0.0:7070".to_string(),
            public_url: None,
            container_label: fleet.container_label,
            data_mount: fleet.data_mount,
            docker_binary: "docker".to_string(),
            template_dir: None,
            pod_binary: None,
            reconcile_interval_secs: fleet.reconcile_interval.as_secs(),
            stop_timeout_secs: fleet.autostop.stop_timeout.as_secs(),
            startup_timeout_secs: fleet.startup_timeout.as_secs(),
            provision_delay_ms: fleet.provision_delay.as_millis() as u64,
            autostop_cpu_threshold: fleet.autostop.cpu_threshold,
            autostop_min_rearm_secs: fleet.autostop.min_rearm.as_secs(),
            sync_interval_ms: 2000,
            clear_on_shutdown: false,
            warm_pools: Vec::new(),
        }
    }
}

impl Config {
    /// Reads and validates the configuration file at `path`, then applies the
    /// environment overrides.
    pub fn from_file(path: &Path) -> Result<Config, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let mut config = Config::from_toml_str(&raw)?;
        config.apply_env();
        config.validate()?;
        info!(
            "Configuration loaded from {}: {} warm pool(s)",
            path.display(),
            config.warm_pools.len()
        );
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Config, ConfigError> {
        toml::from_str(raw).map_err(|e| ConfigError::TomlError(e.to_string()))
    }

    fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var(ENV_WORK_DIR) {
            if !dir.is_empty() {
                debug!("work_dir overridden by {}: {}", ENV_WORK_DIR, dir);
                self.work_dir = PathBuf::from(dir);
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_address.trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                "listen_address must not be empty".to_string(),
            ));
        }
        if self.container_label.trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                "container_label must not be empty".to_string(),
            ));
        }
        if self.reconcile_interval_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "reconcile_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.sync_interval_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "sync_interval_ms must be at least 1".to_string(),
            ));
        }
        if !(0.0..=100.0).contains(&self.autostop_cpu_threshold) {
            return Err(ConfigError::InvalidValue(format!(
                "autostop_cpu_threshold must be a percentage, got {}",
                self.autostop_cpu_threshold
            )));
        }
        for pool in &self.warm_pools {
            if pool.cpus <= 0.0 || pool.memory_mb == 0 {
                return Err(ConfigError::InvalidValue(format!(
                    "warm pool {} needs positive cpus and memory_mb",
                    pool.fingerprint()
                )));
            }
        }
        if let Some(dir) = &self.template_dir {
            if !dir.is_dir() {
                return Err(ConfigError::DirectoryDoesNotExist(format!(
                    "template_dir {}",
                    dir.display()
                )));
            }
        }
        if let Some(binary) = &self.pod_binary {
            if !binary.is_file() {
                return Err(ConfigError::InvalidValue(format!(
                    "pod_binary {} is not a file",
                    binary.display()
                )));
            }
        }
        Ok(())
    }

    /// Path of the pod executable to ship in images: `pod_binary`, or the
    /// `podfleet-pod` sitting next to the running daemon.
    pub fn pod_binary_path(&self) -> Result<PathBuf, ConfigError> {
        let path = match &self.pod_binary {
            Some(path) => path.clone(),
            None => std::env::current_exe()?.with_file_name(POD_BINARY_NAME),
        };
        if !path.is_file() {
            return Err(ConfigError::InvalidValue(format!(
                "no {} executable at {}, set pod_binary",
                POD_BINARY_NAME,
                path.display()
            )));
        }
        Ok(path)
    }

    pub fn fleet_settings(&self) -> FleetSettings {
        FleetSettings {
            work_dir: self.work_dir.clone(),
            container_label: self.container_label.clone(),
            data_mount: self.data_mount.clone(),
            reconcile_interval: Duration::from_secs(self.reconcile_interval_secs),
            startup_timeout: Duration::from_secs(self.startup_timeout_secs),
            provision_delay: Duration::from_millis(self.provision_delay_ms),
            autostop: AutostopPolicy {
                cpu_threshold: self.autostop_cpu_threshold,
                min_rearm: Duration::from_secs(self.autostop_min_rearm_secs),
                stop_timeout: Duration::from_secs(self.stop_timeout_secs),
            },
        }
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }
}
