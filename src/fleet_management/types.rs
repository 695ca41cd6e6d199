//! Core types used by the fleet management subsystem.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use uuid::Uuid;

use crate::channel::types::PodControl;
use crate::error_handling::types::FleetError;
use crate::file_sync::BindSpec;

/// Identifier of the account a pod is leased to.
pub type AccountId = String;

/// Runtime base image family of a pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Base {
    Python,
    Pytorch,
    Js,
}

impl Base {
    pub fn as_str(&self) -> &'static str {
        match self {
            Base::Python => "python",
            Base::Pytorch => "pytorch",
            Base::Js => "js",
        }
    }
}

impl fmt::Display for Base {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A package installed into a pod image and the name it is imported under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Dependency {
    pub package: String,
    pub import: String,
}

impl Dependency {
    pub fn new(package: impl Into<String>, import: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            import: import.into(),
        }
    }

    /// A dependency whose package and import names are the same.
    pub fn named(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            import: name.clone(),
            package: name,
        }
    }
}

/// Identifies a class of interchangeable pods.
///
/// Dependencies are kept in a `BTreeSet`, so two fingerprints built from the same
/// dependencies in any order compare, hash and tag identically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint {
    base: Base,
    dependencies: BTreeSet<Dependency>,
}

impl Fingerprint {
    pub fn new(base: Base, dependencies: impl IntoIterator<Item = Dependency>) -> Self {
        Self {
            base,
            dependencies: dependencies.into_iter().collect(),
        }
    }

    pub fn base(&self) -> Base {
        self.base
    }

    pub fn dependencies(&self) -> impl Iterator<Item = &Dependency> {
        self.dependencies.iter()
    }

    /// Image tag for this fingerprint, e.g. `pf-python-numpy-pandas`.
    ///
    /// Docker only accepts `[a-z0-9_.-]` in a tag component, anything else is
    /// replaced by `_`.
    pub fn tag(&self) -> String {
        static INVALID: OnceLock<Regex> = OnceLock::new();
        let invalid = INVALID.get_or_init(|| Regex::new(r"[^a-z0-9_.-]+").expect("static regex"));

        let mut parts = vec!["pf".to_string(), self.base.as_str().to_string()];
        for dep in &self.dependencies {
            let lowered = dep.package.to_lowercase();
            parts.push(invalid.replace_all(&lowered, "_").into_owned());
        }
        parts.join("-")
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag())
    }
}

/// Resource limits applied to each container of a provisioning call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    pub cpus: f64,
    pub memory_mb: u64,
    pub gpu: bool,
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            cpus: 1.0,
            memory_mb: 2000,
            gpu: false,
        }
    }
}

/// Opaque pod identity, assigned by the manager before the container starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PodId(Uuid);

impl PodId {
    pub fn new() -> Self {
        PodId(Uuid::new_v4())
    }

    /// First six characters, used in human-readable pod labels.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..6].to_string()
    }
}

impl Default for PodId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Aggregate counters describing the fleet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FleetStats {
    /// Pods started and waiting in a ready pool.
    pub ready: usize,
    /// Pods currently leased to an account.
    pub leased: usize,
    /// Accounts holding at least one lease.
    pub accounts: usize,
    /// Pods successfully started since the manager was created.
    pub total_provisioned: u64,
    /// Container starts that failed.
    pub failed_starts: u64,
}

/// Knobs of the idle autostop check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AutostopPolicy {
    /// Pods below this CPU percentage are considered idle.
    pub cpu_threshold: f64,
    /// Shortest sleep between two checks.
    pub min_rearm: Duration,
    /// Bound on the remote stop call.
    pub stop_timeout: Duration,
}

impl Default for AutostopPolicy {
    fn default() -> Self {
        Self {
            cpu_threshold: 1.0,
            min_rearm: Duration::from_secs(2),
            stop_timeout: Duration::from_secs(5),
        }
    }
}

/// Settings the fleet manager runs with, derived from the configuration file.
#[derive(Debug, Clone, PartialEq)]
pub struct FleetSettings {
    /// Root of build contexts (`build/<tag>`) and pod working dirs (`pods/<id>`).
    pub work_dir: PathBuf,
    pub container_label: String,
    /// Where a pod's working dir is mounted inside its container.
    pub data_mount: String,
    pub reconcile_interval: Duration,
    pub startup_timeout: Duration,
    /// Debounce before an extra pod is provisioned after a lease.
    pub provision_delay: Duration,
    pub autostop: AutostopPolicy,
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("/var/lib/podfleet"),
            container_label: "podfleet".to_string(),
            data_mount: "/usr/src/app/data/".to_string(),
            reconcile_interval: Duration::from_secs(15),
            startup_timeout: Duration::from_secs(120),
            provision_delay: Duration::from_secs(1),
            autostop: AutostopPolicy::default(),
        }
    }
}

/// Notified after a leased pod has been released.
#[async_trait]
pub trait StopHook: Send + Sync {
    async fn on_stop(&self, pod_id: PodId) -> Result<(), FleetError>;
}

/// Parameters of a lease request.
pub struct PodRequest {
    pub fingerprint: Fingerprint,
    pub account_id: AccountId,
    pub resources: Resources,
    /// Idle time after which the pod is stopped. `None` disables autostop.
    pub autostop_timeout: Option<Duration>,
    pub stop_callback: Option<Arc<dyn StopHook>>,
    /// Keep the pod's working dir in sync with external storage while leased.
    pub bind_data: Option<BindSpec>,
    /// Start one more pod of the same fingerprint in the background after leasing.
    pub provision_extra: bool,
    pub force_rebuild: bool,
}

impl PodRequest {
    pub fn new(fingerprint: Fingerprint, account_id: impl Into<AccountId>) -> Self {
        Self {
            fingerprint,
            account_id: account_id.into(),
            resources: Resources::default(),
            autostop_timeout: None,
            stop_callback: None,
            bind_data: None,
            provision_extra: false,
            force_rebuild: false,
        }
    }

    pub fn with_autostop(mut self, timeout: Duration) -> Self {
        self.autostop_timeout = Some(timeout);
        self
    }

    pub fn with_stop_callback(mut self, hook: Arc<dyn StopHook>) -> Self {
        self.stop_callback = Some(hook);
        self
    }

    pub fn with_bind_data(mut self, bind: BindSpec) -> Self {
        self.bind_data = Some(bind);
        self
    }
}

/// A pod leased to a caller.
pub struct LeasedPod {
    pub id: PodId,
    pub control: Arc<dyn PodControl>,
}

/// Result of releasing a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Released,
    NotFound,
}
