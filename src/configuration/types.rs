use serde::Deserialize;

use crate::fleet_management::types::{Base, Dependency, Fingerprint, Resources};

/// A dependency as written in the configuration file.
///
/// Either a bare name (`"numpy"`) or a table naming the package and the module it is
/// imported under (`{ package = "scikit-learn", import = "sklearn" }`).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum DependencyEntry {
    Name(String),
    Pair { package: String, import: String },
}

impl DependencyEntry {
    pub fn to_dependency(&self) -> Dependency {
        match self {
            DependencyEntry::Name(name) => Dependency::named(name.as_str()),
            DependencyEntry::Pair { package, import } => {
                Dependency::new(package.as_str(), import.as_str())
            }
        }
    }
}

/// A `[[warm_pools]]` entry: pods provisioned at startup, ready to be leased.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WarmPool {
    pub base: Base,
    #[serde(default)]
    pub dependencies: Vec<DependencyEntry>,
    #[serde(default = "default_count")]
    pub count: usize,
    #[serde(default = "default_cpus")]
    pub cpus: f64,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
    #[serde(default)]
    pub gpu: bool,
}

fn default_count() -> usize {
    1
}

fn default_cpus() -> f64 {
    Resources::default().cpus
}

fn default_memory_mb() -> u64 {
    Resources::default().memory_mb
}

impl WarmPool {
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::new(
            self.base,
            self.dependencies.iter().map(DependencyEntry::to_dependency),
        )
    }

    pub fn resources(&self) -> Resources {
        Resources {
            cpus: self.cpus,
            memory_mb: self.memory_mb,
            gpu: self.gpu,
        }
    }
}
