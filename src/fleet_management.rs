//! Fleet management subsystem.
//!
//! Keeps warm pools of pre-started pods per [`Fingerprint`], leases them to accounts,
//! stops leased pods once they sit idle and reconciles its bookkeeping against what the
//! container runtime actually runs.
//!
//! Re-exports:
//! - [`FleetManager`]: main entry point.
//! - [`PodHandle`]: manager-side record of one pod.
//! - [`PoolRegistry`], [`LeaseTable`]: the tables the manager owns.
//!
//! Example (non-running):
//! ```ignore
//! use podfleet::fleet_management::{Base, Dependency, Fingerprint, PodRequest};
//!
//! let fingerprint = Fingerprint::new(Base::Python, [Dependency::named("numpy")]);
//! let pod = manager
//!     .get_pod(PodRequest::new(fingerprint, "account-1").with_autostop(Duration::from_secs(300)))
//!     .await?;
//! pod.control.execute("x = 1", Bindings::new(), Some("session")).await?;
//! manager.stop_pod("account-1", pod.id).await?;
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod fleet_manager;
#[cfg(test)]
pub mod integration_tests;
pub mod pod_handle;
pub mod registry;
pub mod task_set;
#[cfg(test)]
pub(crate) mod test_support;
pub mod types;

pub use fleet_manager::FleetManager;
pub use pod_handle::{PodHandle, StopCallback};
pub use registry::{LeaseTable, PoolRegistry};
pub use task_set::TaskSet;
pub use types::{
    AccountId, AutostopPolicy, Base, Dependency, Fingerprint, FleetSettings, FleetStats,
    LeasedPod, PodId, PodRequest, Resources, StopHook, StopOutcome,
};

/// Locks a table mutex. A panic elsewhere never leaves these tables half-updated, so a
/// poisoned lock is still usable.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
