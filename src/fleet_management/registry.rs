//! Bookkeeping tables owned by the fleet manager.
//!
//! - [`PoolRegistry`]: per fingerprint, the ready pods, whether the image was built and
//!   the lock serializing builds of that fingerprint.
//! - [`LeaseTable`]: per account, the pods it currently holds.
//!
//! A live handle sits in exactly one ready queue or exactly one account's lease set.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::fleet_management::pod_handle::PodHandle;
use crate::fleet_management::types::{AccountId, Fingerprint, PodId};

#[derive(Default)]
struct PoolEntry {
    ready: VecDeque<Arc<PodHandle>>,
    image_built: bool,
    build_lock: Arc<tokio::sync::Mutex<()>>,
}

#[derive(Default)]
pub struct PoolRegistry {
    pools: HashMap<Fingerprint, PoolEntry>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The build lock of `fingerprint`, creating its entry on first use.
    pub fn build_lock(&mut self, fingerprint: &Fingerprint) -> Arc<tokio::sync::Mutex<()>> {
        self.pools
            .entry(fingerprint.clone())
            .or_default()
            .build_lock
            .clone()
    }

    pub fn image_built(&self, fingerprint: &Fingerprint) -> bool {
        self.pools
            .get(fingerprint)
            .is_some_and(|entry| entry.image_built)
    }

    pub fn mark_built(&mut self, fingerprint: &Fingerprint) {
        self.pools.entry(fingerprint.clone()).or_default().image_built = true;
    }

    pub fn push(&mut self, fingerprint: &Fingerprint, handle: Arc<PodHandle>) {
        self.pools
            .entry(fingerprint.clone())
            .or_default()
            .ready
            .push_back(handle);
    }

    /// Takes the most recently pooled pod.
    pub fn pop(&mut self, fingerprint: &Fingerprint) -> Option<Arc<PodHandle>> {
        self.pools.get_mut(fingerprint)?.ready.pop_back()
    }

    pub fn ready_count(&self, fingerprint: &Fingerprint) -> usize {
        self.pools.get(fingerprint).map_or(0, |entry| entry.ready.len())
    }

    pub fn total_ready(&self) -> usize {
        self.pools.values().map(|entry| entry.ready.len()).sum()
    }

    pub fn contains(&self, pod_id: PodId) -> bool {
        self.pools
            .values()
            .any(|entry| entry.ready.iter().any(|h| h.id == pod_id))
    }

    /// Keeps the ready pods `keep` accepts and returns the others.
    pub fn retain_ready<F>(&mut self, mut keep: F) -> Vec<Arc<PodHandle>>
    where
        F: FnMut(&PodHandle) -> bool,
    {
        let mut removed = Vec::new();
        for entry in self.pools.values_mut() {
            let (kept, dropped): (VecDeque<_>, VecDeque<_>) =
                entry.ready.drain(..).partition(|h| keep(h));
            entry.ready = kept;
            removed.extend(dropped);
        }
        removed
    }

    /// Empties every ready queue. Build state is kept.
    pub fn drain_ready(&mut self) -> Vec<Arc<PodHandle>> {
        self.pools
            .values_mut()
            .flat_map(|entry| entry.ready.drain(..))
            .collect()
    }
}

#[derive(Default)]
pub struct LeaseTable {
    leases: HashMap<AccountId, HashMap<PodId, Arc<PodHandle>>>,
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, account_id: &str, handle: Arc<PodHandle>) {
        self.leases
            .entry(account_id.to_string())
            .or_default()
            .insert(handle.id, handle);
    }

    /// Removes a lease. The account disappears with its last pod.
    pub fn remove(&mut self, account_id: &str, pod_id: PodId) -> Option<Arc<PodHandle>> {
        let pods = self.leases.get_mut(account_id)?;
        let handle = pods.remove(&pod_id);
        if pods.is_empty() {
            self.leases.remove(account_id);
        }
        handle
    }

    pub fn get(&self, account_id: &str, pod_id: PodId) -> Option<Arc<PodHandle>> {
        self.leases.get(account_id)?.get(&pod_id).cloned()
    }

    pub fn pods_of(&self, account_id: &str) -> Vec<PodId> {
        self.leases
            .get(account_id)
            .map(|pods| pods.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, pod_id: PodId) -> bool {
        self.leases.values().any(|pods| pods.contains_key(&pod_id))
    }

    pub fn has_account(&self, account_id: &str) -> bool {
        self.leases.contains_key(account_id)
    }

    pub fn len(&self) -> usize {
        self.leases.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }

    pub fn accounts(&self) -> usize {
        self.leases.len()
    }

    pub fn handles(&self) -> Vec<Arc<PodHandle>> {
        self.leases
            .values()
            .flat_map(|pods| pods.values().cloned())
            .collect()
    }

    pub fn drain(&mut self) -> Vec<Arc<PodHandle>> {
        self.leases
            .drain()
            .flat_map(|(_, pods)| pods.into_values())
            .collect()
    }
}
