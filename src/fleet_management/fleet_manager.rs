use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;

use crate::build_context::BuildContext;
use crate::channel::types::RemoteChannel;
use crate::error_handling::types::FleetError;
use crate::file_sync::FileSync;
use crate::fleet_management::lock;
use crate::fleet_management::pod_handle::{PodHandle, StopCallback};
use crate::fleet_management::registry::{LeaseTable, PoolRegistry};
use crate::fleet_management::task_set::TaskSet;
use crate::fleet_management::types::{
    AccountId, Fingerprint, FleetSettings, FleetStats, LeasedPod, PodId, PodRequest, Resources,
    StopHook, StopOutcome,
};
use crate::runtime::{ContainerRuntime, ContainerSpec, Mount};

pub const ENV_URL: &str = "PODFLEET_URL";
pub const ENV_POD_NAME: &str = "PODFLEET_POD_NAME";
pub const ENV_ROUTE: &str = "PODFLEET_ROUTE";
pub const ENV_KEY: &str = "PODFLEET_KEY";

/// How many times `get_pod` provisions before giving up on a fingerprint whose pods
/// keep going away before they can be leased.
pub const LEASE_PROVISION_ATTEMPTS: usize = 3;

struct FleetInner {
    runtime: Arc<dyn ContainerRuntime>,
    channel: Arc<dyn RemoteChannel>,
    filesync: Arc<dyn FileSync>,
    build_context: BuildContext,
    settings: FleetSettings,
    pools: Mutex<PoolRegistry>,
    leases: Mutex<LeaseTable>,
    delayed_provisioning: Arc<TaskSet>,
    stop_callbacks: Arc<TaskSet>,
    reconciler: Mutex<Option<JoinHandle<()>>>,
    total_provisioned: AtomicU64,
    failed_starts: AtomicU64,
}

/// Orchestrates warm pools, leases, autostop and reconciliation for a fleet of pods.
///
/// Cloning is cheap and every clone drives the same fleet. All state lives in the
/// instance; two managers never share pools or leases.
///
/// Design notes:
/// - The pool and lease tables sit behind plain mutexes that are never held across an
///   await. Image builds are serialized per fingerprint by an async lock, so a slow
///   build never holds up other fingerprints.
/// - Pods get their identity here, before their container starts, and are tied to it
///   through a channel delegation the pod claims when it connects back.
/// - Background work (delayed provisioning, stop hooks, the reconciler) is tracked and
///   aborted by [`FleetManager::shutdown`].
#[derive(Clone)]
pub struct FleetManager {
    inner: Arc<FleetInner>,
}

impl FleetManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        channel: Arc<dyn RemoteChannel>,
        filesync: Arc<dyn FileSync>,
        build_context: BuildContext,
        settings: FleetSettings,
    ) -> Self {
        info!(
            "Initializing FleetManager (work dir {}, label {})",
            settings.work_dir.display(),
            settings.container_label
        );
        Self {
            inner: Arc::new(FleetInner {
                runtime,
                channel,
                filesync,
                build_context,
                settings,
                pools: Mutex::new(PoolRegistry::new()),
                leases: Mutex::new(LeaseTable::new()),
                delayed_provisioning: TaskSet::new("delayed provisioning"),
                stop_callbacks: TaskSet::new("stop callback"),
                reconciler: Mutex::new(None),
                total_provisioned: AtomicU64::new(0),
                failed_starts: AtomicU64::new(0),
            }),
        }
    }

    pub fn settings(&self) -> &FleetSettings {
        &self.inner.settings
    }

    fn pools(&self) -> MutexGuard<'_, PoolRegistry> {
        lock(&self.inner.pools)
    }

    fn leases(&self) -> MutexGuard<'_, LeaseTable> {
        lock(&self.inner.leases)
    }

    fn pod_dir(&self, pod_id: PodId) -> PathBuf {
        self.inner.settings.work_dir.join("pods").join(pod_id.to_string())
    }

    fn support_dir(&self, pod_id: PodId) -> PathBuf {
        self.inner
            .settings
            .work_dir
            .join("pods")
            .join(format!("{}_support", pod_id))
    }

    /// Leases a pod of `request.fingerprint` to `request.account_id`.
    ///
    /// Provisions one pod whenever the pool is empty and retries until it wins one, so
    /// the call waits for a build and a start on a cold pool. Gives up with
    /// `StartFailure` after [`LEASE_PROVISION_ATTEMPTS`] provisions.
    pub async fn get_pod(&self, request: PodRequest) -> Result<LeasedPod, FleetError> {
        let PodRequest {
            fingerprint,
            account_id,
            resources,
            autostop_timeout,
            stop_callback,
            bind_data,
            provision_extra,
            force_rebuild,
        } = request;

        let mut rebuild = force_rebuild;
        let mut attempts = 0;
        let handle = loop {
            let popped = self.pools().pop(&fingerprint);
            match popped {
                Some(handle) if handle.announced_stop() => {
                    warn!("Discarding pooled pod {}: it went away while ready", handle.id);
                    handle.disarm();
                }
                Some(handle) => break handle,
                None if attempts == LEASE_PROVISION_ATTEMPTS => {
                    return Err(FleetError::StartFailure(format!(
                        "no pod of {} stayed up after {} provisioning attempt(s)",
                        fingerprint, attempts
                    )));
                }
                None => {
                    debug!("No ready pod for {}, provisioning one", fingerprint);
                    attempts += 1;
                    self.provision(1, &fingerprint, resources, rebuild).await?;
                    rebuild = false;
                }
            }
        };

        if let Some(bind) = &bind_data {
            let data_path = self.pod_dir(handle.id);
            let support_path = self.support_dir(handle.id);
            let started = std::fs::create_dir_all(&support_path)
                .map_err(FleetError::from)
                .and_then(|_| self.inner.filesync.start(bind, &data_path, &support_path));
            match started {
                Ok(task) => handle.attach_filesync(task),
                Err(e) => {
                    warn!("File sync for pod {} failed to start: {}", handle.id, e);
                    self.pools().push(&fingerprint, handle);
                    return Err(e);
                }
            }
        }

        self.leases().insert(&account_id, handle.clone());
        let on_stop = self.release_callback(account_id.clone(), handle.id, stop_callback);
        handle.arm_lease(autostop_timeout, on_stop);
        info!(
            "Leased pod {} ({}) to account {}",
            handle.id, fingerprint, account_id
        );

        if provision_extra {
            self.schedule_provision(fingerprint, resources);
        }

        Ok(LeasedPod {
            id: handle.id,
            control: handle.control(),
        })
    }

    /// The callback a leased handle runs on teardown: release the lease and notify the
    /// account's hook.
    fn release_callback(
        &self,
        account_id: AccountId,
        pod_id: PodId,
        hook: Option<Arc<dyn StopHook>>,
    ) -> StopCallback {
        let inner = Arc::downgrade(&self.inner);
        Box::new(move || {
            if let Some(inner) = inner.upgrade() {
                FleetManager { inner }.stop(&account_id, pod_id, hook);
            }
        })
    }

    fn schedule_provision(&self, fingerprint: Fingerprint, resources: Resources) {
        let manager = self.clone();
        let delay = self.inner.settings.provision_delay;
        self.inner.delayed_provisioning.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = manager.provision(1, &fingerprint, resources, false).await {
                warn!("Background provisioning for {} failed: {}", fingerprint, e);
            }
        });
    }

    /// Starts `count` pods of `fingerprint` and adds them to its ready pool, building the
    /// image first when needed.
    ///
    /// Every start runs to completion. The pods that came up are pooled even when others
    /// failed; the first failure is then returned. Returns the number of pods added.
    pub async fn provision(
        &self,
        count: usize,
        fingerprint: &Fingerprint,
        resources: Resources,
        force_rebuild: bool,
    ) -> Result<usize, FleetError> {
        let tag = fingerprint.tag();
        {
            let build_lock = self.pools().build_lock(fingerprint);
            let _guard = build_lock.lock().await;
            let built = self.pools().image_built(fingerprint);
            if force_rebuild || (!built && !self.inner.runtime.image_exists(&tag).await?) {
                self.build_image(fingerprint, &tag).await?;
            }
            self.pools().mark_built(fingerprint);
        }

        info!("Provisioning {} pod(s) of {}", count, fingerprint);
        let mut starts = JoinSet::new();
        for _ in 0..count {
            let manager = self.clone();
            let fingerprint = fingerprint.clone();
            let tag = tag.clone();
            starts.spawn(async move { manager.start_pod(fingerprint, tag, resources).await });
        }

        let mut added = 0;
        let mut first_error = None;
        while let Some(joined) = starts.join_next().await {
            let started = joined.unwrap_or_else(|e| {
                Err(FleetError::StartFailure(format!("start task failed: {}", e)))
            });
            match started {
                Ok(handle) => {
                    debug!("Pod {} ready in pool {}", handle.id, fingerprint);
                    self.pools().push(fingerprint, handle);
                    self.inner.total_provisioned.fetch_add(1, Ordering::SeqCst);
                    added += 1;
                }
                Err(e) => {
                    warn!("Failed to start a pod of {}: {}", fingerprint, e);
                    self.inner.failed_starts.fetch_add(1, Ordering::SeqCst);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => {
                info!(
                    "Provisioned {}/{} pod(s) of {} before failing",
                    added, count, fingerprint
                );
                Err(e)
            }
            None => Ok(added),
        }
    }

    async fn build_image(&self, fingerprint: &Fingerprint, tag: &str) -> Result<(), FleetError> {
        let context = self.inner.settings.work_dir.join("build").join(tag);
        self.inner.build_context.write(fingerprint, &context)?;

        info!("Building image {}", tag);
        let started = Instant::now();
        self.inner.runtime.build_image(tag, &context).await?;
        info!("Built image {} in {:?}", tag, started.elapsed());
        Ok(())
    }

    async fn start_pod(
        &self,
        fingerprint: Fingerprint,
        tag: String,
        resources: Resources,
    ) -> Result<Arc<PodHandle>, FleetError> {
        let settings = &self.inner.settings;
        let pod_id = PodId::new();
        let pod_dir = self.pod_dir(pod_id);
        tokio::fs::create_dir_all(&pod_dir).await?;

        let delegation = self.inner.channel.delegate(pod_id)?;
        let pod_name = format!(
            "id={}, base={}, cpus={:.2}, memory={}, gpu={}",
            pod_id.short(),
            fingerprint.base(),
            resources.cpus,
            resources.memory_mb,
            resources.gpu
        );
        let spec = ContainerSpec {
            tag,
            env: vec![
                (ENV_URL.to_string(), self.inner.channel.url()),
                (ENV_POD_NAME.to_string(), pod_name),
                (ENV_ROUTE.to_string(), delegation.route),
                (ENV_KEY.to_string(), delegation.key),
            ],
            mounts: vec![Mount {
                host_path: pod_dir.clone(),
                container_path: settings.data_mount.clone(),
            }],
            resources,
            label: settings.container_label.clone(),
        };

        let container_id = match self.inner.runtime.start_container(&spec).await {
            Ok(container_id) => container_id,
            Err(e) => {
                remove_pod_dir(&pod_dir).await;
                return Err(e);
            }
        };
        debug!("Container {} started for pod {}", container_id, pod_id);

        let reason = match tokio::time::timeout(settings.startup_timeout, delegation.link).await {
            Ok(Ok(link)) => {
                return Ok(Arc::new(PodHandle::new(
                    pod_id,
                    container_id,
                    fingerprint,
                    link.control,
                    link.events,
                    self.inner.runtime.clone(),
                    settings.autostop,
                )))
            }
            Ok(Err(_)) => format!("delegation of pod {} was dropped before it connected", pod_id),
            Err(_) => format!(
                "pod {} did not connect within {:?}",
                pod_id, settings.startup_timeout
            ),
        };

        warn!(
            "Abandoning pod {} (container {}): {}",
            pod_id, container_id, reason
        );
        // Nothing tracks the container from here on
        if let Err(e) = self.inner.runtime.remove_container(&container_id).await {
            warn!("Failed to remove container {}: {}", container_id, e);
        }
        remove_pod_dir(&pod_dir).await;
        Err(FleetError::StartFailure(reason))
    }

    /// Releases the lease of `pod_id` under `account_id` without touching the container.
    ///
    /// The handle is disarmed and, if given, `callback` runs in the background. An unknown
    /// pair is not an error and yields [`StopOutcome::NotFound`].
    pub fn stop(
        &self,
        account_id: &str,
        pod_id: PodId,
        callback: Option<Arc<dyn StopHook>>,
    ) -> StopOutcome {
        let removed = self.leases().remove(account_id, pod_id);
        let Some(handle) = removed else {
            if callback.is_some() {
                info!("Pod {} not found under account {}", pod_id, account_id);
            } else {
                debug!("Pod {} not found under account {}", pod_id, account_id);
            }
            return StopOutcome::NotFound;
        };

        handle.disarm();
        info!("Released pod {} from account {}", pod_id, account_id);

        if let Some(hook) = callback {
            self.inner.stop_callbacks.spawn(async move {
                if let Err(e) = hook.on_stop(pod_id).await {
                    warn!("Stop callback for pod {} failed: {}", pod_id, e);
                }
            });
        }
        StopOutcome::Released
    }

    /// Fully tears down a leased pod: stops it remotely and releases its lease.
    pub async fn stop_pod(&self, account_id: &str, pod_id: PodId) -> Result<(), FleetError> {
        let handle = self
            .leases()
            .get(account_id, pod_id)
            .ok_or_else(|| FleetError::LeaseNotFound {
                account_id: account_id.to_string(),
                pod_id: pod_id.to_string(),
            })?;
        handle.stop(true).await;
        Ok(())
    }

    /// Compares tracked pods with the runtime's live containers once.
    ///
    /// Leased pods whose container is gone are torn down without a remote stop; ready
    /// pods whose container is gone are dropped from their pool. Returns how many pods
    /// were removed.
    pub async fn reconcile_once(&self) -> Result<usize, FleetError> {
        let live = self.inner.runtime.list_live_containers().await?;

        let vanished_ready = self
            .pools()
            .retain_ready(|handle| live.contains(&handle.container_id));
        let vanished_leased: Vec<Arc<PodHandle>> = self
            .leases()
            .handles()
            .into_iter()
            .filter(|handle| !live.contains(&handle.container_id))
            .collect();

        for handle in &vanished_ready {
            info!(
                "Container {} of ready pod {} is gone, dropping it",
                handle.container_id, handle.id
            );
            handle.disarm();
        }
        for handle in &vanished_leased {
            info!(
                "Container {} of leased pod {} is gone, releasing it",
                handle.container_id, handle.id
            );
            handle.stop(false).await;
        }

        let removed = vanished_ready.len() + vanished_leased.len();
        if removed > 0 {
            debug!("Reconciliation removed {} pod(s)", removed);
        }
        Ok(removed)
    }

    /// Spawns the periodic reconciliation loop, replacing any previous one. The first
    /// check runs one interval from now.
    pub fn start_reconciler(&self) {
        let interval = self.inner.settings.reconcile_interval;
        let inner = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                if let Err(e) = (FleetManager { inner }).reconcile_once().await {
                    warn!("Reconciliation failed, retrying next tick: {}", e);
                }
            }
        });

        if let Some(previous) = lock(&self.inner.reconciler).replace(task) {
            previous.abort();
        }
        info!("Reconciler started, checking every {:?}", interval);
    }

    /// Removes every container carrying the fleet label and prunes dangling images.
    pub async fn clear_containers(&self) -> Result<usize, FleetError> {
        let label = &self.inner.settings.container_label;
        let removed = self.inner.runtime.remove_labeled_containers(label).await?;
        self.inner.runtime.prune_images().await?;
        info!("Cleared {} container(s) labeled {}", removed, label);
        Ok(removed)
    }

    /// Aborts background work and disarms every tracked pod. Containers are left to the
    /// caller (see [`FleetManager::clear_containers`]).
    pub fn shutdown(&self) {
        let aborted =
            self.inner.delayed_provisioning.abort_all() + self.inner.stop_callbacks.abort_all();
        if let Some(reconciler) = lock(&self.inner.reconciler).take() {
            reconciler.abort();
        }

        let ready = self.pools().drain_ready();
        let leased = self.leases().drain();
        for handle in ready.iter().chain(leased.iter()) {
            handle.disarm();
        }
        info!(
            "FleetManager shut down: {} ready and {} leased pod(s) disarmed, {} task(s) aborted",
            ready.len(),
            leased.len(),
            aborted
        );
    }

    pub fn ready_count(&self, fingerprint: &Fingerprint) -> usize {
        self.pools().ready_count(fingerprint)
    }

    pub fn leased_pods(&self, account_id: &str) -> Vec<PodId> {
        self.leases().pods_of(account_id)
    }

    pub fn is_leased(&self, pod_id: PodId) -> bool {
        self.leases().contains(pod_id)
    }

    pub fn is_pooled(&self, pod_id: PodId) -> bool {
        self.pools().contains(pod_id)
    }

    pub fn leased_handle(&self, account_id: &str, pod_id: PodId) -> Option<Arc<PodHandle>> {
        self.leases().get(account_id, pod_id)
    }

    /// Delayed provisioning and stop callback tasks still running.
    pub fn pending_task_count(&self) -> usize {
        self.inner.delayed_provisioning.len() + self.inner.stop_callbacks.len()
    }

    pub fn stats(&self) -> FleetStats {
        let ready = self.pools().total_ready();
        let (leased, accounts) = {
            let leases = self.leases();
            (leases.len(), leases.accounts())
        };
        FleetStats {
            ready,
            leased,
            accounts,
            total_provisioned: self.inner.total_provisioned.load(Ordering::SeqCst),
            failed_starts: self.inner.failed_starts.load(Ordering::SeqCst),
        }
    }
}

async fn remove_pod_dir(pod_dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(pod_dir).await {
        debug!("Could not remove {}: {}", pod_dir.display(), e);
    }
}
