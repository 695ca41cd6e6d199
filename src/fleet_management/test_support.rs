//! In-memory runtime, channel, pod and file sync used by the fleet tests.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{mpsc, oneshot};

use crate::build_context::BuildContext;
use crate::channel::types::{Bindings, Delegation, PodControl, PodEvent, PodLink, RemoteChannel};
use crate::error_handling::types::FleetError;
use crate::file_sync::{BindSpec, FileSync, SyncTask};
use crate::fleet_management::fleet_manager::{FleetManager, ENV_ROUTE};
use crate::fleet_management::pod_handle::PodHandle;
use crate::fleet_management::types::{
    AutostopPolicy, Fingerprint, FleetSettings, PodId, StopHook,
};
use crate::runtime::{ContainerRuntime, ContainerSpec};

/// A pod that answers instantly and records stop requests.
pub(crate) struct FakePod {
    events: mpsc::UnboundedSender<PodEvent>,
    stops: AtomicUsize,
    executions: AtomicUsize,
    hang_on_stop: AtomicBool,
}

impl FakePod {
    pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<PodEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let pod = Arc::new(Self {
            events,
            stops: AtomicUsize::new(0),
            executions: AtomicUsize::new(0),
            hang_on_stop: AtomicBool::new(false),
        });
        (pod, rx)
    }

    pub(crate) fn send(&self, event: PodEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn stop_calls(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub(crate) fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    pub(crate) fn hang_on_stop(&self, hang: bool) {
        self.hang_on_stop.store(hang, Ordering::SeqCst);
    }
}

#[async_trait]
impl PodControl for FakePod {
    async fn execute(
        &self,
        _code: &str,
        inputs: Bindings,
        _scope: Option<&str>,
    ) -> Result<Bindings, FleetError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        Ok(inputs)
    }

    async fn stop(&self) -> Result<(), FleetError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if self.hang_on_stop.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

/// Resolves delegations when the fake runtime "starts" a container.
#[derive(Default)]
pub(crate) struct FakeChannel {
    pending: Mutex<HashMap<String, (PodId, oneshot::Sender<PodLink>)>>,
    pods: Mutex<HashMap<PodId, Arc<FakePod>>>,
    unresponsive: AtomicBool,
    stop_on_connect: AtomicBool,
}

impl FakeChannel {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Pods started from now on never connect back.
    pub(crate) fn set_unresponsive(&self, unresponsive: bool) {
        self.unresponsive.store(unresponsive, Ordering::SeqCst);
    }

    /// Pods started from now on announce they are stopping as soon as they connect.
    pub(crate) fn set_stop_on_connect(&self, stop: bool) {
        self.stop_on_connect.store(stop, Ordering::SeqCst);
    }

    fn connect(&self, route: &str) {
        if self.unresponsive.load(Ordering::SeqCst) {
            return;
        }
        let Some((pod_id, tx)) = self.pending.lock().unwrap().remove(route) else {
            return;
        };
        let (pod, events) = FakePod::new();
        self.pods.lock().unwrap().insert(pod_id, pod.clone());
        let _ = tx.send(PodLink {
            control: pod.clone(),
            events,
        });
        if self.stop_on_connect.load(Ordering::SeqCst) {
            pod.send(PodEvent::Stopping);
        }
    }

    pub(crate) fn pod(&self, pod_id: PodId) -> Arc<FakePod> {
        self.pods.lock().unwrap().get(&pod_id).cloned().expect("pod connected")
    }

    pub(crate) fn all_pods(&self) -> Vec<(PodId, Arc<FakePod>)> {
        self.pods
            .lock()
            .unwrap()
            .iter()
            .map(|(id, pod)| (*id, pod.clone()))
            .collect()
    }

    /// Delegations whose manager side is still waiting.
    pub(crate) fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .unwrap()
            .values()
            .filter(|(_, tx)| !tx.is_closed())
            .count()
    }
}

impl RemoteChannel for FakeChannel {
    fn url(&self) -> String {
        "fake://fleet".to_string()
    }

    fn delegate(&self, pod_id: PodId) -> Result<Delegation, FleetError> {
        let route = format!("route-{}", pod_id);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(route.clone(), (pod_id, tx));
        Ok(Delegation {
            route,
            key: "fake-key".to_string(),
            link: rx,
        })
    }
}

/// A container runtime that keeps everything in memory.
pub(crate) struct FakeRuntime {
    channel: Option<Arc<FakeChannel>>,
    images: Mutex<HashSet<String>>,
    live: Mutex<HashSet<String>>,
    specs: Mutex<Vec<ContainerSpec>>,
    cpu: Mutex<f64>,
    builds: AtomicUsize,
    starts: AtomicUsize,
    cpu_queries: AtomicUsize,
    prunes: AtomicUsize,
    removals: AtomicUsize,
    failing_starts: AtomicUsize,
    fail_build: AtomicBool,
    fail_cpu: AtomicBool,
    fail_list: AtomicBool,
    start_delay: Mutex<Duration>,
}

impl FakeRuntime {
    fn with_channel(channel: Option<Arc<FakeChannel>>) -> Arc<Self> {
        Arc::new(Self {
            channel,
            images: Mutex::new(HashSet::new()),
            live: Mutex::new(HashSet::new()),
            specs: Mutex::new(Vec::new()),
            cpu: Mutex::new(0.0),
            builds: AtomicUsize::new(0),
            starts: AtomicUsize::new(0),
            cpu_queries: AtomicUsize::new(0),
            prunes: AtomicUsize::new(0),
            removals: AtomicUsize::new(0),
            failing_starts: AtomicUsize::new(0),
            fail_build: AtomicBool::new(false),
            fail_cpu: AtomicBool::new(false),
            fail_list: AtomicBool::new(false),
            start_delay: Mutex::new(Duration::ZERO),
        })
    }

    /// A runtime whose containers never connect anywhere.
    pub(crate) fn new() -> Arc<Self> {
        Self::with_channel(None)
    }

    pub(crate) fn connected_to(channel: Arc<FakeChannel>) -> Arc<Self> {
        Self::with_channel(Some(channel))
    }

    pub(crate) fn set_cpu(&self, percent: f64) {
        *self.cpu.lock().unwrap() = percent;
    }

    pub(crate) fn fail_cpu(&self, fail: bool) {
        self.fail_cpu.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_build(&self, fail: bool) {
        self.fail_build.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_list(&self, fail: bool) {
        self.fail_list.store(fail, Ordering::SeqCst);
    }

    /// The next `count` container starts fail.
    pub(crate) fn fail_next_starts(&self, count: usize) {
        self.failing_starts.store(count, Ordering::SeqCst);
    }

    pub(crate) fn set_start_delay(&self, delay: Duration) {
        *self.start_delay.lock().unwrap() = delay;
    }

    pub(crate) fn add_image(&self, tag: &str) {
        self.images.lock().unwrap().insert(tag.to_string());
    }

    /// Simulates a container dying outside the manager's control.
    pub(crate) fn kill(&self, container_id: &str) {
        self.live.lock().unwrap().remove(container_id);
    }

    pub(crate) fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    pub(crate) fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub(crate) fn cpu_queries(&self) -> usize {
        self.cpu_queries.load(Ordering::SeqCst)
    }

    pub(crate) fn prunes(&self) -> usize {
        self.prunes.load(Ordering::SeqCst)
    }

    /// Containers removed one by one.
    pub(crate) fn removals(&self) -> usize {
        self.removals.load(Ordering::SeqCst)
    }

    pub(crate) fn live_count(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    pub(crate) fn specs(&self) -> Vec<ContainerSpec> {
        self.specs.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn image_exists(&self, tag: &str) -> Result<bool, FleetError> {
        Ok(self.images.lock().unwrap().contains(tag))
    }

    async fn build_image(&self, tag: &str, context: &Path) -> Result<(), FleetError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        if self.fail_build.load(Ordering::SeqCst) {
            return Err(FleetError::BuildFailure(format!("cannot build {}", tag)));
        }
        assert!(context.join("Dockerfile").is_file(), "build context written first");
        self.images.lock().unwrap().insert(tag.to_string());
        Ok(())
    }

    async fn start_container(&self, spec: &ContainerSpec) -> Result<String, FleetError> {
        let n = self.starts.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = *self.start_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let failing = self.failing_starts.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_starts.store(failing - 1, Ordering::SeqCst);
            return Err(FleetError::StartFailure(format!("container {} refused", n)));
        }

        let container_id = format!("container-{}", n);
        self.live.lock().unwrap().insert(container_id.clone());
        self.specs.lock().unwrap().push(spec.clone());
        if let Some(channel) = &self.channel {
            if let Some((_, route)) = spec.env.iter().find(|(k, _)| k == ENV_ROUTE) {
                channel.connect(route);
            }
        }
        Ok(container_id)
    }

    async fn list_live_containers(&self) -> Result<HashSet<String>, FleetError> {
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(FleetError::RuntimeQueryFailure("daemon unreachable".to_string()));
        }
        Ok(self.live.lock().unwrap().clone())
    }

    async fn cpu_utilization(&self, container_id: &str) -> Result<f64, FleetError> {
        self.cpu_queries.fetch_add(1, Ordering::SeqCst);
        if self.fail_cpu.load(Ordering::SeqCst) {
            return Err(FleetError::RuntimeQueryFailure(format!(
                "no stats for {}",
                container_id
            )));
        }
        Ok(*self.cpu.lock().unwrap())
    }

    async fn remove_container(&self, container_id: &str) -> Result<(), FleetError> {
        self.removals.fetch_add(1, Ordering::SeqCst);
        self.live.lock().unwrap().remove(container_id);
        Ok(())
    }

    async fn remove_labeled_containers(&self, _label: &str) -> Result<usize, FleetError> {
        let mut live = self.live.lock().unwrap();
        let removed = live.len();
        live.clear();
        Ok(removed)
    }

    async fn prune_images(&self) -> Result<(), FleetError> {
        self.prunes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// File sync hook that only counts starts and cancellations.
#[derive(Default)]
pub(crate) struct FakeFileSync {
    started: AtomicUsize,
    cancelled: Arc<AtomicUsize>,
    fail: AtomicBool,
    binds: Mutex<Vec<(PathBuf, PathBuf)>>,
}

impl FakeFileSync {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn task(&self) -> SyncTask {
        let (stop, rx) = oneshot::channel::<()>();
        let cancelled = self.cancelled.clone();
        let task = tokio::spawn(async move {
            let _ = rx.await;
            cancelled.fetch_add(1, Ordering::SeqCst);
        });
        SyncTask::new(stop, task)
    }

    pub(crate) fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub(crate) fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// `(data_path, support_path)` of every start.
    pub(crate) fn binds(&self) -> Vec<(PathBuf, PathBuf)> {
        self.binds.lock().unwrap().clone()
    }
}

impl FileSync for FakeFileSync {
    fn start(
        &self,
        _bind: &BindSpec,
        data_path: &Path,
        support_path: &Path,
    ) -> Result<SyncTask, FleetError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(FleetError::IoError(std::io::Error::other("storage offline")));
        }
        self.started.fetch_add(1, Ordering::SeqCst);
        self.binds
            .lock()
            .unwrap()
            .push((data_path.to_path_buf(), support_path.to_path_buf()));
        Ok(self.task())
    }
}

/// Stop hook that counts notifications.
#[derive(Default)]
pub(crate) struct CountingHook {
    calls: AtomicUsize,
    fail: bool,
}

impl CountingHook {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn failing() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail: true,
        })
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StopHook for CountingHook {
    async fn on_stop(&self, _pod_id: PodId) -> Result<(), FleetError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(FleetError::ChannelError("hook unreachable".to_string()));
        }
        Ok(())
    }
}

/// A manager wired to fakes, with its work dir in a temp directory.
pub(crate) struct FakeFleet {
    pub manager: FleetManager,
    pub runtime: Arc<FakeRuntime>,
    pub channel: Arc<FakeChannel>,
    pub filesync: Arc<FakeFileSync>,
    pub work_dir: TempDir,
}

impl FakeFleet {
    pub(crate) fn new() -> Self {
        Self::with_settings(|_| {})
    }

    pub(crate) fn with_settings(adjust: impl FnOnce(&mut FleetSettings)) -> Self {
        let work_dir = tempfile::tempdir().expect("temp work dir");
        let mut settings = FleetSettings {
            work_dir: work_dir.path().to_path_buf(),
            ..FleetSettings::default()
        };
        adjust(&mut settings);

        let channel = FakeChannel::new();
        let runtime = FakeRuntime::connected_to(channel.clone());
        let filesync = FakeFileSync::new();
        let manager = FleetManager::new(
            runtime.clone(),
            channel.clone(),
            filesync.clone(),
            BuildContext::default(),
            settings,
        );
        Self {
            manager,
            runtime,
            channel,
            filesync,
            work_dir,
        }
    }
}

/// A handle that is not backed by any manager.
pub(crate) fn bare_handle(fingerprint: &Fingerprint, container_id: &str) -> Arc<PodHandle> {
    let (pod, events) = FakePod::new();
    Arc::new(PodHandle::new(
        PodId::new(),
        container_id.to_string(),
        fingerprint.clone(),
        pod,
        events,
        FakeRuntime::new(),
        AutostopPolicy::default(),
    ))
}

/// Lets spawned tasks run without moving the paused clock.
pub(crate) async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}
