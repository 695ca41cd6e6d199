//! Manager-side record of one running pod.
//!
//! A handle moves Ready (in a pool) → Leased (in the lease table) → Stopped, and is never
//! reused once stopped. While leased it may carry an autostop timer: a single task that
//! sleeps until the idle deadline, asks the runtime how busy the container is, and either
//! stops the pod or sleeps again.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::channel::types::{PodControl, PodEvent};
use crate::error_handling::types::FleetError;
use crate::file_sync::SyncTask;
use crate::fleet_management::lock;
use crate::fleet_management::types::{AutostopPolicy, Fingerprint, PodId};
use crate::runtime::ContainerRuntime;

/// Run once when a leased pod goes away.
pub type StopCallback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct HandleState {
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    timer: Option<JoinHandle<()>>,
    listener: Option<JoinHandle<()>>,
    stop_callback: Option<StopCallback>,
    filesync: Option<SyncTask>,
    leased_at: Option<DateTime<Utc>>,
    stopped: bool,
}

pub struct PodHandle {
    pub id: PodId,
    pub container_id: String,
    pub fingerprint: Fingerprint,
    pub created_at: DateTime<Utc>,
    control: Arc<dyn PodControl>,
    runtime: Arc<dyn ContainerRuntime>,
    policy: AutostopPolicy,
    events: Mutex<Option<mpsc::UnboundedReceiver<PodEvent>>>,
    state: Mutex<HandleState>,
    timers_spawned: AtomicUsize,
}

impl PodHandle {
    pub fn new(
        id: PodId,
        container_id: String,
        fingerprint: Fingerprint,
        control: Arc<dyn PodControl>,
        events: mpsc::UnboundedReceiver<PodEvent>,
        runtime: Arc<dyn ContainerRuntime>,
        policy: AutostopPolicy,
    ) -> Self {
        Self {
            id,
            container_id,
            fingerprint,
            created_at: Utc::now(),
            control,
            runtime,
            policy,
            events: Mutex::new(Some(events)),
            state: Mutex::new(HandleState::default()),
            timers_spawned: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, HandleState> {
        lock(&self.state)
    }

    pub fn control(&self) -> Arc<dyn PodControl> {
        self.control.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.state().stopped
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.state().timeout
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.state().deadline
    }

    pub fn leased_at(&self) -> Option<DateTime<Utc>> {
        self.state().leased_at
    }

    /// Whether an autostop timer task is currently alive.
    pub fn has_timer(&self) -> bool {
        self.state()
            .timer
            .as_ref()
            .is_some_and(|timer| !timer.is_finished())
    }

    /// How many timer tasks this handle has ever spawned.
    pub fn timers_spawned(&self) -> usize {
        self.timers_spawned.load(Ordering::SeqCst)
    }

    /// Drains events that arrived while the pod sat in a pool. Returns `true` if the pod
    /// announced it is stopping or its link is gone, in which case it must not be leased.
    pub fn announced_stop(&self) -> bool {
        let mut events = lock(&self.events);
        let Some(rx) = events.as_mut() else {
            return false;
        };
        let mut stopping = false;
        loop {
            match rx.try_recv() {
                Ok(PodEvent::Stopping) => stopping = true,
                Ok(PodEvent::KeepAlive) => {}
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    stopping = true;
                    break;
                }
            }
        }
        stopping
    }

    pub fn attach_filesync(&self, task: SyncTask) {
        let mut state = self.state();
        if state.stopped {
            drop(state);
            task.cancel();
            return;
        }
        if let Some(previous) = state.filesync.replace(task) {
            previous.cancel();
        }
    }

    /// Hands the pod to a lease: installs the release callback and the autostop timeout,
    /// arms the timer and starts listening to the pod's events.
    pub fn arm_lease(self: &Arc<Self>, timeout: Option<Duration>, on_stop: StopCallback) {
        {
            let mut state = self.state();
            if state.stopped {
                return;
            }
            state.timeout = timeout;
            state.stop_callback = Some(on_stop);
            state.leased_at = Some(Utc::now());
        }
        self.reset_timeout();
        self.start_event_listener();
    }

    /// Pushes the idle deadline to `now + timeout`, spawning the timer task if none is
    /// alive. Never more than one timer task exists per handle.
    pub fn reset_timeout(self: &Arc<Self>) {
        let mut state = self.state();
        if state.stopped {
            return;
        }
        let Some(timeout) = state.timeout else {
            return;
        };
        state.deadline = Some(Instant::now() + timeout);

        let alive = state.timer.as_ref().is_some_and(|t| !t.is_finished());
        if !alive {
            let handle = Arc::downgrade(self);
            state.timer = Some(tokio::spawn(autostop_loop(handle, timeout)));
            let spawned = self.timers_spawned.fetch_add(1, Ordering::SeqCst) + 1;
            debug!("Pod {} armed autostop timer #{} ({:?})", self.id, spawned, timeout);
        }
    }

    fn remaining(&self, now: Instant) -> Option<Duration> {
        self.state()
            .deadline
            .filter(|deadline| *deadline > now)
            .map(|deadline| deadline - now)
    }

    /// One wake-up of the timer. Returns how long to sleep before the next one, or `None`
    /// when the timer is done.
    async fn autostop_check(&self) -> Option<Duration> {
        let (timeout, has_deadline) = {
            let state = self.state();
            if state.stopped {
                return None;
            }
            (state.timeout?, state.deadline.is_some())
        };
        let min_rearm = self.policy.min_rearm;
        let idle_rearm = timeout.max(min_rearm);

        if !has_deadline {
            return Some(min_rearm);
        }
        if let Some(remaining) = self.remaining(Instant::now()) {
            return Some(remaining.max(min_rearm));
        }

        let utilization = match self.runtime.cpu_utilization(&self.container_id).await {
            Ok(utilization) => utilization,
            Err(e) => {
                warn!("Autostop check for pod {} failed: {}", self.id, e);
                return Some(idle_rearm);
            }
        };

        // A keep-alive may have landed while the runtime was queried
        if let Some(remaining) = self.remaining(Instant::now()) {
            return Some(remaining.max(min_rearm));
        }

        if utilization < self.policy.cpu_threshold {
            info!(
                "Pod {} idle for {:?} at {:.2}% CPU, stopping",
                self.id, timeout, utilization
            );
            // Free our own slot so the teardown below does not abort this task
            drop(self.state().timer.take());
            self.stop(true).await;
            None
        } else {
            info!(
                "Pod {} still busy at {:.2}% CPU, extending by {:?}",
                self.id, utilization, idle_rearm
            );
            Some(idle_rearm)
        }
    }

    fn start_event_listener(self: &Arc<Self>) {
        let Some(mut events) = lock(&self.events).take() else {
            return;
        };
        let handle = Arc::downgrade(self);
        let pod_id = self.id;

        let listener = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(handle) = handle.upgrade() else {
                    break;
                };
                match event {
                    PodEvent::KeepAlive => {
                        debug!("Keep-alive from pod {}", pod_id);
                        handle.reset_timeout();
                    }
                    PodEvent::Stopping => {
                        info!("Pod {} is stopping on its own", pod_id);
                        // Teardown aborts this listener, so it runs elsewhere
                        tokio::spawn(async move { handle.stop(false).await });
                        return;
                    }
                }
            }
            debug!("Event stream of pod {} ended", pod_id);
        });

        let mut state = self.state();
        if state.stopped {
            listener.abort();
        } else {
            state.listener = Some(listener);
        }
    }

    /// Tears the pod down. Only the first call does anything.
    ///
    /// Runs the release callback, cancels file sync, the timer and the event listener,
    /// then, if `stop_pod`, asks the pod to stop, bounded by the policy's stop timeout.
    /// Remote stop failures are logged, never returned.
    pub async fn stop(&self, stop_pod: bool) {
        let (callback, filesync, timer, listener) = {
            let mut state = self.state();
            if state.stopped {
                return;
            }
            state.stopped = true;
            state.deadline = None;
            (
                state.stop_callback.take(),
                state.filesync.take(),
                state.timer.take(),
                state.listener.take(),
            )
        };
        info!("Stopping pod {} (container {})", self.id, self.container_id);

        if let Some(callback) = callback {
            callback();
        }
        if let Some(filesync) = filesync {
            filesync.cancel();
        }
        if let Some(timer) = timer {
            timer.abort();
        }
        if let Some(listener) = listener {
            listener.abort();
        }

        if stop_pod {
            let limit = self.policy.stop_timeout;
            match tokio::time::timeout(limit, self.control.stop()).await {
                Ok(Ok(())) => debug!("Pod {} acknowledged stop", self.id),
                Ok(Err(e)) => warn!("Pod {} failed to stop cleanly: {}", self.id, e),
                Err(_) => warn!("Pod {}: {}", self.id, FleetError::StopTimeout(limit)),
            }
        }
    }

    /// Like [`PodHandle::stop`] but leaves the container alone and drops the release
    /// callback unrun. Used when the manager itself already let go of the pod.
    pub fn disarm(&self) {
        let (filesync, timer, listener) = {
            let mut state = self.state();
            if state.stopped {
                return;
            }
            state.stopped = true;
            state.deadline = None;
            state.stop_callback = None;
            (state.filesync.take(), state.timer.take(), state.listener.take())
        };
        debug!("Disarmed pod {}", self.id);

        if let Some(filesync) = filesync {
            filesync.cancel();
        }
        if let Some(timer) = timer {
            timer.abort();
        }
        if let Some(listener) = listener {
            listener.abort();
        }
    }
}

async fn autostop_loop(handle: Weak<PodHandle>, first_sleep: Duration) {
    let mut sleep_for = first_sleep;
    loop {
        tokio::time::sleep(sleep_for).await;
        let Some(handle) = handle.upgrade() else {
            return;
        };
        match handle.autostop_check().await {
            Some(next) => sleep_for = next,
            None => return,
        }
    }
}
