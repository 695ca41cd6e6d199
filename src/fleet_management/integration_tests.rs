//! End-to-end lease lifecycles: fakes on a paused clock for the autostop scenarios, the
//! real TCP channel with in-process pods for the wire path, and docker for the runtime.

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, timeout};

use crate::build_context::BuildContext;
use crate::channel::tcp_channel::{connect_pod, TcpChannel};
use crate::channel::types::{Bindings, PodEvent};
use crate::error_handling::types::FleetError;
use crate::file_sync::{BindSpec, DirectoryMirror};
use crate::fleet_management::fleet_manager::{FleetManager, ENV_KEY, ENV_ROUTE, ENV_URL};
use crate::fleet_management::test_support::{settle, CountingHook, FakeFleet};
use crate::fleet_management::types::{Base, Dependency, Fingerprint, FleetSettings, PodRequest};
use crate::runtime::{ContainerRuntime, ContainerSpec, DockerCli};
use crate::sandbox::pod_instance::tests::AssignInterpreter;
use crate::sandbox::PodInstance;

fn fingerprint() -> Fingerprint {
    Fingerprint::new(Base::Python, [Dependency::named("numpy")])
}

fn autostop_request(hook: Arc<CountingHook>) -> PodRequest {
    PodRequest::new(fingerprint(), "acct")
        .with_autostop(Duration::from_secs(5))
        .with_stop_callback(hook)
}

#[tokio::test(start_paused = true)]
async fn scenario_cold_pool_lease() {
    let fleet = FakeFleet::new();
    let hook = CountingHook::new();
    let pod = fleet.manager.get_pod(autostop_request(hook)).await.unwrap();

    assert_eq!(fleet.runtime.builds(), 1);
    assert_eq!(fleet.runtime.starts(), 1);
    assert_eq!(fleet.manager.leased_pods("acct"), vec![pod.id]);

    let handle = fleet.manager.leased_handle("acct", pod.id).unwrap();
    assert_eq!(handle.timeout(), Some(Duration::from_secs(5)));
    assert!(handle.has_timer());
    assert!(handle.leased_at().is_some());
}

#[tokio::test(start_paused = true)]
async fn scenario_idle_pod_stops_after_timeout() {
    let fleet = FakeFleet::new();
    let hook = CountingHook::new();
    let pod = fleet
        .manager
        .get_pod(autostop_request(hook.clone()))
        .await
        .unwrap();

    sleep(Duration::from_millis(4990)).await;
    assert!(fleet.manager.is_leased(pod.id));

    sleep(Duration::from_millis(20)).await;
    settle().await;
    assert!(!fleet.manager.is_leased(pod.id));
    assert_eq!(fleet.runtime.cpu_queries(), 1);
    assert_eq!(fleet.channel.pod(pod.id).stop_calls(), 1);
    assert_eq!(hook.calls(), 1);
    assert_eq!(fleet.manager.stats().accounts, 0);
}

#[tokio::test(start_paused = true)]
async fn scenario_keep_alive_postpones_stop() {
    let fleet = FakeFleet::new();
    let hook = CountingHook::new();
    let pod = fleet
        .manager
        .get_pod(autostop_request(hook.clone()))
        .await
        .unwrap();
    let remote = fleet.channel.pod(pod.id);

    sleep(Duration::from_secs(4)).await;
    remote.send(PodEvent::KeepAlive);
    settle().await;

    sleep(Duration::from_millis(1500)).await;
    assert!(fleet.manager.is_leased(pod.id));
    // The wake-up at t=5 saw the moved deadline and did not ask the runtime
    assert_eq!(fleet.runtime.cpu_queries(), 0);

    sleep(Duration::from_millis(3400)).await;
    assert!(fleet.manager.is_leased(pod.id));

    sleep(Duration::from_millis(200)).await;
    settle().await;
    assert!(!fleet.manager.is_leased(pod.id));
    assert_eq!(remote.stop_calls(), 1);
    assert_eq!(hook.calls(), 1);
    assert_eq!(fleet.runtime.cpu_queries(), 1);
}

#[tokio::test(start_paused = true)]
async fn scenario_busy_pod_outlives_its_timeout() {
    let fleet = FakeFleet::new();
    fleet.runtime.set_cpu(35.0);
    let hook = CountingHook::new();
    let pod = fleet
        .manager
        .get_pod(autostop_request(hook.clone()))
        .await
        .unwrap();

    sleep(Duration::from_secs(12)).await;
    assert!(fleet.manager.is_leased(pod.id));
    // Checked at t=5 and t=10
    assert_eq!(fleet.runtime.cpu_queries(), 2);

    fleet.runtime.set_cpu(0.0);
    sleep(Duration::from_secs(4)).await;
    settle().await;
    assert!(!fleet.manager.is_leased(pod.id));
    assert_eq!(hook.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn scenario_pod_stopping_on_its_own_is_released() {
    let fleet = FakeFleet::new();
    let hook = CountingHook::new();
    let pod = fleet
        .manager
        .get_pod(autostop_request(hook.clone()))
        .await
        .unwrap();

    fleet.channel.pod(pod.id).send(PodEvent::Stopping);
    settle().await;
    assert!(!fleet.manager.is_leased(pod.id));
    assert_eq!(fleet.channel.pod(pod.id).stop_calls(), 0);
    assert_eq!(hook.calls(), 1);

    // The disarmed timer stays quiet
    sleep(Duration::from_secs(30)).await;
    assert_eq!(fleet.runtime.cpu_queries(), 0);
}

/// Runs each "container" as an in-process pod that dials the manager over TCP.
#[derive(Default)]
struct InProcessRuntime {
    live: Mutex<HashSet<String>>,
    instances: Mutex<Vec<Arc<PodInstance>>>,
    started: AtomicUsize,
}

impl InProcessRuntime {
    fn instance(&self, index: usize) -> Arc<PodInstance> {
        self.instances.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl ContainerRuntime for InProcessRuntime {
    async fn image_exists(&self, _tag: &str) -> Result<bool, FleetError> {
        Ok(true)
    }

    async fn build_image(&self, _tag: &str, _context: &Path) -> Result<(), FleetError> {
        Ok(())
    }

    async fn start_container(&self, spec: &ContainerSpec) -> Result<String, FleetError> {
        let env = |key: &str| {
            spec.env
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
                .unwrap_or_default()
        };
        let instance = Arc::new(PodInstance::new(Box::new(AssignInterpreter)));
        let endpoint =
            connect_pod(&env(ENV_URL), &env(ENV_ROUTE), &env(ENV_KEY), instance.clone()).await?;
        tokio::spawn(endpoint.run_until_stopped());

        let id = format!("inproc-{}", self.started.fetch_add(1, Ordering::SeqCst));
        self.live.lock().unwrap().insert(id.clone());
        self.instances.lock().unwrap().push(instance);
        Ok(id)
    }

    async fn list_live_containers(&self) -> Result<HashSet<String>, FleetError> {
        Ok(self.live.lock().unwrap().clone())
    }

    async fn cpu_utilization(&self, _container_id: &str) -> Result<f64, FleetError> {
        Ok(0.0)
    }

    async fn remove_container(&self, container_id: &str) -> Result<(), FleetError> {
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
        Ok(())
    }
}

#[tokio::test]
async fn leased_pod_executes_over_tcp_and_syncs_its_files() {
    let work_dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(InProcessRuntime::default());
    let channel = Arc::new(TcpChannel::bind("127.0.0.1:0", None).await.unwrap());
    let manager = FleetManager::new(
        runtime.clone(),
        channel,
        Arc::new(DirectoryMirror::new(Duration::from_millis(50))),
        BuildContext::default(),
        FleetSettings {
            work_dir: work_dir.path().to_path_buf(),
            ..FleetSettings::default()
        },
    );

    let target = work_dir.path().join("bound");
    let pod = timeout(
        Duration::from_secs(10),
        manager.get_pod(PodRequest::new(fingerprint(), "acct").with_bind_data(BindSpec::new(&target))),
    )
    .await
    .unwrap()
    .unwrap();

    let out = pod
        .control
        .execute("x = 20", Bindings::new(), Some("session"))
        .await
        .unwrap();
    assert_eq!(out.get("x"), Some(&serde_json::json!(20)));
    let out = pod
        .control
        .execute("x += 22", Bindings::new(), Some("session"))
        .await
        .unwrap();
    assert_eq!(out.get("x"), Some(&serde_json::json!(42)));

    // Something the pod wrote into its working dir
    let pod_dir = work_dir.path().join("pods").join(pod.id.to_string());
    std::fs::write(pod_dir.join("result.txt"), "42").unwrap();

    manager.stop_pod("acct", pod.id).await.unwrap();
    assert!(runtime.instance(0).is_stopped());
    assert!(!manager.is_leased(pod.id));

    let mirrored = target.join("result.txt");
    for _ in 0..100 {
        if mirrored.is_file() {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(std::fs::read_to_string(mirrored).unwrap(), "42");
}

#[tokio::test]
#[ignore = "requires a docker daemon"]
async fn docker_cli_answers_fleet_queries() {
    let docker = DockerCli::new("docker");
    if !docker.is_available().await {
        return;
    }

    docker
        .list_live_containers()
        .await
        .expect("listing containers");
    assert!(!docker
        .image_exists("pf-podfleet-test-missing-image")
        .await
        .expect("querying images"));
    assert_eq!(
        docker
            .remove_labeled_containers("podfleet-test-unused-label")
            .await
            .expect("removing by label"),
        0
    );
}
