use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

use crate::error_handling::types::FleetError;
use crate::runtime::runtime_trait::{ContainerRuntime, ContainerSpec};

/// [`ContainerRuntime`] backed by the `docker` command line client.
///
/// Every call spawns one `docker` process and waits for it to exit. Arguments are passed
/// directly, never through a shell.
pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Checks whether the docker client can reach a daemon.
    pub async fn is_available(&self) -> bool {
        let available = Command::new(&self.binary)
            .arg("version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false);

        debug!("docker availability check: {}", available);
        available
    }

    /// Runs `docker <args>` and returns its stdout, or stderr as the error on failure.
    async fn run(&self, args: Vec<String>) -> Result<String, String> {
        debug!("Running {} {}", self.binary, args.join(" "));
        let output = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| format!("failed to spawn {}: {}", self.binary, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(format!("{} ({})", stderr, output.status));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

/// Builds the `docker run` argument list for a pod container.
pub fn run_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--rm".to_string(),
        "--network=host".to_string(),
    ];
    for (key, value) in &spec.env {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }
    for mount in &spec.mounts {
        args.push("-v".to_string());
        args.push(format!(
            "{}:{}",
            mount.host_path.display(),
            mount.container_path
        ));
    }
    if spec.resources.gpu {
        args.push("--gpus".to_string());
        args.push("all".to_string());
        args.push("--ipc=host".to_string());
    }
    args.push(format!("--cpus={:.2}", spec.resources.cpus));
    args.push(format!("--memory={}m", spec.resources.memory_mb));
    args.push("-l".to_string());
    args.push(spec.label.clone());
    args.push(spec.tag.clone());
    args
}

/// Parses `docker stats --format {{.CPUPerc}}` output such as `"12.34%\n"`.
pub fn parse_cpu_percent(raw: &str) -> Option<f64> {
    raw.trim().trim_end_matches('%').trim().parse::<f64>().ok()
}

/// Splits whitespace separated container ids, dropping empty lines.
pub fn parse_container_ids(raw: &str) -> HashSet<String> {
    raw.split_whitespace().map(|s| s.to_string()).collect()
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn image_exists(&self, tag: &str) -> Result<bool, FleetError> {
        let out = self
            .run(argv(&["image", "ls", "-q", tag]))
            .await
            .map_err(FleetError::RuntimeQueryFailure)?;
        Ok(!out.trim().is_empty())
    }

    async fn build_image(&self, tag: &str, context: &Path) -> Result<(), FleetError> {
        info!("Building image {} from {}", tag, context.display());
        let context = context.display().to_string();
        self.run(argv(&["build", "-t", tag, &context]))
            .await
            .map_err(|e| {
                error!("Image build for {} failed: {}", tag, e);
                FleetError::BuildFailure(e)
            })?;
        info!("Image {} built", tag);
        Ok(())
    }

    async fn start_container(&self, spec: &ContainerSpec) -> Result<String, FleetError> {
        let out = self
            .run(run_args(spec))
            .await
            .map_err(FleetError::StartFailure)?;
        let container_id = out.trim().to_string();
        if container_id.is_empty() {
            return Err(FleetError::StartFailure(format!(
                "docker run for {} printed no container id",
                spec.tag
            )));
        }
        debug!("Started container {} from {}", container_id, spec.tag);
        Ok(container_id)
    }

    async fn list_live_containers(&self) -> Result<HashSet<String>, FleetError> {
        let out = self
            .run(argv(&["container", "ls", "-q", "--no-trunc"]))
            .await
            .map_err(FleetError::RuntimeQueryFailure)?;
        Ok(parse_container_ids(&out))
    }

    async fn cpu_utilization(&self, container_id: &str) -> Result<f64, FleetError> {
        let out = self
            .run(argv(&["stats", "--no-stream", "--format", "{{.CPUPerc}}", container_id]))
            .await
            .map_err(FleetError::RuntimeQueryFailure)?;
        parse_cpu_percent(&out).ok_or_else(|| {
            FleetError::RuntimeQueryFailure(format!(
                "unparseable cpu reading {:?} for {}",
                out.trim(),
                container_id
            ))
        })
    }

    async fn remove_container(&self, container_id: &str) -> Result<(), FleetError> {
        self.run(argv(&["rm", "-f", container_id]))
            .await
            .map_err(FleetError::RuntimeQueryFailure)?;
        debug!("Removed container {}", container_id);
        Ok(())
    }

    async fn remove_labeled_containers(&self, label: &str) -> Result<usize, FleetError> {
        let out = self
            .run(argv(&["container", "ls", "-aq", "--filter", &format!("label={}", label)]))
            .await
            .map_err(FleetError::RuntimeQueryFailure)?;
        let ids = parse_container_ids(&out);
        if ids.is_empty() {
            return Ok(0);
        }

        let mut args = argv(&["rm", "-f"]);
        args.extend(ids.iter().cloned());
        if let Err(e) = self.run(args).await {
            warn!("Failed to remove containers labeled {}: {}", label, e);
            return Err(FleetError::RuntimeQueryFailure(e));
        }
        info!("Removed {} container(s) labeled {}", ids.len(), label);
        Ok(ids.len())
    }

    async fn prune_images(&self) -> Result<(), FleetError> {
        self.run(argv(&["image", "prune", "-f"]))
            .await
            .map_err(FleetError::RuntimeQueryFailure)?;
        info!("Pruned unused images");
        Ok(())
    }
}
