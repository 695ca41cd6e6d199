//! Container runtime trait
//!
//! This module defines the `ContainerRuntime` trait, the imperative interface the fleet
//! manager uses to build images and start, list, inspect and remove containers.
//!
//! The manager never assumes exclusive access to the runtime: implementations are shared
//! behind an `Arc` and may be called concurrently from provisioning, autoscale timers and
//! the reconciliation loop.

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error_handling::types::FleetError;
use crate::fleet_management::types::Resources;

/// Host directory bind-mounted into a container.
#[derive(Debug, Clone, PartialEq)]
pub struct Mount {
    pub host_path: PathBuf,
    pub container_path: String,
}

/// Everything needed to start one pod container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    /// Image tag to run.
    pub tag: String,
    /// Environment variables handed to the pod.
    pub env: Vec<(String, String)>,
    pub mounts: Vec<Mount>,
    pub resources: Resources,
    /// Label applied to every fleet container, used for bulk cleanup.
    pub label: String,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Whether an image with `tag` is already present.
    async fn image_exists(&self, tag: &str) -> Result<bool, FleetError>;

    /// Builds the image `tag` from the build context in `context`.
    async fn build_image(&self, tag: &str, context: &Path) -> Result<(), FleetError>;

    /// Starts a detached container and returns its runtime id.
    ///
    /// Returns once the launcher exits, not once the pod inside is ready.
    async fn start_container(&self, spec: &ContainerSpec) -> Result<String, FleetError>;

    /// Ids of every container currently running.
    async fn list_live_containers(&self) -> Result<HashSet<String>, FleetError>;

    /// Instantaneous CPU utilization of a container, in percent.
    async fn cpu_utilization(&self, container_id: &str) -> Result<f64, FleetError>;

    /// Force-removes one container.
    async fn remove_container(&self, container_id: &str) -> Result<(), FleetError>;

    /// Force-removes every container carrying `label`, returning how many were removed.
    async fn remove_labeled_containers(&self, label: &str) -> Result<usize, FleetError>;

    /// Removes dangling images.
    async fn prune_images(&self) -> Result<(), FleetError>;
}
