//! Remote channel boundary types
//!
//! The fleet manager reaches a pod only through these types:
//! - [`RemoteChannel::delegate`] opens a pending delegation before a container starts. The
//!   route and key it returns are handed to the pod through its environment.
//! - Once the pod connects back, the delegation's single-use `link` receiver resolves with a
//!   [`PodLink`]: the live [`PodControl`] handle and the stream of [`PodEvent`]s the pod
//!   sends to the manager.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::error_handling::types::FleetError;
use crate::fleet_management::types::PodId;

/// Named values exchanged with a pod's sandbox.
pub type Bindings = serde_json::Map<String, serde_json::Value>;

/// Notifications a pod sends to the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PodEvent {
    /// Activity happened; push the autostop deadline back.
    KeepAlive,
    /// The pod is shutting down on its own.
    Stopping,
}

/// Live control handle of a running pod.
#[async_trait]
pub trait PodControl: Send + Sync {
    async fn execute(
        &self,
        code: &str,
        inputs: Bindings,
        scope: Option<&str>,
    ) -> Result<Bindings, FleetError>;

    async fn stop(&self) -> Result<(), FleetError>;
}

/// What a started pod hands back to the manager.
pub struct PodLink {
    pub control: Arc<dyn PodControl>,
    pub events: mpsc::UnboundedReceiver<PodEvent>,
}

/// A pending delegation for one pod that has not connected yet.
pub struct Delegation {
    /// Serialized route descriptor the pod presents when it calls back.
    pub route: String,
    /// Secret the pod must present together with the route.
    pub key: String,
    /// Resolves once the pod has called back. Dropping it abandons the delegation.
    pub link: oneshot::Receiver<PodLink>,
}

pub trait RemoteChannel: Send + Sync {
    /// Address pods connect back to.
    fn url(&self) -> String;

    /// Opens a delegation for `pod_id`.
    fn delegate(&self, pod_id: PodId) -> Result<Delegation, FleetError>;
}
