//! Remote channel adapter
//!
//! Components:
//! - `types`: the [`RemoteChannel`] / [`PodControl`] traits and the delegation types the
//!   fleet manager depends on.
//! - `tcp_channel`: JSON-lines TCP implementation, manager and pod sides.

pub mod tcp_channel;
pub mod types;

pub use tcp_channel::{connect_pod, PodEndpoint, TcpChannel};
pub use types::{Bindings, Delegation, PodControl, PodEvent, PodLink, RemoteChannel};
