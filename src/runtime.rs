//! Container runtime adapter
//!
//! Components:
//! - `runtime_trait`: the [`ContainerRuntime`] trait the fleet manager depends on.
//! - `docker_cli`: implementation driving the `docker` command line client.

pub mod docker_cli;
pub mod runtime_trait;

pub use docker_cli::DockerCli;
pub use runtime_trait::{ContainerRuntime, ContainerSpec, Mount};
