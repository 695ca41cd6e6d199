pub mod build_context;
pub use build_context::BuildContext;

pub mod channel;

pub mod configuration;
pub use configuration::Config;

pub mod error_handling;

pub mod file_sync;

pub mod fleet_management;
pub use fleet_management::FleetManager;

pub mod runtime;

pub mod sandbox;
