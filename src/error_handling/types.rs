use std::fmt;
use std::time::Duration;

#[derive(Debug)]
pub enum ConfigError {
    IoError(std::io::Error),
    TomlError(String),
    InvalidValue(String),
    DirectoryDoesNotExist(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {}", e),
            ConfigError::TomlError(e) => write!(f, "TOML parsing error: {}", e),
            ConfigError::InvalidValue(e) => write!(f, "Invalid configuration value: {}", e),
            ConfigError::DirectoryDoesNotExist(e) => write!(f, "Directory error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::IoError(err)
    }
}

/// Errors raised by the fleet manager and its collaborators.
///
/// Request-scoped operations (`get_pod`, `provision`, `stop_pod`) return these to the
/// caller. Background work (reconciliation, delayed provisioning, autoscale checks) only
/// logs them.
#[derive(Debug)]
pub enum FleetError {
    /// The image build step failed. Not retried.
    BuildFailure(String),
    /// A container failed to start or never reported back.
    StartFailure(String),
    /// The remote stop was not acknowledged in time.
    StopTimeout(Duration),
    /// No lease exists for the account/pod pair.
    LeaseNotFound { account_id: String, pod_id: String },
    /// The runtime could not be queried (container list, stats).
    RuntimeQueryFailure(String),
    /// The remote channel failed (handshake, request, closed link).
    ChannelError(String),
    /// A build template is missing or unreadable.
    TemplateError(String),
    IoError(std::io::Error),
}

impl fmt::Display for FleetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FleetError::BuildFailure(e) => write!(f, "Image build failed: {}", e),
            FleetError::StartFailure(e) => write!(f, "Pod start failed: {}", e),
            FleetError::StopTimeout(d) => {
                write!(f, "Pod did not acknowledge stop within {:?}", d)
            }
            FleetError::LeaseNotFound { account_id, pod_id } => {
                write!(f, "No lease for pod {} under account {}", pod_id, account_id)
            }
            FleetError::RuntimeQueryFailure(e) => write!(f, "Runtime query failed: {}", e),
            FleetError::ChannelError(e) => write!(f, "Remote channel error: {}", e),
            FleetError::TemplateError(e) => write!(f, "Template error: {}", e),
            FleetError::IoError(e) => write!(f, "Fleet IO error: {}", e),
        }
    }
}

impl std::error::Error for FleetError {}

impl From<std::io::Error> for FleetError {
    fn from(err: std::io::Error) -> Self {
        FleetError::IoError(err)
    }
}
