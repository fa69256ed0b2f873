//! Error types used across the FleetVM engine.

use thiserror::Error;

/// Result type for FleetVM operations.
pub type FleetResult<T> = Result<T, FleetError>;

#[derive(Debug, Error)]
pub enum FleetError {
    /// Malformed option, unresolvable hostname, invalid path, or bad
    /// allow-list entry. Reported synchronously at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// An intercepted syscall rejected a path or address. Non-fatal; the
    /// guest observes EACCES/EPERM.
    #[error("policy denied: {0}")]
    PolicyDenied(String),

    /// A deadline (`max_boot_time` or `max_req_time`) was exceeded.
    #[error("machine timed out: {0}")]
    MachineTimeout(String),

    /// The guest faulted on a memory access.
    #[error("memory fault: {0}")]
    MemoryFault(String),

    /// The backend reported a non-memory machine fault (triple fault,
    /// invalid instruction, etc).
    #[error("machine fault: {0}")]
    MachineFault(String),

    /// `reset_to` reported an inconsistent state.
    #[error("reset failure: {0}")]
    ResetFailure(String),

    /// Engine/back-end reported an error outside the above taxonomy.
    #[error("engine error: {0}")]
    Engine(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl FleetError {
    /// Whether this error kind is fatal during Master boot (spec §7).
    pub fn fatal_during_boot(&self) -> bool {
        !matches!(self, FleetError::PolicyDenied(_))
    }
}

impl From<std::io::Error> for FleetError {
    fn from(err: std::io::Error) -> Self {
        FleetError::Io(err.to_string())
    }
}

impl From<toml::de::Error> for FleetError {
    fn from(err: toml::de::Error) -> Self {
        FleetError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for FleetError {
    fn from(err: toml::ser::Error) -> Self {
        FleetError::Config(err.to_string())
    }
}

impl From<String> for FleetError {
    fn from(err: String) -> Self {
        FleetError::Internal(err)
    }
}

impl From<&str> for FleetError {
    fn from(err: &str) -> Self {
        FleetError::Internal(err.to_string())
    }
}
