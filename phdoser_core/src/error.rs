use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DoserError {
    #[error("hardware error: {0}")]
    Hardware(String),
    #[error("hardware fault: {0}")]
    HardwareFault(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("timeout waiting for device")]
    Timeout,
    #[error("no device assigned to role '{0}'")]
    NoDevice(String),
    #[error("invalid dose: {0}")]
    InvalidDose(String),
    #[error("invalid state: {0}")]
    State(String),
    #[error("io error: {0}")]
    Io(String),
}

#[derive(Debug, Error, Clone)]
pub enum BuildError {
    #[error("missing relay driver")]
    MissingRelay,
    #[error("missing settings provider")]
    MissingSettings,
    #[error("missing event log")]
    MissingEventLog,
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
}

pub type Result<T> = eyre::Result<T>;
pub use eyre::Report;
