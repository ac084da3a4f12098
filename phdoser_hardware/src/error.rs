use thiserror::Error;

#[derive(Debug, Error)]
pub enum HwError {
    /// No device path is assigned to the named USB role.
    #[error("no device assigned to role '{0}'")]
    NoDevice(&'static str),
    #[error("serial error: {0}")]
    Serial(String),
    #[error("serial timeout")]
    Timeout,
    #[error("relay port {0} out of range")]
    UnknownPort(u8),
    #[error("device offline")]
    Offline,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HwError>;

#[cfg(feature = "hardware")]
impl From<serialport::Error> for HwError {
    fn from(e: serialport::Error) -> Self {
        match e.kind() {
            serialport::ErrorKind::Io(std::io::ErrorKind::TimedOut) => HwError::Timeout,
            _ => HwError::Serial(e.to_string()),
        }
    }
}
