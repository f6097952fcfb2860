use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoissonError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Device error: {0}")]
    Device(String),

    #[error("Communication error: {0}")]
    Comm(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PoissonError>;
