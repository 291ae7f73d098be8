use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Device transport error: {0}")]
    Transport(String),
    #[error("Device returned HTTP {status}: {body}")]
    DeviceStatus { status: u16, body: String },
    #[error("Malformed device response: {0}")]
    Decode(String),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Operation cancelled")]
    Cancelled,
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl AppError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, AppError::Cancelled)
    }

    /// Failures talking to a metering device: network, status or body shape.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            AppError::Transport(_) | AppError::DeviceStatus { .. } | AppError::Decode(_)
        )
    }

    pub fn is_storage(&self) -> bool {
        matches!(self, AppError::Storage(_))
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
