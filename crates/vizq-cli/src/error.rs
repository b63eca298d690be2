use thiserror::Error;
use vizq_core::CoreError;
use vizq_warehouse::WarehouseError;

/// CLI-level error categories mapped to exit codes.
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Validation(#[from] vizq_core::ValidationError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Warehouse(#[from] WarehouseError),

    #[error("command error: {0}")]
    Command(String),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CliError {
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Validation(_) | Self::Command(_) => 2,
            Self::Core(CoreError::Validation(_)) => 2,
            Self::Core(CoreError::Access(_)) => 3,
            Self::Serialization(_) | Self::Core(CoreError::Serialization(_)) => 4,
            Self::Core(CoreError::CacheUnavailable { .. }) => 6,
            Self::Core(_) | Self::Warehouse(_) | Self::Io(_) => 10,
        }
    }
}
