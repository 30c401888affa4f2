use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriveError {
    #[error("Drive not found: {0}")]
    NotFound(String),

    #[error("Drive already exists: {0}")]
    AlreadyExists(String),

    #[error("Conflict updating drive {name}: stored version {stored}, given {given}")]
    Conflict { name: String, stored: u64, given: u64 },

    #[error("Unknown update type for drive {0}")]
    UnknownUpdateIntent(String),

    #[error("Cannot delete drive in use: {0}")]
    DriveInUse(String),

    #[error("Invalid state reached for drive {drive}: unexpected finalizer {finalizer}")]
    InvalidFinalizer { drive: String, finalizer: String },

    #[error("Failed to {op} drive {drive}: {message}")]
    Device {
        op: &'static str,
        drive: String,
        message: String,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("External tool missing: {0}")]
    ExternalToolMissing(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(String),
}

impl DriveError {
    pub fn device(op: &'static str, drive: impl Into<String>, message: impl ToString) -> Self {
        DriveError::Device {
            op,
            drive: drive.into(),
            message: message.to_string(),
        }
    }

    /// Whether redelivering the same event can make progress.
    ///
    /// Unknown update intents and invalid finalizer states only change when an
    /// operator edits the object, so the dispatcher drops them after logging.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            DriveError::UnknownUpdateIntent(_)
                | DriveError::InvalidFinalizer { .. }
                | DriveError::Configuration(_)
                | DriveError::Cancelled
        )
    }
}
