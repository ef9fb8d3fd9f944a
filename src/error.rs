use thiserror::Error;

/// Expected failures of alarm registry operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unknown alarm id {0}")]
    UnknownAlarm(u32),

    #[error("invalid sound id {0}")]
    InvalidSound(usize),

    #[error("invalid {field} value {value} (expected 0...100)")]
    OutOfRange { field: &'static str, value: u32 },

    #[error("alarm {0} must have at least one week day unless it is one-time only")]
    EmptyWeekDays(u32),

    #[error("persistence failed: {0:#}")]
    Persistence(anyhow::Error),
}

/// Failures reported by sound or light backends.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OutputError {
    #[error("sound output unavailable: {0}")]
    Sound(String),

    #[error("light {id} unavailable: {reason}")]
    Light { id: u32, reason: String },
}

/// Failures of a remote command, mapped onto an `ERROR` response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// Malformed request.
    #[error("{0}")]
    Protocol(String),

    /// Well formed but rejected parameter.
    #[error("{0}")]
    Validation(String),
}

impl CommandError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

impl From<StoreError> for CommandError {
    fn from(err: StoreError) -> Self {
        Self::Validation(err.to_string())
    }
}
