use thiserror::Error;

/// Crate-wide error type
///
/// Every device-level variant is fatal: nothing in the bridge retries.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to open device [{device}]: {reason}")]
    DeviceOpen { device: String, reason: String },

    #[error("Format negotiation failed [{device}]: {reason}")]
    Format { device: String, reason: String },

    #[error("Buffer allocation failed [{device}]: {reason}")]
    Alloc { device: String, reason: String },

    #[error("Buffer queue error [{device}]: {reason}")]
    Queue { device: String, reason: String },

    #[error("Streaming state error [{device}]: {reason}")]
    State { device: String, reason: String },

    #[error("Stream {index} worker failed: {reason}")]
    Worker { index: usize, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    pub(crate) fn open(device: &str, reason: impl ToString) -> Self {
        Self::DeviceOpen {
            device: device.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn format(device: &str, reason: impl ToString) -> Self {
        Self::Format {
            device: device.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn alloc(device: &str, reason: impl ToString) -> Self {
        Self::Alloc {
            device: device.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn queue(device: &str, reason: impl ToString) -> Self {
        Self::Queue {
            device: device.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn state(device: &str, reason: impl ToString) -> Self {
        Self::State {
            device: device.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Result type alias used across the crate
pub type Result<T> = std::result::Result<T, BridgeError>;
