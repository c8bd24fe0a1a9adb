//! Grid engine error types

use thiserror::Error;

/// Errors that can occur in grid engine operations
#[derive(Error, Debug, Clone)]
pub enum GridError {
    #[error("Invalid grid configuration: {0}")]
    InvalidConfig(String),

    #[error("Exchange error: {0}")]
    Exchange(String),

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Bot not found: {0}")]
    BotNotFound(String),

    /// Exchange refused the order outright; retrying will not help
    #[error("Order rejected: {0}")]
    OrderRejected(String),

    #[error("Insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: f64, available: f64 },

    #[error("Order placement failed after {attempts} attempts: {reason}")]
    OrderPlacementFailed { attempts: u32, reason: String },

    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Local records contradict each other (e.g. a filled order without its step)
    #[error("Data integrity error: {0}")]
    DataIntegrity(String),

    #[error("Bot is in invalid state for operation: {current_state}")]
    InvalidState { current_state: String },

    #[error("Notification error: {0}")]
    Notification(String),

    #[error("JSON parse error: {0}")]
    JsonParse(String),
}

impl GridError {
    /// Whether retrying the same call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GridError::Exchange(_) | GridError::Notification(_) | GridError::Persistence(_)
        )
    }
}

impl From<serde_json::Error> for GridError {
    fn from(err: serde_json::Error) -> Self {
        GridError::JsonParse(err.to_string())
    }
}

impl From<std::io::Error> for GridError {
    fn from(err: std::io::Error) -> Self {
        GridError::Persistence(err.to_string())
    }
}

impl From<reqwest::Error> for GridError {
    fn from(err: reqwest::Error) -> Self {
        GridError::Exchange(err.to_string())
    }
}

/// Result type for grid operations
pub type GridResult<T> = std::result::Result<T, GridError>;
