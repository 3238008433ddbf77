/// Result alias that carries the custom [`PulseError`] type.
pub type Result<T> = std::result::Result<T, PulseError>;

/// Common error type for the core crate.
///
/// Only the persistence and configuration paths produce errors. Session
/// binding, parameter updates and the render callback degrade silently to
/// "no trigger" instead.
#[derive(Debug, thiserror::Error)]
pub enum PulseError {
    /// Free-form failure with a readable message.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// A parameter or configuration file could not be (de)serialised.
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),
}

impl PulseError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }
}

impl From<&str> for PulseError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for PulseError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
