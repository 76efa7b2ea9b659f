//! Error types for Argon

use thiserror::Error;

/// Result type alias using ArgonError
pub type Result<T> = std::result::Result<T, ArgonError>;

/// Main error type for Argon operations
#[derive(Debug, Error)]
pub enum ArgonError {
    /// Display/capture back-end error
    #[error("Display error: {0}")]
    Display(String),

    /// Encoder error
    #[error("Encoder error: {0}")]
    Encoder(String),

    /// Scaler/format-conversion error
    #[error("Scaler error: {0}")]
    Scaler(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Encoder probing failed
    #[error("Probe error: {0}")]
    Probe(String),

    /// Unsupported operation
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<ArgonError>,
    },
}

impl ArgonError {
    /// Create a display error
    pub fn display(msg: impl Into<String>) -> Self {
        Self::Display(msg.into())
    }

    /// Create an encoder error
    pub fn encoder(msg: impl Into<String>) -> Self {
        Self::Encoder(msg.into())
    }

    /// Create a scaler error
    pub fn scaler(msg: impl Into<String>) -> Self {
        Self::Scaler(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a probe error
    pub fn probe(msg: impl Into<String>) -> Self {
        Self::Probe(msg.into())
    }

    /// Create an unsupported-operation error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Self::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }
}

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }
}

impl From<ffmpeg_next::Error> for ArgonError {
    fn from(err: ffmpeg_next::Error) -> Self {
        Self::Encoder(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_chains() {
        let err: Result<()> = Err(ArgonError::encoder("send_frame failed"));
        let err = err.context("h264_nvenc").unwrap_err();
        assert!(err.to_string().contains("h264_nvenc"));
        assert!(matches!(err, ArgonError::WithContext { .. }));
    }
}
