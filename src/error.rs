//! Error types for captok

use thiserror::Error;

/// Result type for captok operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for captok
#[derive(Debug, Error)]
pub enum Error {
    /// No usable automation backend in this environment. Permanent for the
    /// current process, never retried.
    #[error("Automation backend unavailable: {0}")]
    Unavailable(String),

    /// Failed to launch the browser process
    #[error("Failed to launch browser: {0}")]
    Launch(String),

    /// Transport error talking to the browser
    #[error("Transport error: {context}")]
    Transport {
        context: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Driver protocol error
    #[error("Driver error in {method}: {message}")]
    Driver { method: String, message: String },

    /// Navigation error
    #[error("Navigation error: {0}")]
    Navigation(String),

    /// Bounded operation did not finish in time
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Challenge-script evaluation rejected or threw
    #[error("Challenge execution failed: {0}")]
    Execution(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a transport error with context
    pub fn transport(context: impl Into<String>) -> Self {
        Self::Transport {
            context: context.into(),
            source: None,
        }
    }

    /// Create a transport error with IO source
    pub fn transport_io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Transport {
            context: context.into(),
            source: Some(source),
        }
    }

    /// Create a driver protocol error
    pub fn driver(method: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Driver {
            method: method.into(),
            message: message.into(),
        }
    }

    /// True for precondition failures that must surface immediately instead of
    /// feeding the retry loop.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Error::Unavailable(_))
    }
}
