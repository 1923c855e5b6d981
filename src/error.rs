//! Error types for beagle-link

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// beagle-link error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    TomlDe(#[from] toml::de::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    /// Missing or invalid configuration (never retried)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid argument passed by the caller
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Unexpected or malformed response from the proxy
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Line framer filled up without seeing a line terminator
    #[error("Line buffer overflow: no terminator within {capacity} bytes")]
    BufferOverflow {
        /// Framer capacity in bytes
        capacity: usize,
    },

    /// Command issued while the channel is not connected
    #[error("Not connected")]
    NotConnected,

    /// Operation not legal in the current lifecycle state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}
