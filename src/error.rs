use thiserror::Error;

/// Error types for dmrelay operations.
///
/// The taxonomy is deliberately narrow: per-packet faults (malformed frames,
/// bad digests, out-of-range identifiers) are logged and dropped inside the
/// dispatcher rather than surfaced here. Errors of this type terminate an
/// operation: binding the socket, reading the configuration, or a status
/// query that gets no reply.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error occurred during socket or file operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file failed to parse as TOML.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration value is out of range or inconsistent.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A bounded wait expired without a response.
    #[error("Timed out: {0}")]
    Timeout(String),
}

/// Result type alias for dmrelay operations.
pub type Result<T> = std::result::Result<T, Error>;
