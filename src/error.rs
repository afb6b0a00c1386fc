//! Error types for Netium embed

use thiserror::Error;

/// Main error type for the embeddable core
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration document is not well-formed
    #[error("Config decode error: {0}")]
    Decode(String),

    /// The document decoded but cannot be wired into a runtime graph
    #[error("Config build error: {0}")]
    Build(String),

    /// The instance failed to bind or initialize
    #[error("Start error: {0}")]
    Start(String),

    #[error("No active instance")]
    NoActiveInstance,

    #[error("Instance is not running")]
    NotRunning,

    #[error("Invalid destination: {0}")]
    DestinationParse(String),

    /// Any HTTP-layer failure of a latency probe
    #[error("Probe failed: {0}")]
    ProbeTransport(String),

    #[error("Cleanup error: {0}")]
    ResourceCleanup(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Timeout")]
    Timeout,

    #[error("Unsupported feature: {0}")]
    Unsupported(String),
}

/// Result type alias for Netium embed
pub type Result<T> = std::result::Result<T, Error>;
