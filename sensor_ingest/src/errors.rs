use thiserror::Error;

/// The unified error type for the `sensor_ingest` crate.
#[derive(Debug, Error)]
pub enum Error {
    /// An error talking to the remote node.
    #[error("Remote error: {0}")]
    Remote(#[from] crate::remote::errors::RemoteError),

    /// A CSV file could not be decoded.
    #[error("Codec error: {0}")]
    Codec(#[from] crate::io::csv::CodecError),

    /// The device driver refused an operation in its current state.
    #[error("Driver error: {0}")]
    Driver(String),

    /// An error related to configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] shared_utils::config::ConfigError),

    /// A generic I/O error.
    #[error("I/O error")]
    Io(#[from] std::io::Error),
}
