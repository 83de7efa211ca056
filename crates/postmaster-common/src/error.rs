//! Error types for the postmaster

use thiserror::Error;

/// Main error type shared by the storage and configuration layers
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),
}

/// Result type alias for the postmaster
pub type Result<T> = std::result::Result<T, Error>;
