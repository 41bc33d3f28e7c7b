//! Client-side error types.
//!
//! Transaction operations fail with the wire-level
//! [`TxnError`](tessera_supervisor::TxnError); this module only adds the
//! configuration errors.

use thiserror::Error;

/// Configuration loading/saving errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
