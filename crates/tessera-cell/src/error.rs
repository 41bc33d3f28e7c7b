//! Error types for the cell automaton.

use thiserror::Error;

/// Cell automaton errors.
#[derive(Error, Debug)]
pub enum Error {
    /// Snapshot was produced by an unknown layout version.
    #[error("unsupported snapshot version {0} (current is {1})")]
    UnsupportedSnapshotVersion(u32, u32),

    /// Snapshot bytes failed to parse.
    #[error("corrupt snapshot: {0}")]
    CorruptSnapshot(String),

    /// Snapshot serialization failed.
    #[error("snapshot serialization failed: {0}")]
    SnapshotSerialization(String),
}

/// Result type for cell operations.
pub type Result<T> = std::result::Result<T, Error>;
