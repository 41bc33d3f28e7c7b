//! Error types for the mailbox layer.

use tessera_types::CellId;
use thiserror::Error;

/// Mailbox layer errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A mailbox for this peer already exists.
    #[error("mailbox for cell {0} already exists")]
    MailboxAlreadyExists(CellId),

    /// No mailbox has been established for this peer.
    #[error("no mailbox for cell {0}")]
    MailboxNotFound(CellId),
}

/// Result type for mailbox operations.
pub type Result<T> = std::result::Result<T, Error>;
