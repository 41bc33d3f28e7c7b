//! The cell's replicated log entries.

use serde::{Deserialize, Serialize};
use tessera_hive::{SequenceNumber, SequencedMessage};
use tessera_supervisor::SupervisorMutation;
use tessera_types::CellId;

/// One entry of a cell's replicated log, applied deterministically on every
/// peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellMutation {
    /// A supervisor state transition (commit protocol).
    Supervisor(SupervisorMutation),

    /// A batch of mailbox messages accepted from a peer cell. Applying it
    /// advances the mailbox and executes the handlers of every message that
    /// became deliverable.
    HiveReceive {
        sender: CellId,
        messages: Vec<SequencedMessage>,
    },

    /// A durable acknowledgment from a peer cell; retires the acknowledged
    /// prefix of `pending_outgoing`.
    HiveAcknowledge {
        peer: CellId,
        next_expected: SequenceNumber,
    },
}
