//! The per-cell mailbox manager.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tessera_types::CellId;

use crate::error::{Error, Result};
use crate::mailbox::{Mailbox, SequenceNumber, SequencedMessage};

// ============================================================================
// Configuration
// ============================================================================

/// Retransmission policy for undelivered mailbox messages.
///
/// Backoff doubles per consecutive failed attempt, starting at
/// `resend_base_ticks` and capped at `resend_max_ticks`. There is no hard
/// timeout: mailboxes retry forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HiveConfig {
    pub resend_base_ticks: u64,
    pub resend_max_ticks: u64,
}

impl Default for HiveConfig {
    fn default() -> Self {
        Self {
            resend_base_ticks: 8,
            resend_max_ticks: 1024,
        }
    }
}

impl HiveConfig {
    /// Configuration for testing (tight schedule).
    pub fn testing() -> Self {
        Self {
            resend_base_ticks: 1,
            resend_max_ticks: 8,
        }
    }
}

// ============================================================================
// Outcomes
// ============================================================================

/// Result of applying a batch of received messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveOutcome {
    /// Payloads that became deliverable, in exact sender post order.
    pub delivered: Vec<Bytes>,

    /// The receiver's advanced expectation, piggybacked back to the sender
    /// as an acknowledgment.
    pub next_expected: SequenceNumber,
}

/// A batch of messages for the transport, addressed to one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundBatch {
    pub to: CellId,
    pub messages: Vec<SequencedMessage>,
}

// ============================================================================
// HiveState
// ============================================================================

/// Mailbox manager owned by one cell.
///
/// The mailbox map is part of the cell's replicated state: `post_message`,
/// `apply_receive`, and `apply_acknowledge` run only inside mutation
/// handlers and are deterministic. The outbound flush is transient
/// leader-side work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HiveState {
    self_cell_id: CellId,
    mailboxes: BTreeMap<CellId, Mailbox>,
}

impl HiveState {
    pub fn new(self_cell_id: CellId) -> Self {
        Self {
            self_cell_id,
            mailboxes: BTreeMap::new(),
        }
    }

    pub fn self_cell_id(&self) -> CellId {
        self.self_cell_id
    }

    // ------------------------------------------------------------------
    // Mailbox directory
    // ------------------------------------------------------------------

    /// Creates a mailbox for a peer; errors if one already exists.
    pub fn create_mailbox(&mut self, cell_id: CellId) -> Result<&mut Mailbox> {
        if self.mailboxes.contains_key(&cell_id) {
            return Err(Error::MailboxAlreadyExists(cell_id));
        }
        tracing::info!(peer = %cell_id, "mailbox created");
        Ok(self.mailboxes.entry(cell_id).or_insert_with(|| Mailbox::new(cell_id)))
    }

    /// Returns the mailbox for a peer, creating it on first use.
    ///
    /// A missing mailbox means the connection has not been established yet;
    /// it is never an error.
    pub fn get_or_create_mailbox(&mut self, cell_id: CellId) -> &mut Mailbox {
        self.mailboxes.entry(cell_id).or_insert_with(|| {
            tracing::info!(peer = %cell_id, "mailbox created on demand");
            Mailbox::new(cell_id)
        })
    }

    pub fn mailbox(&self, cell_id: CellId) -> Option<&Mailbox> {
        self.mailboxes.get(&cell_id)
    }

    pub fn mailbox_or_err(&self, cell_id: CellId) -> Result<&Mailbox> {
        self.mailboxes
            .get(&cell_id)
            .ok_or(Error::MailboxNotFound(cell_id))
    }

    pub fn remove_mailbox(&mut self, cell_id: CellId) -> Result<()> {
        self.mailboxes
            .remove(&cell_id)
            .map(|_| ())
            .ok_or(Error::MailboxNotFound(cell_id))
    }

    /// Iterates over all established mailboxes.
    pub fn mailboxes(&self) -> impl Iterator<Item = &Mailbox> {
        self.mailboxes.values()
    }

    // ------------------------------------------------------------------
    // Replicated-state transitions (mutation handlers only)
    // ------------------------------------------------------------------

    /// Appends a message to the peer's mailbox with the next outgoing
    /// sequence, atomically with the enclosing mutation.
    pub fn post_message(&mut self, cell_id: CellId, payload: Bytes) -> SequenceNumber {
        let mailbox = self.get_or_create_mailbox(cell_id);
        let sequence = mailbox.post(payload);
        tracing::debug!(peer = %cell_id, seq = %sequence, "message posted");
        sequence
    }

    /// Applies a batch of messages received from `sender`.
    ///
    /// Returned payloads are exactly the messages that became deliverable,
    /// in sender post order; the caller dispatches them to their handlers
    /// within the same mutation.
    pub fn apply_receive(
        &mut self,
        sender: CellId,
        messages: Vec<SequencedMessage>,
    ) -> ReceiveOutcome {
        let mailbox = self.get_or_create_mailbox(sender);
        let mut delivered = Vec::new();
        for message in messages {
            delivered.extend(mailbox.receive(message));
        }
        let next_expected = mailbox.next_expected_incoming();
        if !delivered.is_empty() {
            tracing::debug!(
                peer = %sender,
                count = delivered.len(),
                next_expected = %next_expected,
                "incoming messages delivered"
            );
        }
        ReceiveOutcome {
            delivered,
            next_expected,
        }
    }

    /// Retires acknowledged entries of the peer's `pending_outgoing`.
    pub fn apply_acknowledge(
        &mut self,
        peer: CellId,
        next_expected_by_peer: SequenceNumber,
    ) -> usize {
        let mailbox = self.get_or_create_mailbox(peer);
        let retired = mailbox.acknowledge(next_expected_by_peer);
        if retired > 0 {
            tracing::debug!(peer = %peer, retired, "outgoing messages acknowledged");
        }
        retired
    }

    // ------------------------------------------------------------------
    // Transient leader-side driving
    // ------------------------------------------------------------------

    /// Collects messages due for (re)transmission at `now_tick`.
    pub fn poll_outbound(&mut self, now_tick: u64) -> Vec<OutboundBatch> {
        let mut batches = Vec::new();
        for mailbox in self.mailboxes.values_mut() {
            let messages = mailbox.take_transmittable(now_tick);
            if !messages.is_empty() {
                batches.push(OutboundBatch {
                    to: mailbox.cell_id(),
                    messages,
                });
            }
        }
        batches
    }

    /// Records the transport outcome for one peer.
    pub fn on_delivery_result(&mut self, peer: CellId, now_tick: u64, ok: bool, config: &HiveConfig) {
        let Some(mailbox) = self.mailboxes.get_mut(&peer) else {
            return;
        };
        if ok {
            mailbox.delivery_succeeded();
        } else {
            mailbox.delivery_failed(now_tick, config.resend_base_ticks, config.resend_max_ticks);
        }
    }

    /// Drops all transient mailbox state on a leadership change.
    ///
    /// The next outbound flush resends every pending window; peers drop the
    /// duplicates by sequence.
    pub fn reset_transient(&mut self) {
        for mailbox in self.mailboxes.values_mut() {
            mailbox.reset_transient();
        }
    }
}
