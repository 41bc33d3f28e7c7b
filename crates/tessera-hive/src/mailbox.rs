//! Per-peer mailbox state.

use std::collections::{BTreeMap, VecDeque};
use std::fmt::{self, Display};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tessera_types::CellId;

// ============================================================================
// SequenceNumber
// ============================================================================

/// Position of a message within one directed (sender, receiver) channel.
///
/// Sequences start at zero and are assigned by the sender at post time.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct SequenceNumber(u64);

impl SequenceNumber {
    pub const ZERO: SequenceNumber = SequenceNumber(0);

    pub fn new(seq: u64) -> Self {
        Self(seq)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next sequence number.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Messages
// ============================================================================

/// A message travelling through a mailbox: the sender-assigned sequence plus
/// an opaque encapsulated payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencedMessage {
    pub sequence: SequenceNumber,
    pub payload: Bytes,
}

/// Alias kept for the persisted-state reading: entries of `pending_outgoing`
/// are exactly wire messages awaiting acknowledgment.
pub type OutgoingMessage = SequencedMessage;

// ============================================================================
// Mailbox
// ============================================================================

/// Durable FIFO channel to one peer cell.
///
/// The sequence counters and `pending_outgoing` are replicated state and are
/// mutated only while applying mutations; the reorder buffer and the send
/// bookkeeping are transient and rebuilt by retransmission after failover.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mailbox {
    cell_id: CellId,

    /// Sequence the next posted message will carry.
    next_outgoing_sequence: SequenceNumber,

    /// Sequence the next in-order incoming message must carry.
    next_expected_incoming: SequenceNumber,

    /// Posted messages not yet durably acknowledged by the peer.
    ///
    /// Contiguous by sequence; the front carries the oldest unacknowledged
    /// sequence.
    pending_outgoing: VecDeque<OutgoingMessage>,

    /// Incoming messages that arrived ahead of the expected sequence.
    #[serde(skip)]
    reordered_incoming: BTreeMap<SequenceNumber, Bytes>,

    /// First pending sequence not yet handed to the transport this epoch.
    #[serde(skip)]
    next_transmit_index: usize,

    /// Consecutive failed delivery attempts, drives the backoff schedule.
    #[serde(skip)]
    attempt: u32,

    /// Tick before which no retransmission is attempted.
    #[serde(skip)]
    retry_after_tick: u64,
}

impl Mailbox {
    pub fn new(cell_id: CellId) -> Self {
        Self {
            cell_id,
            next_outgoing_sequence: SequenceNumber::ZERO,
            next_expected_incoming: SequenceNumber::ZERO,
            pending_outgoing: VecDeque::new(),
            reordered_incoming: BTreeMap::new(),
            next_transmit_index: 0,
            attempt: 0,
            retry_after_tick: 0,
        }
    }

    pub fn cell_id(&self) -> CellId {
        self.cell_id
    }

    pub fn next_outgoing_sequence(&self) -> SequenceNumber {
        self.next_outgoing_sequence
    }

    pub fn next_expected_incoming(&self) -> SequenceNumber {
        self.next_expected_incoming
    }

    /// Messages posted but not yet acknowledged by the peer.
    pub fn pending_outgoing(&self) -> &VecDeque<OutgoingMessage> {
        &self.pending_outgoing
    }

    /// Number of buffered out-of-order incoming messages.
    pub fn reordered_incoming_len(&self) -> usize {
        self.reordered_incoming.len()
    }

    // ------------------------------------------------------------------
    // Replicated-state transitions (mutation handlers only)
    // ------------------------------------------------------------------

    /// Appends a message with the next outgoing sequence.
    pub(crate) fn post(&mut self, payload: Bytes) -> SequenceNumber {
        let sequence = self.next_outgoing_sequence;
        self.next_outgoing_sequence = sequence.next();
        self.pending_outgoing
            .push_back(SequencedMessage { sequence, payload });

        debug_assert!(
            self.pending_outgoing
                .back()
                .map(|m| m.sequence)
                .unwrap_or(SequenceNumber::ZERO)
                .as_u64()
                - self.pending_outgoing[0].sequence.as_u64()
                == self.pending_outgoing.len() as u64 - 1,
            "pending_outgoing must stay contiguous"
        );

        sequence
    }

    /// Applies one incoming message; returns the payloads that became
    /// deliverable, in sequence order.
    ///
    /// Duplicates (below the expected sequence) are dropped, the expected
    /// sequence is delivered together with any buffered contiguous
    /// successors, later sequences are buffered.
    pub(crate) fn receive(&mut self, message: SequencedMessage) -> Vec<Bytes> {
        let SequencedMessage { sequence, payload } = message;

        if sequence < self.next_expected_incoming {
            tracing::debug!(
                peer = %self.cell_id,
                seq = %sequence,
                expected = %self.next_expected_incoming,
                "dropping duplicate incoming message"
            );
            return Vec::new();
        }

        if sequence > self.next_expected_incoming {
            tracing::debug!(
                peer = %self.cell_id,
                seq = %sequence,
                expected = %self.next_expected_incoming,
                "buffering out-of-order incoming message"
            );
            self.reordered_incoming.insert(sequence, payload);
            return Vec::new();
        }

        let mut delivered = vec![payload];
        self.next_expected_incoming = self.next_expected_incoming.next();

        // Drain buffered contiguous successors.
        while let Some(payload) = self.reordered_incoming.remove(&self.next_expected_incoming) {
            delivered.push(payload);
            self.next_expected_incoming = self.next_expected_incoming.next();
        }

        delivered
    }

    /// Retires pending entries the peer has durably acknowledged.
    ///
    /// Returns the number of entries retired. Stale acknowledgments (at or
    /// below an already-retired sequence) are no-ops.
    pub(crate) fn acknowledge(&mut self, next_expected_by_peer: SequenceNumber) -> usize {
        let mut retired = 0;
        while let Some(front) = self.pending_outgoing.front() {
            if front.sequence >= next_expected_by_peer {
                break;
            }
            self.pending_outgoing.pop_front();
            retired += 1;
        }
        if retired > 0 {
            self.next_transmit_index = self.next_transmit_index.saturating_sub(retired);
        }
        retired
    }

    // ------------------------------------------------------------------
    // Transient send bookkeeping (leader only)
    // ------------------------------------------------------------------

    /// Messages to hand to the transport at `now_tick`, if any.
    ///
    /// First flush after becoming leader (or after a failed attempt whose
    /// backoff expired) resends the whole pending window; otherwise only
    /// messages posted since the last flush go out.
    pub(crate) fn take_transmittable(&mut self, now_tick: u64) -> Vec<SequencedMessage> {
        if now_tick < self.retry_after_tick {
            return Vec::new();
        }
        if self.next_transmit_index >= self.pending_outgoing.len() {
            return Vec::new();
        }
        let batch: Vec<SequencedMessage> = self
            .pending_outgoing
            .iter()
            .skip(self.next_transmit_index)
            .cloned()
            .collect();
        self.next_transmit_index = self.pending_outgoing.len();
        batch
    }

    /// Records a failed delivery attempt and schedules the retransmission
    /// per the backoff schedule.
    pub(crate) fn delivery_failed(&mut self, now_tick: u64, base: u64, max: u64) {
        self.attempt = self.attempt.saturating_add(1);
        let backoff = base
            .saturating_mul(1u64.checked_shl(self.attempt - 1).unwrap_or(u64::MAX))
            .min(max);
        self.retry_after_tick = now_tick + backoff;
        // Everything unacknowledged goes out again on the next flush.
        self.next_transmit_index = 0;

        tracing::debug!(
            peer = %self.cell_id,
            attempt = self.attempt,
            retry_after = self.retry_after_tick,
            pending = self.pending_outgoing.len(),
            "delivery failed, backing off"
        );
    }

    /// Records a successful delivery attempt, resetting the backoff.
    pub(crate) fn delivery_succeeded(&mut self) {
        self.attempt = 0;
        self.retry_after_tick = 0;
    }

    /// Clears transient state on a leadership change; the next flush resends
    /// the entire pending window.
    pub(crate) fn reset_transient(&mut self) {
        self.reordered_incoming.clear();
        self.next_transmit_index = 0;
        self.attempt = 0;
        self.retry_after_tick = 0;
    }
}
