//! Reliable inter-cell messaging ("hive") for Tessera.
//!
//! Each cell owns one [`Mailbox`] per peer cell it has ever communicated
//! with. A mailbox is a durable FIFO channel: outgoing messages are appended
//! atomically with the mutation that produced them and survive leader
//! failover; incoming messages are applied strictly in sequence order with
//! no gaps and no duplicates, whatever the transport does.
//!
//! # Transport contract
//!
//! The transport may reorder, duplicate, drop, or delay messages
//! arbitrarily. The mailbox recovers exactly-once in-order delivery from
//! sender-assigned sequence numbers and durable outgoing state:
//!
//! - sequences below `next_expected_incoming` are duplicates and dropped;
//! - the next expected sequence is delivered and may drain previously
//!   buffered contiguous successors;
//! - later sequences are buffered until the gap fills.
//!
//! # Failover
//!
//! On sender failover the new leader resends everything still pending from
//! its replicated state. On receiver failover the new leader re-advertises
//! `next_expected_incoming`; the sender retires acknowledged entries and
//! retransmits the rest. Delivery is retried with exponential backoff and
//! never times out.
//!
//! # Key types
//!
//! - [`Mailbox`]: the per-peer channel state
//! - [`HiveState`]: the per-cell mailbox manager (replicated state)
//! - [`ReceiveOutcome`]: in-order payloads produced by applying a receive

mod error;
mod mailbox;
mod manager;

pub use error::{Error, Result};
pub use mailbox::{Mailbox, OutgoingMessage, SequenceNumber, SequencedMessage};
pub use manager::{HiveConfig, HiveState, OutboundBatch, ReceiveOutcome};
