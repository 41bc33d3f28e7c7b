//! # tessera-types: Core types for Tessera
//!
//! This crate contains the identifier and temporal types shared across the
//! transaction-coordination core:
//! - Cell identity ([`CellId`], [`CellKind`])
//! - Transaction identity ([`TransactionId`])
//! - Idempotency keys ([`MutationId`])
//! - Logical time ([`Timestamp`])
//!
//! All identifiers are cheap `Copy` values with stable serialized forms.

use std::fmt::{self, Debug, Display};

use serde::{Deserialize, Serialize};

// ============================================================================
// CellKind
// ============================================================================

/// The kind of a cell, carried as a tag inside [`CellId`].
///
/// Master cells own the object hierarchy; tablet cells host table shards.
/// The coordinator treats both uniformly, but clients route differently
/// (master transactions are created by RPC, tablet transactions are
/// synthesized locally).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum CellKind {
    Master = 1,
    Tablet = 2,
}

impl CellKind {
    /// Decodes a kind from its tag value.
    pub fn from_tag(tag: u16) -> Option<Self> {
        match tag {
            1 => Some(CellKind::Master),
            2 => Some(CellKind::Tablet),
            _ => None,
        }
    }

    /// Returns the tag value embedded into identifiers.
    pub fn tag(self) -> u16 {
        self as u16
    }
}

impl Display for CellKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellKind::Master => write!(f, "master"),
            CellKind::Tablet => write!(f, "tablet"),
        }
    }
}

// ============================================================================
// CellId
// ============================================================================

/// Stable 128-bit identifier of a cell.
///
/// **Bit layout**:
/// - Upper 16 bits: [`CellKind`] tag
/// - Lower 112 bits: cell-unique value
///
/// Ordering is plain unsigned ordering over the full 128 bits, so ids of the
/// same kind sort by value. This is what makes "lowest participant id" a
/// deterministic coordinator choice.
///
/// # Examples
///
/// ```
/// # use tessera_types::{CellId, CellKind};
/// let id = CellId::tablet(7);
/// assert_eq!(id.kind(), CellKind::Tablet);
/// assert!(CellId::tablet(3) < CellId::tablet(7));
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CellId(u128);

impl CellId {
    const VALUE_MASK: u128 = (1 << 112) - 1;

    /// Creates a cell id from a kind tag and a unique value.
    pub fn new(kind: CellKind, value: u128) -> Self {
        debug_assert!(value <= Self::VALUE_MASK, "cell value overflows 112 bits");
        Self((u128::from(kind.tag()) << 112) | (value & Self::VALUE_MASK))
    }

    /// Creates a master cell id.
    pub fn master(value: u128) -> Self {
        Self::new(CellKind::Master, value)
    }

    /// Creates a tablet cell id.
    pub fn tablet(value: u128) -> Self {
        Self::new(CellKind::Tablet, value)
    }

    /// Returns the kind tag.
    ///
    /// # Panics
    ///
    /// Panics if the tag bits do not name a known kind; ids are only
    /// constructed through [`CellId::new`], so this indicates corruption.
    pub fn kind(self) -> CellKind {
        CellKind::from_tag((self.0 >> 112) as u16).expect("cell id carries an unknown kind tag")
    }

    /// Returns the cell-unique value (lower 112 bits).
    pub fn value(self) -> u128 {
        self.0 & Self::VALUE_MASK
    }

    /// Returns the raw 128-bit representation.
    pub fn as_u128(self) -> u128 {
        self.0
    }
}

impl Debug for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CellId({self})")
    }
}

impl Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:x}", self.kind(), self.value())
    }
}

// ============================================================================
// TransactionId
// ============================================================================

/// 128-bit transaction identifier.
///
/// Chosen by the originating authority (the master cell for master
/// transactions, the client itself for tablet transactions). Embeds the
/// originating cell kind and a fragment of the start timestamp, but the
/// coordinator treats the whole id as opaque.
///
/// **Bit layout** (when synthesized locally):
/// - Upper 16 bits: originating [`CellKind`] tag
/// - Next 64 bits: start-timestamp fragment
/// - Lower 48 bits: per-process counter
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionId(u128);

impl TransactionId {
    /// Synthesizes a transaction id from its parts.
    ///
    /// # Examples
    ///
    /// ```
    /// # use tessera_types::{CellKind, Timestamp, TransactionId};
    /// let a = TransactionId::from_parts(CellKind::Tablet, Timestamp::new(100), 1);
    /// let b = TransactionId::from_parts(CellKind::Tablet, Timestamp::new(100), 2);
    /// assert_ne!(a, b);
    /// ```
    pub fn from_parts(kind: CellKind, start_timestamp: Timestamp, counter: u64) -> Self {
        let tag = u128::from(kind.tag()) << 112;
        let ts = u128::from(start_timestamp.as_u64()) << 48;
        let ctr = u128::from(counter & 0xFFFF_FFFF_FFFF);
        Self(tag | ts | ctr)
    }

    /// Creates a transaction id from a raw 128-bit value.
    pub fn from_raw(raw: u128) -> Self {
        Self(raw)
    }

    /// Returns the raw 128-bit representation.
    pub fn as_u128(self) -> u128 {
        self.0
    }
}

impl Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionId({self})")
    }
}

impl Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}-{:x}", (self.0 >> 64) as u64, self.0 as u64)
    }
}

// ============================================================================
// MutationId
// ============================================================================

/// Optional client-supplied idempotency key for a mutating RPC.
///
/// When present, the coordinator's log retains the serialized response under
/// this key so that client retries of the same request observe the original
/// reply byte-for-byte.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MutationId(u128);

impl MutationId {
    pub fn new(id: u128) -> Self {
        Self(id)
    }

    pub fn as_u128(self) -> u128 {
        self.0
    }
}

impl Debug for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MutationId({:x})", self.0)
    }
}

impl Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

// ============================================================================
// Timestamp
// ============================================================================

/// 64-bit logical timestamp issued by the timestamp provider.
///
/// The value space is split by the two highest bits, which carry the
/// tombstone and incremental flags; the remaining 62 bits hold the monotone
/// counter. All comparisons are plain unsigned comparisons.
///
/// Reserved sentinels:
/// - [`Timestamp::NULL`] — uninitialized / absent
/// - [`Timestamp::MIN_VALID`] — smallest provider-issued value
/// - [`Timestamp::MAX_VALID`] — largest provider-issued value
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Uninitialized/invalid timestamp.
    pub const NULL: Timestamp = Timestamp(0);

    /// Smallest valid provider-issued timestamp.
    pub const MIN_VALID: Timestamp = Timestamp(0x0000_0000_0000_0001);

    /// Largest valid provider-issued timestamp.
    pub const MAX_VALID: Timestamp = Timestamp(0x0FFF_FFFF_FFFF_FFFF);

    /// Mask selecting the counter value (low 62 bits).
    pub const VALUE_MASK: u64 = 0x3FFF_FFFF_FFFF_FFFF;

    /// Flag bit marking a tombstone write.
    pub const TOMBSTONE_MASK: u64 = 0x8000_0000_0000_0000;

    /// Flag bit marking an incremental write.
    pub const INCREMENTAL_MASK: u64 = 0x4000_0000_0000_0000;

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the counter value with both flag bits cleared.
    pub fn value(self) -> u64 {
        self.0 & Self::VALUE_MASK
    }

    /// True for provider-issued values in `[MIN_VALID, MAX_VALID]`.
    pub fn is_valid(self) -> bool {
        self >= Self::MIN_VALID && self <= Self::MAX_VALID
    }

    pub fn is_null(self) -> bool {
        self == Self::NULL
    }

    pub fn is_tombstone(self) -> bool {
        self.0 & Self::TOMBSTONE_MASK != 0
    }

    pub fn is_incremental(self) -> bool {
        self.0 & Self::INCREMENTAL_MASK != 0
    }

    /// Returns this timestamp with the tombstone flag set.
    pub fn with_tombstone(self) -> Self {
        Self(self.0 | Self::TOMBSTONE_MASK)
    }

    /// Returns this timestamp with the incremental flag set.
    pub fn with_incremental(self) -> Self {
        Self(self.0 | Self::INCREMENTAL_MASK)
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Timestamp {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Timestamp> for u64 {
    fn from(ts: Timestamp) -> Self {
        ts.0
    }
}

// ============================================================================
// Tests
// ============================================================================
