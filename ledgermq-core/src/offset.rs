//! Queue offset codec.
//!
//! The legacy protocol addresses messages with a dense 64-bit queue offset;
//! the backend addresses them with a (ledger, entry, partition) triple. This
//! module packs the triple into a signed 64-bit offset that is
//! order-preserving within a partition, and unpacks it again.
//!
//! # Layout
//!
//! ```text
//!  63            62..34              33..12            11..0
//! ┌───┬───────────────────────┬─────────────────┬──────────────┐
//! │ 0 │  ledger + 1 (29 bits) │ entry (22 bits) │ part (12 bits)│
//! └───┴───────────────────────┴─────────────────┴──────────────┘
//! ```
//!
//! The ledger component is stored biased by one so that every encoded offset
//! is strictly greater than [`MIN_ROP_OFFSET`]; the sign bit stays clear so
//! every encoded offset is strictly less than [`MAX_ROP_OFFSET`]. The two
//! sentinels therefore never collide with a real position and remain plain
//! numeric comparisons.

use crate::error::{CoreError, CoreResult};
use crate::types::MessageRef;

/// Bits available for the (unbiased) ledger id. Valid ledgers are
/// `0..2^LEDGER_BITS`.
pub const LEDGER_BITS: u32 = 28;

/// Bits available for the entry id.
pub const ENTRY_BITS: u32 = 22;

/// Bits available for the partition id.
pub const PARTITION_BITS: u32 = 12;

const ENTRY_SHIFT: u32 = PARTITION_BITS;
const LEDGER_SHIFT: u32 = PARTITION_BITS + ENTRY_BITS;

/// Offsets at or below this sentinel mean "start from the earliest available
/// message". Legacy clients also send negative offsets with that meaning.
pub const MIN_ROP_OFFSET: i64 = 0;

/// Offsets at or above this sentinel mean "start from the tail".
pub const MAX_ROP_OFFSET: i64 = i64::MAX;

/// What a wire queue offset denotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetClass {
    /// Start from the earliest available message.
    Earliest,
    /// Start from the tail of the partition.
    Latest,
    /// An exact (ledger, entry, partition) position.
    Exact,
}

/// Classifies a wire queue offset.
#[must_use]
pub const fn classify(offset: i64) -> OffsetClass {
    if offset <= MIN_ROP_OFFSET {
        OffsetClass::Earliest
    } else if offset >= MAX_ROP_OFFSET {
        OffsetClass::Latest
    } else {
        OffsetClass::Exact
    }
}

/// Packs a message reference into a wire queue offset.
///
/// Within one partition the result is strictly increasing in (ledger, entry)
/// order, so encoded offsets of later messages always compare greater.
///
/// # Errors
///
/// Returns [`CoreError::OffsetOverflow`] if any component exceeds its bit
/// width. Overflow here means the backend has outgrown the wire contract;
/// callers treat it as fatal for the connection.
pub fn encode(msg: MessageRef) -> CoreResult<i64> {
    let ledger = msg.ledger.get();
    let entry = msg.entry.get();
    let partition = msg.partition.get();

    if ledger >= (1 << LEDGER_BITS)
        || entry >= (1 << ENTRY_BITS)
        || u64::from(partition) >= (1 << PARTITION_BITS)
    {
        return Err(CoreError::OffsetOverflow {
            ledger,
            entry,
            partition,
        });
    }

    let packed = ((ledger + 1) << LEDGER_SHIFT) | (entry << ENTRY_SHIFT) | u64::from(partition);
    // The biased ledger occupies at most 29 bits, keeping the sign bit clear.
    #[allow(clippy::cast_possible_wrap)]
    let offset = packed as i64;
    Ok(offset)
}

/// Unpacks a wire queue offset back into a message reference.
///
/// # Errors
///
/// Returns [`CoreError::OffsetNotExact`] if the offset is in the sentinel
/// ranges (use [`classify`] first).
pub fn decode(offset: i64) -> CoreResult<MessageRef> {
    if !matches!(classify(offset), OffsetClass::Exact) {
        return Err(CoreError::OffsetNotExact(offset));
    }

    #[allow(clippy::cast_sign_loss)]
    let packed = offset as u64;
    let ledger = (packed >> LEDGER_SHIFT) - 1;
    let entry = (packed >> ENTRY_SHIFT) & ((1 << ENTRY_BITS) - 1);
    #[allow(clippy::cast_possible_truncation)]
    let partition = (packed & ((1 << PARTITION_BITS) - 1)) as u32;

    Ok(MessageRef::new(ledger, entry, partition))
}
