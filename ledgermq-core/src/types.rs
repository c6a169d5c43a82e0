//! Strongly-typed identifiers for LedgerMQ entities.
//!
//! Explicit wrapper types keep ledger ids, entry ids, and partition ids from
//! being mixed up in the offset codec, where all three travel packed inside
//! one 64-bit word.

use std::fmt;

/// Generates a transparent u64 id wrapper with Display/Debug and raw
/// conversions.
macro_rules! define_id {
    ($name:ident, $prefix:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Creates an id from a raw u64 value.
            #[inline]
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// Returns the raw u64 value.
            #[inline]
            #[must_use]
            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", $prefix, self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}-{}", $prefix, self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> Self {
                id.get()
            }
        }
    };
}

define_id!(LedgerId, "ledger", "Identifier of an append-only log segment.");
define_id!(EntryId, "entry", "Position of an entry within a ledger.");
define_id!(ChannelId, "channel", "Identifier of one client connection.");

/// Identifier of a partition (the legacy protocol calls this a queue id).
///
/// Kept at 32 bits since the wire protocol carries queue ids as `i32` and
/// only 12 bits survive into a packed queue offset.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PartitionId(u32);

impl PartitionId {
    /// Creates a partition id from a raw u32 value.
    #[inline]
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Returns the raw u32 value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "partition({})", self.0)
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "partition-{}", self.0)
    }
}

impl From<u32> for PartitionId {
    fn from(value: u32) -> Self {
        Self::new(value)
    }
}

impl From<PartitionId> for u32 {
    fn from(id: PartitionId) -> Self {
        id.get()
    }
}

/// Full address of one stored message: which ledger, which entry within it,
/// and which partition the ledger belongs to.
///
/// Ordering is (ledger, entry); partition is an address component, not a
/// sort key, since comparisons only make sense within one partition.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct MessageRef {
    pub ledger: LedgerId,
    pub entry: EntryId,
    pub partition: PartitionId,
}

impl MessageRef {
    /// Creates a message reference from raw components.
    #[must_use]
    pub const fn new(ledger: u64, entry: u64, partition: u32) -> Self {
        Self {
            ledger: LedgerId::new(ledger),
            entry: EntryId::new(entry),
            partition: PartitionId::new(partition),
        }
    }

    /// True if this reference and `other` name the same ledger entry,
    /// ignoring the partition component.
    #[must_use]
    pub fn same_entry(&self, other: &Self) -> bool {
        self.ledger == other.ledger && self.entry == other.entry
    }

    /// True if `other` is the entry immediately following this one in the
    /// same ledger.
    #[must_use]
    pub fn precedes(&self, other: &Self) -> bool {
        self.ledger == other.ledger && other.entry.get() == self.entry.get() + 1
    }
}

impl fmt::Display for MessageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.ledger.get(),
            self.entry.get(),
            self.partition.get()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_display() {
        let ledger = LedgerId::new(42);
        assert_eq!(format!("{ledger}"), "ledger-42");
        assert_eq!(format!("{ledger:?}"), "ledger(42)");
    }

    #[test]
    fn test_partition_conversions() {
        let p = PartitionId::from(7u32);
        assert_eq!(u32::from(p), 7);
    }

    #[test]
    fn test_same_entry_ignores_partition() {
        let a = MessageRef::new(3, 9, 0);
        let b = MessageRef::new(3, 9, 5);
        assert!(a.same_entry(&b));
    }

    #[test]
    fn test_precedes() {
        let a = MessageRef::new(3, 9, 0);
        assert!(a.precedes(&MessageRef::new(3, 10, 0)));
        assert!(!a.precedes(&MessageRef::new(3, 11, 0)));
        assert!(!a.precedes(&MessageRef::new(4, 10, 0)));
    }
}
