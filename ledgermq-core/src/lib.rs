//! Core domain types for LedgerMQ.
//!
//! LedgerMQ is a protocol-translation broker: clients speak a legacy
//! pull-based messaging protocol addressed by dense 64-bit queue offsets,
//! while the storage behind it is a segmented log addressed by
//! (ledger, entry, partition) triples. This crate holds everything both
//! sides of that translation agree on:
//!
//! - [`offset`]: the queue-offset codec bridging the two addressing models
//! - [`topic`]: legacy topic string parsing and backend topic naming
//! - [`message`]: the message model and its on-wire store frame
//! - [`filter`]: subscription expression evaluation (tag and SQL-like)
//! - [`types`]: strongly-typed identifiers
//! - [`limits`]: shared tuning constants
//!
//! The crate is deliberately free of I/O so the broker and backend crates
//! can both depend on it.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod filter;
pub mod limits;
pub mod message;
pub mod offset;
pub mod topic;
pub mod types;

pub use error::{CoreError, CoreResult};
pub use types::{ChannelId, EntryId, LedgerId, MessageRef, PartitionId};
