//! LedgerMQ broker: the legacy pull-protocol front end over a
//! ledger-addressed log store.
//!
//! Clients speak the legacy producer/consumer wire protocol; every
//! operation is served from a pluggable segmented log store
//! (`ledgermq_backend::LogStore`). The crate is organized around the
//! request paths:
//!
//! - [`remoting`]: frames, commands, typed headers, codes
//! - [`session`]: per-connection backend handle cache and store operations
//! - [`producer`]: send / batch send / send-back pipeline
//! - [`pull`]: pull pipeline with long-poll suspension
//! - [`hold`]: parked pulls, arrival bus, timeout sweep
//! - [`route`]: topic route and cluster info responses
//! - [`subscription`], [`topics`], [`offsets`]: consumer, topic, and
//!   offset registries
//! - [`server`]: TCP accept/framing/dispatch
//!
//! ```text
//! legacy client ──TCP──► server ──► dispatch ──► producer ─┐
//!                                          ├──► pull ──────┤──► session ──► LogStore
//!                                          └──► route      │
//!                                 hold ◄── PULL_NOT_FOUND ─┘
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod context;
pub mod error;
pub mod hold;
pub mod offsets;
pub mod producer;
pub mod pull;
pub mod remoting;
pub mod route;
pub mod server;
pub mod session;
pub mod stats;
pub mod subscription;
pub mod topics;

pub use config::BrokerConfig;
pub use error::{BrokerError, BrokerResult};
pub use server::BrokerServer;
