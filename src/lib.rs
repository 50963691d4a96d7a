//! # tabletloc
//!
//! Tablet location coordination for a distributed tabular store:
//! - Per-tablet `{current, future, last}` location tracked as a tagged state
//! - Configurable mode deciding when `last` follows the host
//! - Compare-and-set writes against a RocksDB (or in-memory) metadata store
//! - Reference-counted watches on a coordination service, bounded per table
//! - Admin flush / online / offline with poll-and-backoff waits
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ Manager                                      │
//! │  HTTP API ─ TableOperations ─ Assignment     │
//! │              │                  │            │
//! │     LocationStateMachine (CAS) ─┘            │
//! │              │                               │
//! │        MetadataStore (RocksDB)               │
//! └──────┬───────────────────────────┬───────────┘
//!        │ load / flush / unload     │ watches
//! ┌──────▼──────────┐        ┌───────▼───────────────┐
//! │ Tablet servers  │        │ Coordination service  │
//! │  (liveness lock)├───────►│  (sessions, watches)  │
//! └─────────────────┘        └───────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start a single-node instance
//! ```bash
//! tabletloc-manager serve --bind 127.0.0.1:9995 --mode compaction
//! ```
//!
//! ### Use the CLI
//! ```bash
//! tabletloc create t1 --split m
//! tabletloc write t1 r1 hello
//! tabletloc flush t1 --wait
//! tabletloc location t1 --end m
//! tabletloc offline t1 --wait
//! tabletloc wchs --addr 127.0.0.1:2181
//! ```

pub mod client;
pub mod common;
pub mod coordination;
pub mod coordinator;
pub mod instance;
pub mod ops;
pub mod tserver;

pub use common::{Config, Error, Result};
pub use coordinator::Manager;
pub use instance::Instance;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
