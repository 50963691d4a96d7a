//! Tablet server
//!
//! Hosts tablets handed to it by the assignment authority:
//! - holds a liveness lock (ephemeral node) in the coordination service
//! - confirms ownership when a tablet is loaded
//! - buffers writes in memory and persists them on flush
//! - reports every completed persist to the location state machine

pub mod server;

pub use server::TabletServer;
