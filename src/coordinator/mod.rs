//! Manager-side location coordination
//!
//! The manager is responsible for:
//! - Tablet location records (metadata store with compare-and-set)
//! - The location state machine and its mode policy
//! - Assignment of tablets to live tablet servers
//! - Watch registration, the watched-node cache and the watcher budget
//! - The HTTP admin/query API

pub mod assignment;
pub mod budget;
pub mod cache;
pub mod http;
pub mod location;
pub mod metadata;
pub mod mode;
pub mod placement;
pub mod server;
pub mod state_machine;
pub mod watch;

pub use location::{LocationSnapshot, LocationState, TabletLocation};
pub use mode::LocationMode;
pub use server::Manager;
pub use state_machine::{LocationEvent, LocationStateMachine};
