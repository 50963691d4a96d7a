//! Coordination service client
//!
//! The coordination service is an external pub/sub store (a hierarchical
//! namespace of small nodes, watches and session-scoped ephemeral nodes).
//! Only its watch and session semantics matter here:
//!
//! - A watch on a path delivers [`CoordinationEvent::NodeChanged`],
//!   [`CoordinationEvent::NodeDeleted`] and
//!   [`CoordinationEvent::ChildrenChanged`] for that path until removed.
//!   Delivery is at-most-once and may be stale: an event is a hint to
//!   re-read.
//! - A session not heard from within the session timeout expires.
//! - When a session expires every watch and ephemeral node it held is gone.
//!   The client reports [`CoordinationEvent::SessionExpired`] followed by
//!   [`CoordinationEvent::SessionEstablished`] once it has a new session.
//!
//! [`local::LocalCoordinationService`] is the in-process implementation and
//! [`monitor`] serves its four-letter monitoring commands.

pub mod local;
pub mod monitor;

use crate::common::{Result, ServerId, TableId};
use async_trait::async_trait;
use tokio::sync::broadcast;

pub use local::{spawn_heartbeat, LocalClient, LocalCoordinationService};
pub use monitor::{fetch_watch_count, parse_watch_count, serve_monitor};

pub type SessionId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinationEvent {
    NodeChanged { path: String },
    NodeDeleted { path: String },
    /// A child of `path` was created or deleted
    ChildrenChanged { path: String },
    SessionExpired { session: SessionId },
    SessionEstablished { session: SessionId },
}

#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// Current session id
    fn session(&self) -> SessionId;

    /// Event stream for this client (watch notifications and session changes)
    fn subscribe(&self) -> broadcast::Receiver<CoordinationEvent>;

    async fn get_data(&self, path: &str) -> Result<Option<Vec<u8>>>;

    /// Create or overwrite a persistent node, notifying its watchers
    async fn set_data(&self, path: &str, data: Vec<u8>) -> Result<()>;

    /// Create an ephemeral node owned by this session
    async fn create_ephemeral(&self, path: &str, data: Vec<u8>) -> Result<()>;

    /// Delete a node, notifying its watchers
    async fn delete(&self, path: &str) -> Result<()>;

    /// Names of the direct children of `path`
    async fn get_children(&self, path: &str) -> Result<Vec<String>>;

    /// Add a persistent watch on `path` for this session
    async fn add_watch(&self, path: &str) -> Result<()>;

    async fn remove_watch(&self, path: &str) -> Result<()>;

    /// Keep the session alive
    async fn ping(&self) -> Result<()>;

    /// End the session, dropping its watches and ephemeral nodes
    async fn close(&self) -> Result<()>;
}

/// Paths of the coordination namespace
pub mod paths {
    use super::*;

    /// Instance-level nodes every process watches.
    pub const INSTANCE_PATHS: &[&str] = &[
        "/root",
        "/config",
        "/managers/lock",
        "/tservers",
        "/tables",
        "/namespaces",
        "/gc/lock",
        "/monitor/lock",
        "/recovery",
        "/dead/tservers",
        "/problems",
        "/fate",
        "/table_locks",
        "/users",
    ];

    pub const TSERVERS: &str = "/tservers";
    pub const TABLES: &str = "/tables";

    pub fn property(key: &str) -> String {
        format!("/config/{}", key)
    }

    pub fn server_lock(server: &ServerId) -> String {
        format!("{}/{}", TSERVERS, server)
    }

    pub fn table_root(table: &TableId) -> String {
        format!("{}/{}", TABLES, table)
    }

    pub fn table_state(table: &TableId) -> String {
        format!("{}/{}/state", TABLES, table)
    }

    pub fn table_config(table: &TableId) -> String {
        format!("{}/{}/conf", TABLES, table)
    }

    pub fn table_flush(table: &TableId) -> String {
        format!("{}/{}/flush-id", TABLES, table)
    }

    pub fn table_locations(table: &TableId) -> String {
        format!("{}/{}/locations", TABLES, table)
    }
}
