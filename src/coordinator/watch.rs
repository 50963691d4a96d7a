//! Watch registrar
//!
//! Holds exactly one coordination-service watch per distinct target, shared
//! by every internal consumer through reference counting. Consumers get a
//! [`WatchHandle`] from [`WatchRegistrar::register`] and give it back with
//! [`WatchRegistrar::release`]; the underlying watch goes away with the
//! last handle.
//!
//! Notifications are hints: a consumer receiving
//! [`WatchNotification::Changed`] re-reads authoritative state rather than
//! trusting any payload. After the coordination session is lost and
//! re-established every held target is re-registered.

use crate::common::metrics::METRICS;
use crate::common::{retry_with_backoff, Error, Result, ServerId, TableId};
use crate::coordination::{paths, CoordinationClient, CoordinationEvent};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const NOTIFICATION_CAPACITY: usize = 1024;
const RESYNC_INITIAL_BACKOFF: Duration = Duration::from_millis(10);

/// Something a process wants to hear about. Targets are per table or per
/// server, never per tablet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WatchTarget {
    Instance(String),
    SystemProperty(String),
    ServerLock(ServerId),
    TableState(TableId),
    TableConfig(TableId),
    TableFlush(TableId),
    TableLocations(TableId),
}

impl WatchTarget {
    pub fn path(&self) -> String {
        match self {
            WatchTarget::Instance(path) => path.clone(),
            WatchTarget::SystemProperty(key) => paths::property(key),
            WatchTarget::ServerLock(server) => paths::server_lock(server),
            WatchTarget::TableState(table) => paths::table_state(table),
            WatchTarget::TableConfig(table) => paths::table_config(table),
            WatchTarget::TableFlush(table) => paths::table_flush(table),
            WatchTarget::TableLocations(table) => paths::table_locations(table),
        }
    }

    /// Every per-table target of `table`
    pub fn for_table(table: &TableId) -> [WatchTarget; 4] {
        [
            WatchTarget::TableState(table.clone()),
            WatchTarget::TableConfig(table.clone()),
            WatchTarget::TableFlush(table.clone()),
            WatchTarget::TableLocations(table.clone()),
        ]
    }

    pub fn table(&self) -> Option<&TableId> {
        match self {
            WatchTarget::TableState(t)
            | WatchTarget::TableConfig(t)
            | WatchTarget::TableFlush(t)
            | WatchTarget::TableLocations(t) => Some(t),
            _ => None,
        }
    }
}

impl fmt::Display for WatchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

/// Proof of interest in a target. Not `Clone`: each handle is released once.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct WatchHandle {
    id: u64,
    target: WatchTarget,
}

impl WatchHandle {
    pub fn target(&self) -> &WatchTarget {
        &self.target
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchNotification {
    /// The target's node changed; re-read it.
    Changed(WatchTarget),
    /// The target's node was deleted (e.g. its table was dropped).
    Invalidated(WatchTarget),
    /// The session was lost; notifications may have been missed.
    SessionLost,
    /// All held targets were re-registered on a new session.
    Resynced { targets: usize },
    /// The consumer fell behind and missed notifications.
    Lagged { missed: u64 },
}

struct Registration {
    path: String,
    handles: BTreeSet<u64>,
}

/// Reference count of one target, as listed by `GET /admin/watches`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationInfo {
    pub path: String,
    pub references: usize,
}

pub struct WatchRegistrar {
    name: String,
    client: Arc<dyn CoordinationClient>,
    registrations: Mutex<HashMap<WatchTarget, Registration>>,
    // Read by the dispatcher without waiting on the registration table
    by_path: RwLock<HashMap<String, WatchTarget>>,
    notifications: broadcast::Sender<WatchNotification>,
    next_handle: AtomicU64,
    degraded: AtomicBool,
    resync_attempts: usize,
    dispatcher: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl WatchRegistrar {
    /// Create a registrar over `client` and start dispatching its events.
    /// Must be called from within a tokio runtime.
    pub fn new(
        name: impl Into<String>,
        client: Arc<dyn CoordinationClient>,
        resync_attempts: usize,
    ) -> Arc<Self> {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let registrar = Arc::new(Self {
            name: name.into(),
            client: client.clone(),
            registrations: Mutex::new(HashMap::new()),
            by_path: RwLock::new(HashMap::new()),
            notifications,
            next_handle: AtomicU64::new(1),
            degraded: AtomicBool::new(false),
            resync_attempts: resync_attempts.max(1),
            dispatcher: std::sync::Mutex::new(None),
        });

        let events = client.subscribe();
        let task = tokio::spawn(dispatch(Arc::downgrade(&registrar), events));
        *registrar
            .dispatcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(task);
        registrar
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WatchNotification> {
        self.notifications.subscribe()
    }

    /// Register interest in `target`. The first registration creates the
    /// coordination-service watch; later ones only add a reference.
    pub async fn register(&self, target: WatchTarget) -> Result<WatchHandle> {
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let mut registrations = self.registrations.lock().await;

        if let Some(registration) = registrations.get_mut(&target) {
            registration.handles.insert(id);
            return Ok(WatchHandle { id, target });
        }

        let path = target.path();
        self.client.add_watch(&path).await?;
        debug!(registrar = %self.name, target = %path, "Watch added");

        self.by_path
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(path.clone(), target.clone());
        registrations.insert(
            target.clone(),
            Registration {
                path,
                handles: BTreeSet::from([id]),
            },
        );
        METRICS.active_watches.inc();
        Ok(WatchHandle { id, target })
    }

    /// Drop one reference. The watch is removed with the last one.
    pub async fn release(&self, handle: WatchHandle) -> Result<()> {
        let mut registrations = self.registrations.lock().await;
        let registration = registrations
            .get_mut(&handle.target)
            .filter(|r| r.handles.contains(&handle.id))
            .ok_or_else(|| {
                Error::NotFound(format!("watch handle {} on {}", handle.id, handle.target))
            })?;

        registration.handles.remove(&handle.id);
        if !registration.handles.is_empty() {
            return Ok(());
        }

        let path = registration.path.clone();
        registrations.remove(&handle.target);
        self.by_path
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&path);
        METRICS.active_watches.dec();

        // A lost session already dropped the watch on the service side
        if let Err(e) = self.client.remove_watch(&path).await {
            warn!(registrar = %self.name, target = %path, error = %e, "Failed to remove watch");
        } else {
            debug!(registrar = %self.name, target = %path, "Watch removed");
        }
        Ok(())
    }

    /// Number of underlying watches held
    pub async fn active_count(&self) -> usize {
        self.registrations.lock().await.len()
    }

    /// Reference count of `target` (0 when not held)
    pub async fn references(&self, target: &WatchTarget) -> usize {
        self.registrations
            .lock()
            .await
            .get(target)
            .map(|r| r.handles.len())
            .unwrap_or(0)
    }

    pub async fn registrations(&self) -> Vec<RegistrationInfo> {
        let registrations = self.registrations.lock().await;
        let mut infos: Vec<RegistrationInfo> = registrations
            .values()
            .map(|r| RegistrationInfo {
                path: r.path.clone(),
                references: r.handles.len(),
            })
            .collect();
        infos.sort_by(|a, b| a.path.cmp(&b.path));
        infos
    }

    /// Whether the session was lost and not yet successfully resynced
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Re-issue every held registration on the client's current session.
    pub async fn resync(&self) -> Result<usize> {
        let registrations = self.registrations.lock().await;
        let mut failed = Vec::new();

        for registration in registrations.values() {
            let client = self.client.clone();
            let path = registration.path.clone();
            let outcome = retry_with_backoff(
                || {
                    let client = client.clone();
                    let path = path.clone();
                    async move { client.add_watch(&path).await }
                },
                self.resync_attempts,
                RESYNC_INITIAL_BACKOFF,
            )
            .await;
            if let Err(e) = outcome {
                error!(registrar = %self.name, target = %path, error = %e, "Watch re-registration failed");
                failed.push(path);
            }
        }

        if !failed.is_empty() {
            return Err(Error::CoordinationSessionLost(format!(
                "{} of {} watches could not be re-registered: {}",
                failed.len(),
                registrations.len(),
                failed.join(", ")
            )));
        }

        METRICS.session_resyncs.inc();
        self.degraded.store(false, Ordering::SeqCst);
        Ok(registrations.len())
    }

    fn target_for(&self, path: &str) -> Option<WatchTarget> {
        self.by_path
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(path)
            .cloned()
    }

    fn publish(&self, notification: WatchNotification) {
        // Nobody listening is fine: notifications are only hints
        let _ = self.notifications.send(notification);
    }
}

impl Drop for WatchRegistrar {
    fn drop(&mut self) {
        if let Some(task) = self
            .dispatcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            task.abort();
        }
    }
}

async fn dispatch(
    registrar: Weak<WatchRegistrar>,
    mut events: broadcast::Receiver<CoordinationEvent>,
) {
    loop {
        let event = events.recv().await;
        let Some(registrar) = registrar.upgrade() else {
            return;
        };

        match event {
            Ok(CoordinationEvent::NodeChanged { path })
            | Ok(CoordinationEvent::ChildrenChanged { path }) => {
                if let Some(target) = registrar.target_for(&path) {
                    registrar.publish(WatchNotification::Changed(target));
                }
            }
            Ok(CoordinationEvent::NodeDeleted { path }) => {
                let Some(target) = registrar.target_for(&path) else {
                    continue;
                };
                // A delete queued before the node was recreated is stale
                match registrar.client.get_data(&path).await {
                    Ok(Some(_)) => {
                        debug!(registrar = %registrar.name, target = %path, "Node recreated since delete");
                        registrar.publish(WatchNotification::Changed(target));
                    }
                    Ok(None) | Err(_) => {
                        registrar.publish(WatchNotification::Invalidated(target));
                    }
                }
            }
            Ok(CoordinationEvent::SessionExpired { session }) => {
                warn!(registrar = %registrar.name, session, "Coordination session lost");
                registrar.degraded.store(true, Ordering::SeqCst);
                registrar.publish(WatchNotification::SessionLost);
            }
            Ok(CoordinationEvent::SessionEstablished { session }) => {
                match registrar.resync().await {
                    Ok(targets) => {
                        info!(registrar = %registrar.name, session, targets, "Watches re-registered");
                        registrar.publish(WatchNotification::Resynced { targets });
                    }
                    Err(e) => {
                        error!(registrar = %registrar.name, session, error = %e, "Session resync incomplete");
                    }
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(registrar = %registrar.name, missed, "Coordination events dropped");
                registrar.publish(WatchNotification::Lagged { missed });
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::LocalCoordinationService;

    fn table(id: &str) -> TableId {
        TableId::new(id).unwrap()
    }

    #[tokio::test]
    async fn test_register_is_reference_counted() {
        let service = LocalCoordinationService::new();
        let client = service.connect().unwrap();
        let registrar = WatchRegistrar::new("test", client, 3);
        let target = WatchTarget::TableState(table("t1"));

        let a = registrar.register(target.clone()).await.unwrap();
        let b = registrar.register(target.clone()).await.unwrap();
        assert_eq!(registrar.active_count().await, 1);
        assert_eq!(registrar.references(&target).await, 2);
        assert_eq!(service.watch_stats().unwrap().total, 1);

        registrar.release(a).await.unwrap();
        assert_eq!(service.watch_stats().unwrap().total, 1);
        registrar.release(b).await.unwrap();
        assert_eq!(registrar.active_count().await, 0);
        assert_eq!(service.watch_stats().unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_release_foreign_handle() {
        let service = LocalCoordinationService::new();
        let first = WatchRegistrar::new("a", service.connect().unwrap(), 3);
        let second = WatchRegistrar::new("b", service.connect().unwrap(), 3);

        let handle = first
            .register(WatchTarget::Instance("/tables".into()))
            .await
            .unwrap();
        let err = second.release(handle).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert_eq!(first.active_count().await, 1);
    }

    #[tokio::test]
    async fn test_changes_and_deletes_are_forwarded() {
        let service = LocalCoordinationService::new();
        let registrar = WatchRegistrar::new("test", service.connect().unwrap(), 3);
        let writer = service.connect().unwrap();
        let mut notifications = registrar.subscribe();

        let target = WatchTarget::TableLocations(table("t1"));
        let _handle = registrar.register(target.clone()).await.unwrap();

        writer.set_data(&target.path(), b"1".to_vec()).await.unwrap();
        assert_eq!(
            notifications.recv().await.unwrap(),
            WatchNotification::Changed(target.clone())
        );

        writer.delete(&paths::table_root(&table("t1"))).await.unwrap();
        assert_eq!(
            notifications.recv().await.unwrap(),
            WatchNotification::Invalidated(target)
        );
    }

    #[tokio::test]
    async fn test_delete_of_recreated_node_is_a_change() {
        let service = LocalCoordinationService::new();
        let writer = service.connect().unwrap();
        let registrar = WatchRegistrar::new("test", service.connect().unwrap(), 3);
        let mut notifications = registrar.subscribe();
        let target = WatchTarget::TableState(table("t1"));
        writer.set_data(&target.path(), b"online".to_vec()).await.unwrap();

        // Drop and recreate the table before the dispatcher runs, so the
        // delete is still queued when the new registration exists
        let old = registrar.register(target.clone()).await.unwrap();
        writer.delete(&paths::table_root(&table("t1"))).await.unwrap();
        registrar.release(old).await.unwrap();
        writer.set_data(&target.path(), b"online".to_vec()).await.unwrap();
        let _new = registrar.register(target.clone()).await.unwrap();
        writer.set_data(&target.path(), b"offline".to_vec()).await.unwrap();

        for _ in 0..2 {
            assert_eq!(
                notifications.recv().await.unwrap(),
                WatchNotification::Changed(target.clone())
            );
        }
    }

    #[test]
    fn test_target_paths() {
        let t = table("t1");
        let paths: Vec<String> = WatchTarget::for_table(&t).iter().map(|t| t.path()).collect();
        assert_eq!(
            paths,
            vec![
                "/tables/t1/state",
                "/tables/t1/conf",
                "/tables/t1/flush-id",
                "/tables/t1/locations"
            ]
        );
        assert_eq!(
            WatchTarget::SystemProperty("log.level".into()).path(),
            "/config/log.level"
        );
        assert_eq!(WatchTarget::TableState(t.clone()).table(), Some(&t));
        assert_eq!(WatchTarget::Instance("/root".into()).table(), None);
    }
}
