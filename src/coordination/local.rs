//! In-process coordination service
//!
//! Keeps nodes in a sorted map and per-session watch sets. Watches are
//! persistent (they stay until removed or the session ends); every change
//! to a watched path is pushed on the owning client's event channel.

use super::{CoordinationClient, CoordinationEvent, SessionId};
use crate::common::{timestamp_now_millis, Error, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Client-side state shared with the service so it can follow session
/// changes.
struct ClientShared {
    session: AtomicU64,
    events: broadcast::Sender<CoordinationEvent>,
}

struct SessionEntry {
    client: Arc<ClientShared>,
    watches: BTreeSet<String>,
    ephemerals: BTreeSet<String>,
    last_heard: Instant,
}

struct Inner {
    nodes: RwLock<BTreeMap<String, Vec<u8>>>,
    sessions: Mutex<HashMap<SessionId, SessionEntry>>,
    next_session: AtomicU64,
}

impl Default for Inner {
    fn default() -> Self {
        // Session ids embed the start time so they differ across restarts
        let seed = (timestamp_now_millis() << 16) | u64::from(rand::random::<u16>());
        Self {
            nodes: RwLock::new(BTreeMap::new()),
            sessions: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(seed),
        }
    }
}

/// Watch counters as reported by the `wchs` monitoring command
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchStats {
    /// Sessions holding at least one watch
    pub connections: usize,
    /// Distinct watched paths
    pub paths: usize,
    /// Total (session, path) watches
    pub total: usize,
}

fn poisoned<T>(_: T) -> Error {
    Error::Coordination("coordination state lock poisoned".into())
}

impl Inner {
    fn open_session(&self, client: Arc<ClientShared>) -> Result<SessionId> {
        let session = self.next_session.fetch_add(1, Ordering::SeqCst) + 1;
        client.session.store(session, Ordering::SeqCst);
        self.sessions.lock().map_err(poisoned)?.insert(
            session,
            SessionEntry {
                client,
                watches: BTreeSet::new(),
                ephemerals: BTreeSet::new(),
                last_heard: Instant::now(),
            },
        );
        Ok(session)
    }

    fn notify(&self, events: &[CoordinationEvent]) -> Result<()> {
        let sessions = self.sessions.lock().map_err(poisoned)?;
        for entry in sessions.values() {
            for event in events {
                let path = match event {
                    CoordinationEvent::NodeChanged { path }
                    | CoordinationEvent::NodeDeleted { path }
                    | CoordinationEvent::ChildrenChanged { path } => path,
                    _ => continue,
                };
                if entry.watches.contains(path) {
                    // No receivers just means nobody is listening right now
                    let _ = entry.client.events.send(event.clone());
                }
            }
        }
        Ok(())
    }

    fn put_node(&self, path: &str, data: Vec<u8>) -> Result<()> {
        let created = self
            .nodes
            .write()
            .map_err(poisoned)?
            .insert(path.to_string(), data)
            .is_none();

        let mut events = vec![CoordinationEvent::NodeChanged {
            path: path.to_string(),
        }];
        if created {
            if let Some(parent) = parent_of(path) {
                events.push(CoordinationEvent::ChildrenChanged { path: parent });
            }
        }
        self.notify(&events)
    }

    fn remove_nodes(&self, paths: &BTreeSet<String>) -> Result<()> {
        let removed: Vec<String> = {
            let mut nodes = self.nodes.write().map_err(poisoned)?;
            paths
                .iter()
                .filter(|p| nodes.remove(*p).is_some())
                .cloned()
                .collect()
        };
        let mut events: Vec<CoordinationEvent> = removed
            .iter()
            .map(|path| CoordinationEvent::NodeDeleted { path: path.clone() })
            .collect();
        let parents: BTreeSet<String> = removed.iter().filter_map(|p| parent_of(p)).collect();
        events.extend(
            parents
                .into_iter()
                .map(|path| CoordinationEvent::ChildrenChanged { path }),
        );
        self.notify(&events)
    }

    /// Drop a session with its watches and ephemeral nodes.
    fn end_session(&self, session: SessionId) -> Result<Option<SessionEntry>> {
        let entry = self.sessions.lock().map_err(poisoned)?.remove(&session);
        if let Some(entry) = &entry {
            self.remove_nodes(&entry.ephemerals)?;
        }
        Ok(entry)
    }

    fn with_session<T>(
        &self,
        session: SessionId,
        f: impl FnOnce(&mut SessionEntry) -> T,
    ) -> Result<T> {
        let mut sessions = self.sessions.lock().map_err(poisoned)?;
        match sessions.get_mut(&session) {
            Some(entry) => Ok(f(entry)),
            None => Err(Error::CoordinationSessionLost(format!(
                "session {} is not active",
                session
            ))),
        }
    }
}

fn parent_of(path: &str) -> Option<String> {
    match path.rfind('/') {
        Some(0) | None => None,
        Some(idx) => Some(path[..idx].to_string()),
    }
}

/// In-process coordination service
#[derive(Clone, Default)]
pub struct LocalCoordinationService {
    inner: Arc<Inner>,
}

impl LocalCoordinationService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new client session
    pub fn connect(&self) -> Result<Arc<LocalClient>> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let shared = Arc::new(ClientShared {
            session: AtomicU64::new(0),
            events,
        });
        let session = self.inner.open_session(shared.clone())?;
        tracing::debug!(session, "Coordination session opened");
        Ok(Arc::new(LocalClient {
            inner: self.inner.clone(),
            shared,
        }))
    }

    /// Expire a session: its watches and ephemeral nodes are dropped, then
    /// the owning client is handed a fresh session.
    pub fn expire_session(&self, session: SessionId) -> Result<SessionId> {
        let entry = self.inner.end_session(session)?.ok_or_else(|| {
            Error::CoordinationSessionLost(format!("session {} is not active", session))
        })?;
        let client = entry.client;
        let _ = client
            .events
            .send(CoordinationEvent::SessionExpired { session });

        let renewed = self.inner.open_session(client.clone())?;
        tracing::info!(expired = session, session = renewed, "Coordination session re-established");
        let _ = client
            .events
            .send(CoordinationEvent::SessionEstablished { session: renewed });
        Ok(renewed)
    }

    /// Expire every session not heard from within `timeout`. Returns the
    /// expired sessions.
    pub fn expire_idle(&self, timeout: Duration) -> Result<Vec<SessionId>> {
        let idle: Vec<SessionId> = {
            let sessions = self.inner.sessions.lock().map_err(poisoned)?;
            let mut idle: Vec<SessionId> = sessions
                .iter()
                .filter(|(_, entry)| entry.last_heard.elapsed() > timeout)
                .map(|(session, _)| *session)
                .collect();
            idle.sort_unstable();
            idle
        };

        let mut expired = Vec::with_capacity(idle.len());
        for session in idle {
            // Closed or expired concurrently
            if self.expire_session(session).is_ok() {
                tracing::warn!(session, timeout_ms = timeout.as_millis() as u64, "Session timed out");
                expired.push(session);
            }
        }
        Ok(expired)
    }

    /// Expire idle sessions in the background, checking four times per
    /// timeout.
    pub fn spawn_reaper(&self, timeout: Duration) -> JoinHandle<()> {
        let service = self.clone();
        let period = (timeout / 4).max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if let Err(e) = service.expire_idle(timeout) {
                    tracing::warn!(error = %e, "Session reaper failed");
                }
            }
        })
    }

    pub fn watch_stats(&self) -> Result<WatchStats> {
        let sessions = self.inner.sessions.lock().map_err(poisoned)?;
        let mut paths = BTreeSet::new();
        let mut stats = WatchStats::default();
        for entry in sessions.values() {
            if !entry.watches.is_empty() {
                stats.connections += 1;
            }
            stats.total += entry.watches.len();
            paths.extend(entry.watches.iter().cloned());
        }
        stats.paths = paths.len();
        Ok(stats)
    }

    /// Watches held by one session
    pub fn session_watches(&self, session: SessionId) -> Result<BTreeSet<String>> {
        self.inner.with_session(session, |entry| entry.watches.clone())
    }
}

/// Client handle bound to one (renewable) session
pub struct LocalClient {
    inner: Arc<Inner>,
    shared: Arc<ClientShared>,
}

#[async_trait]
impl CoordinationClient for LocalClient {
    fn session(&self) -> SessionId {
        self.shared.session.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<CoordinationEvent> {
        self.shared.events.subscribe()
    }

    async fn get_data(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let nodes = self.inner.nodes.read().map_err(poisoned)?;
        Ok(nodes.get(path).cloned())
    }

    async fn set_data(&self, path: &str, data: Vec<u8>) -> Result<()> {
        self.inner.put_node(path, data)
    }

    async fn create_ephemeral(&self, path: &str, data: Vec<u8>) -> Result<()> {
        let session = self.session();
        self.inner.with_session(session, |entry| {
            entry.ephemerals.insert(path.to_string());
        })?;
        self.set_data(path, data).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let prefix = format!("{}/", path);
        let doomed: BTreeSet<String> = {
            let nodes = self.inner.nodes.read().map_err(poisoned)?;
            nodes
                .keys()
                .filter(|k| k.as_str() == path || k.starts_with(&prefix))
                .cloned()
                .collect()
        };
        self.inner.remove_nodes(&doomed)
    }

    async fn get_children(&self, path: &str) -> Result<Vec<String>> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let nodes = self.inner.nodes.read().map_err(poisoned)?;
        let children: BTreeSet<String> = nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, _)| k[prefix.len()..].split('/').next().map(str::to_string))
            .filter(|name| !name.is_empty())
            .collect();
        Ok(children.into_iter().collect())
    }

    async fn add_watch(&self, path: &str) -> Result<()> {
        let session = self.session();
        self.inner.with_session(session, |entry| {
            entry.watches.insert(path.to_string());
        })
    }

    async fn remove_watch(&self, path: &str) -> Result<()> {
        let session = self.session();
        self.inner.with_session(session, |entry| {
            entry.watches.remove(path);
        })
    }

    async fn ping(&self) -> Result<()> {
        let session = self.session();
        self.inner.with_session(session, |entry| {
            entry.last_heard = Instant::now();
        })
    }

    async fn close(&self) -> Result<()> {
        self.inner.end_session(self.session())?;
        Ok(())
    }
}

/// Ping `client` every `interval` until it is dropped
pub fn spawn_heartbeat(client: &Arc<LocalClient>, interval: Duration) -> JoinHandle<()> {
    let client: Weak<LocalClient> = Arc::downgrade(client);
    let period = interval.max(Duration::from_millis(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let Some(client) = client.upgrade() else {
                return;
            };
            // A lost session is renewed by the service; the next ping lands
            if let Err(e) = client.ping().await {
                tracing::debug!(error = %e, "Heartbeat missed");
            }
        }
    })
}
