//! In-process tablet server

use crate::common::metrics::METRICS;
use crate::common::{Error, KeyExtent, Result, ServerId, MEMTABLE_MAX_ENTRIES_KEY};
use crate::coordination::{paths, CoordinationClient, CoordinationEvent, SessionId};
use crate::coordinator::assignment::TabletHost;
use crate::coordinator::cache::NodeCache;
use crate::coordinator::state_machine::{LocationEvent, LocationStateMachine};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct HostedTablet {
    /// Writes not yet persisted
    buffered: BTreeMap<String, Vec<u8>>,
    /// Persisted rows
    persisted: BTreeMap<String, Vec<u8>>,
}

impl HostedTablet {
    fn persist(&mut self) -> usize {
        let rows = self.buffered.len();
        self.persisted.append(&mut self.buffered);
        rows
    }
}

pub struct TabletServer {
    id: ServerId,
    client: Arc<dyn CoordinationClient>,
    machine: Arc<LocationStateMachine>,
    tablets: Mutex<HashMap<KeyExtent, HostedTablet>>,
    memtable_max_entries: usize,
    settings: Option<Arc<NodeCache>>,
}

impl TabletServer {
    pub fn new(
        id: ServerId,
        client: Arc<dyn CoordinationClient>,
        machine: Arc<LocationStateMachine>,
        memtable_max_entries: usize,
    ) -> Self {
        Self {
            id,
            client,
            machine,
            tablets: Mutex::new(HashMap::new()),
            memtable_max_entries: memtable_max_entries.max(1),
            settings: None,
        }
    }

    /// Read runtime settings from the tablet server role's node cache
    pub fn with_settings(mut self, settings: Arc<NodeCache>) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Current memtable limit: the published property, else the configured one
    fn memtable_limit(&self) -> usize {
        self.settings
            .as_ref()
            .and_then(|cache| cache.property(MEMTABLE_MAX_ENTRIES_KEY))
            .and_then(|value| value.trim().parse::<usize>().ok())
            .unwrap_or(self.memtable_max_entries)
            .max(1)
    }

    /// Acquire the liveness lock and keep it across session renewals
    pub async fn start(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let events = self.client.subscribe();
        self.acquire_lock().await?;
        info!(server = %self.id, "Tablet server started");

        let server = self.clone();
        Ok(tokio::spawn(async move { server.follow_session(events).await }))
    }

    async fn acquire_lock(&self) -> Result<()> {
        self.client
            .create_ephemeral(&paths::server_lock(&self.id), self.id.as_str().as_bytes().to_vec())
            .await
    }

    async fn follow_session(&self, mut events: broadcast::Receiver<CoordinationEvent>) {
        loop {
            match events.recv().await {
                Ok(CoordinationEvent::SessionExpired { session }) => {
                    // Without the lock nothing here may be served any more
                    let dropped = self.drop_all().await;
                    warn!(server = %self.id, session, dropped = dropped.len(), "Lost liveness lock, dropped hosted tablets");
                    self.release_dropped(&dropped).await;
                }
                Ok(CoordinationEvent::SessionEstablished { session }) => {
                    match self.acquire_lock().await {
                        Ok(()) => info!(server = %self.id, session, "Liveness lock re-acquired"),
                        Err(e) => warn!(server = %self.id, error = %e, "Failed to re-acquire liveness lock"),
                    }
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    async fn drop_all(&self) -> Vec<KeyExtent> {
        let mut tablets = self.tablets.lock().await;
        let dropped: Vec<KeyExtent> = tablets.drain().map(|(extent, _)| extent).collect();
        for _ in &dropped {
            METRICS.hosted_tablets.dec();
        }
        dropped
    }

    /// Hand dropped tablets back to the manager. The lock may be back before
    /// the manager notices it was gone, so liveness alone cannot tell.
    async fn release_dropped(&self, dropped: &[KeyExtent]) {
        for extent in dropped {
            let event = LocationEvent::ServerLost {
                server: self.id.clone(),
            };
            if let Err(e) = self.machine.apply(extent, event).await {
                warn!(server = %self.id, extent = %extent, error = %e, "Failed to release dropped tablet");
            }
        }
    }

    pub fn id(&self) -> &ServerId {
        &self.id
    }

    /// Session holding the liveness lock
    pub fn session(&self) -> SessionId {
        self.client.session()
    }

    /// Drop hosted tablets and end the lock session
    pub async fn stop(&self) {
        let dropped = self.drop_all().await;
        if let Err(e) = self.client.close().await {
            warn!(server = %self.id, error = %e, "Failed to close lock session");
        }
        info!(server = %self.id, dropped = dropped.len(), "Tablet server stopped");
    }

    pub async fn hosted(&self) -> Vec<KeyExtent> {
        let mut extents: Vec<KeyExtent> = self.tablets.lock().await.keys().cloned().collect();
        extents.sort_by_key(|e| e.metadata_key());
        extents
    }

    pub async fn read(&self, extent: &KeyExtent, row: &str) -> Result<Option<Vec<u8>>> {
        let tablets = self.tablets.lock().await;
        let tablet = tablets
            .get(extent)
            .ok_or_else(|| Error::NotHosted(extent.to_string()))?;
        Ok(tablet
            .buffered
            .get(row)
            .or_else(|| tablet.persisted.get(row))
            .cloned())
    }

    /// Persist a tablet's buffer and report the persist event
    async fn persist(&self, extent: &KeyExtent, flush_id: Option<u64>) -> Result<()> {
        let rows = {
            let mut tablets = self.tablets.lock().await;
            let tablet = tablets
                .get_mut(extent)
                .ok_or_else(|| Error::NotHosted(extent.to_string()))?;
            tablet.persist()
        };
        debug!(server = %self.id, extent = %extent, rows, ?flush_id, "Tablet persisted");

        self.machine
            .apply(
                extent,
                LocationEvent::PersistCompleted {
                    server: self.id.clone(),
                    flush_id,
                },
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl TabletHost for TabletServer {
    fn server_id(&self) -> &ServerId {
        &self.id
    }

    async fn load(&self, extent: &KeyExtent) -> Result<()> {
        if self.tablets.lock().await.contains_key(extent) {
            return Ok(());
        }

        self.machine
            .apply(
                extent,
                LocationEvent::AssignmentConfirmed {
                    server: self.id.clone(),
                },
            )
            .await?;

        let mut tablets = self.tablets.lock().await;
        if tablets.insert(extent.clone(), HostedTablet::default()).is_none() {
            METRICS.hosted_tablets.inc();
        }
        info!(server = %self.id, extent = %extent, "Tablet loaded");
        Ok(())
    }

    async fn unload(&self, extent: &KeyExtent) -> Result<()> {
        let dirty = {
            let tablets = self.tablets.lock().await;
            match tablets.get(extent) {
                Some(tablet) => !tablet.buffered.is_empty(),
                None => false,
            }
        };
        if dirty {
            self.persist(extent, None).await?;
        }

        self.machine.apply(extent, LocationEvent::TakeOffline).await?;
        if self.tablets.lock().await.remove(extent).is_some() {
            METRICS.hosted_tablets.dec();
        }
        info!(server = %self.id, extent = %extent, "Tablet unloaded");
        Ok(())
    }

    async fn flush(&self, extent: &KeyExtent, flush_id: u64) -> Result<()> {
        self.persist(extent, Some(flush_id)).await
    }

    async fn write(&self, extent: &KeyExtent, row: String, value: Vec<u8>) -> Result<()> {
        if !extent.contains_row(&row) {
            return Err(Error::NotHosted(format!("row {} is outside {}", row, extent)));
        }
        let limit = self.memtable_limit();
        let full = {
            let mut tablets = self.tablets.lock().await;
            let tablet = tablets
                .get_mut(extent)
                .ok_or_else(|| Error::NotHosted(extent.to_string()))?;
            tablet.buffered.insert(row, value);
            tablet.buffered.len() >= limit
        };
        if full {
            // Minor compaction: persisted on our own, not for a flush request
            self.persist(extent, None).await?;
        }
        Ok(())
    }
}
