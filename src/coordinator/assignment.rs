//! Assignment authority
//!
//! Drives every tablet toward its table's goal:
//!
//! | Goal | State | Action |
//! |---|---|---|
//! | online | Unassigned / Offline | begin-assignment on a placed server, then load |
//! | online | Assigning{t} | server-lost if `t` is gone, else re-issue the load |
//! | online | Hosted{s} | server-lost if `s` is gone |
//! | offline | Hosted{s} | unload on `s`, or take-offline if `s` is gone |
//! | offline | Assigning{t} | take-offline |
//!
//! A pass runs on every tick and whenever the manager's watches fire.

use crate::common::{Error, KeyExtent, Result, ServerId};
use crate::coordination::{paths, CoordinationClient};
use crate::coordinator::location::LocationState;
use crate::coordinator::metadata::{TableGoal, TabletRecord};
use crate::coordinator::placement::PlacementManager;
use crate::coordinator::state_machine::{LocationEvent, LocationStateMachine};
use crate::coordinator::watch::WatchRegistrar;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Passes run back to back while they keep changing state
const MAX_PASSES_PER_TRIGGER: usize = 4;

/// A server able to host tablets
#[async_trait]
pub trait TabletHost: Send + Sync {
    fn server_id(&self) -> &ServerId;

    /// Take ownership of a tablet that is being assigned here
    async fn load(&self, extent: &KeyExtent) -> Result<()>;

    /// Persist buffered data and give the tablet up
    async fn unload(&self, extent: &KeyExtent) -> Result<()>;

    /// Persist buffered data and report `flush_id` as done
    async fn flush(&self, extent: &KeyExtent, flush_id: u64) -> Result<()>;

    async fn write(&self, extent: &KeyExtent, row: String, value: Vec<u8>) -> Result<()>;
}

/// Tablet hosts reachable from this process
#[derive(Default)]
pub struct HostDirectory {
    hosts: RwLock<HashMap<ServerId, Arc<dyn TabletHost>>>,
}

impl HostDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, host: Arc<dyn TabletHost>) {
        self.hosts
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(host.server_id().clone(), host);
    }

    pub fn remove(&self, server: &ServerId) -> Option<Arc<dyn TabletHost>> {
        self.hosts
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(server)
    }

    pub fn get(&self, server: &ServerId) -> Option<Arc<dyn TabletHost>> {
        self.hosts
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(server)
            .cloned()
    }

    pub fn servers(&self) -> Vec<ServerId> {
        self.hosts
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect()
    }
}

/// What one pass did
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassStats {
    pub assigned: usize,
    pub reissued: usize,
    pub unloaded: usize,
    pub lost: usize,
    pub failed: usize,
}

impl PassStats {
    pub fn changed(&self) -> bool {
        self.assigned + self.unloaded + self.lost > 0
    }
}

pub struct AssignmentManager {
    machine: Arc<LocationStateMachine>,
    client: Arc<dyn CoordinationClient>,
    registrar: Arc<WatchRegistrar>,
    hosts: Arc<HostDirectory>,
    interval: Duration,
    pass: Mutex<()>,
}

impl AssignmentManager {
    pub fn new(
        machine: Arc<LocationStateMachine>,
        client: Arc<dyn CoordinationClient>,
        registrar: Arc<WatchRegistrar>,
        hosts: Arc<HostDirectory>,
        interval: Duration,
    ) -> Self {
        Self {
            machine,
            client,
            registrar,
            hosts,
            interval,
            pass: Mutex::new(()),
        }
    }

    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move { manager.run().await })
    }

    async fn run(&self) {
        info!(interval_ms = self.interval.as_millis() as u64, "Assignment loop started");
        let mut notifications = self.registrar.subscribe();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                notification = notifications.recv() => {
                    if let Err(broadcast::error::RecvError::Closed) = notification {
                        return;
                    }
                    // One pass covers every notification queued so far
                    while notifications.try_recv().is_ok() {}
                }
            }
            self.balance().await;
        }
    }

    /// Run passes until nothing changes (bounded)
    pub async fn balance(&self) {
        for _ in 0..MAX_PASSES_PER_TRIGGER {
            match self.run_once().await {
                Ok(stats) if stats.changed() => {
                    debug!(?stats, "Assignment pass changed tablet state");
                }
                Ok(_) => break,
                Err(e) => {
                    warn!(error = %e, "Assignment pass failed");
                    break;
                }
            }
        }
    }

    /// Live servers that can actually be reached
    async fn live_servers(&self) -> Result<Vec<ServerId>> {
        let live = self.client.get_children(paths::TSERVERS).await?;
        Ok(live
            .into_iter()
            .map(ServerId::new)
            .filter(|s| self.hosts.get(s).is_some())
            .collect())
    }

    /// One pass over every tablet of every table
    pub async fn run_once(&self) -> Result<PassStats> {
        let _pass = self.pass.lock().await;
        let placement = PlacementManager::new(self.live_servers().await?);
        let store = self.machine.store().clone();
        let mut stats = PassStats::default();

        for table in store.list_tables()? {
            // The table may be deleted between the listing and the scan
            let tablets = match store.tablets(&table.table) {
                Ok(tablets) => tablets,
                Err(Error::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            for tablet in tablets {
                if let Err(e) = self
                    .drive(&tablet.record, table.goal, &placement, &mut stats)
                    .await
                {
                    stats.failed += 1;
                    warn!(extent = %tablet.record.extent, error = %e, "Failed to drive tablet");
                }
            }
        }
        Ok(stats)
    }

    async fn drive(
        &self,
        tablet: &TabletRecord,
        goal: TableGoal,
        placement: &PlacementManager,
        stats: &mut PassStats,
    ) -> Result<()> {
        let extent = &tablet.extent;
        match (goal, &tablet.location.state) {
            (TableGoal::Online, LocationState::Unassigned | LocationState::Offline) => {
                let target = placement.select_server(extent, tablet.location.last())?;
                self.machine
                    .apply(extent, LocationEvent::BeginAssignment { target: target.clone() })
                    .await?;
                stats.assigned += 1;
                debug!(extent = %extent, server = %target, "Assigning tablet");
                self.load(extent, &target).await?;
            }
            (TableGoal::Online, LocationState::Assigning { target }) => {
                if placement.is_live(target) {
                    stats.reissued += 1;
                    self.load(extent, target).await?;
                } else {
                    self.server_lost(extent, target, stats).await?;
                }
            }
            (TableGoal::Online, LocationState::Hosted { server }) => {
                if !placement.is_live(server) {
                    self.server_lost(extent, server, stats).await?;
                }
            }
            (TableGoal::Offline, LocationState::Hosted { server }) => {
                match self.hosts.get(server).filter(|_| placement.is_live(server)) {
                    Some(host) => host.unload(extent).await?,
                    None => {
                        self.machine.apply(extent, LocationEvent::TakeOffline).await?;
                    }
                }
                stats.unloaded += 1;
            }
            (TableGoal::Offline, LocationState::Assigning { .. }) => {
                self.machine.apply(extent, LocationEvent::TakeOffline).await?;
                stats.unloaded += 1;
            }
            (TableGoal::Offline, LocationState::Unassigned | LocationState::Offline) => {}
        }
        Ok(())
    }

    async fn load(&self, extent: &KeyExtent, server: &ServerId) -> Result<()> {
        let host = self
            .hosts
            .get(server)
            .ok_or_else(|| Error::NotFound(format!("tablet server {}", server)))?;
        host.load(extent).await
    }

    async fn server_lost(
        &self,
        extent: &KeyExtent,
        server: &ServerId,
        stats: &mut PassStats,
    ) -> Result<()> {
        info!(extent = %extent, server = %server, "Tablet server lost, unassigning tablet");
        self.machine
            .apply(extent, LocationEvent::ServerLost { server: server.clone() })
            .await?;
        stats.lost += 1;
        Ok(())
    }
}
