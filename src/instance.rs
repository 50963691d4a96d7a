//! Single-node deployment
//!
//! Runs every process role of an instance inside one tokio runtime:
//! - the manager (assignment authority, admin operations)
//! - the tablet server role, shared by the `manager.tablet_servers` tablet
//!   servers; each server keeps its own session for its liveness lock
//! - the garbage collector and the monitor
//!
//! Each role has one coordination session and one watch footprint: the
//! instance paths, one watch per system property, one per tablet-server
//! lock, and four per table. A role reads what it watches through its
//! [`NodeCache`].

use crate::common::{
    Config, Error, Result, ServerId, TableId, LAST_LOCATION_MODE_KEY, MEMTABLE_MAX_ENTRIES_KEY,
    SYSTEM_PROPERTIES,
};
use crate::coordination::{
    paths, spawn_heartbeat, CoordinationClient, LocalClient, LocalCoordinationService, SessionId,
};
use crate::coordinator::assignment::{AssignmentManager, HostDirectory};
use crate::coordinator::budget::WatcherBudget;
use crate::coordinator::cache::{table_exists, NodeCache};
use crate::coordinator::metadata::MetadataStore;
use crate::coordinator::mode::LocationMode;
use crate::coordinator::state_machine::LocationStateMachine;
use crate::coordinator::watch::{
    RegistrationInfo, WatchHandle, WatchNotification, WatchRegistrar, WatchTarget,
};
use crate::ops::{poll_until, TableOperations, WaitPolicy};
use crate::tserver::TabletServer;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// First tablet server port; servers are named `localhost:<port>[<session>]`
const TSERVER_BASE_PORT: u16 = 9997;

const MANAGER: &str = "manager";
const TSERVER: &str = "tserver";
const GC: &str = "gc";
const MONITOR: &str = "monitor";

/// Watches held by one process role, with the cache they feed
pub struct ProcessFootprint {
    role: String,
    client: Arc<LocalClient>,
    registrar: Arc<WatchRegistrar>,
    cache: Arc<NodeCache>,
    system: Mutex<Vec<WatchHandle>>,
    tables: Mutex<HashMap<TableId, Vec<WatchHandle>>>,
}

impl ProcessFootprint {
    async fn start(
        role: &str,
        client: Arc<LocalClient>,
        servers: &[ServerId],
        resync_attempts: usize,
    ) -> Result<Arc<Self>> {
        let registrar = WatchRegistrar::new(role, client.clone(), resync_attempts);
        let footprint = Arc::new(Self {
            role: role.to_string(),
            cache: NodeCache::new(role, client.clone()),
            client,
            registrar,
            system: Mutex::new(Vec::new()),
            tables: Mutex::new(HashMap::new()),
        });

        let targets = paths::INSTANCE_PATHS
            .iter()
            .map(|p| WatchTarget::Instance(p.to_string()))
            .chain(
                SYSTEM_PROPERTIES
                    .iter()
                    .map(|key| WatchTarget::SystemProperty(key.to_string())),
            )
            .chain(servers.iter().cloned().map(WatchTarget::ServerLock));

        let mut system = Vec::new();
        for target in targets {
            system.push(footprint.hold(target).await?);
        }
        *footprint.system.lock().await = system;
        Ok(footprint)
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn session(&self) -> SessionId {
        self.client.session()
    }

    pub fn registrar(&self) -> &Arc<WatchRegistrar> {
        &self.registrar
    }

    pub fn cache(&self) -> &Arc<NodeCache> {
        &self.cache
    }

    async fn hold(&self, target: WatchTarget) -> Result<WatchHandle> {
        let handle = self.registrar.register(target.clone()).await?;
        self.cache.load(&target).await?;
        Ok(handle)
    }

    async fn let_go(&self, handle: WatchHandle) -> Result<()> {
        self.cache.evict(handle.target());
        self.registrar.release(handle).await
    }

    pub async fn watch_table(&self, table: &TableId) -> Result<()> {
        let mut tables = self.tables.lock().await;
        if tables.contains_key(table) {
            return Ok(());
        }
        let mut handles = Vec::with_capacity(4);
        for target in WatchTarget::for_table(table) {
            handles.push(self.hold(target).await?);
        }
        tables.insert(table.clone(), handles);
        Ok(())
    }

    pub async fn unwatch_table(&self, table: &TableId) -> Result<()> {
        let handles = self.tables.lock().await.remove(table);
        for handle in handles.into_iter().flatten() {
            self.let_go(handle).await?;
        }
        Ok(())
    }

    /// Release a table's watches if its nodes are really gone. Checked under
    /// the table lock so a recreated table's fresh watches are never dropped.
    async fn unwatch_deleted_table(&self, table: &TableId) -> Result<()> {
        let mut tables = self.tables.lock().await;
        if table_exists(self.client.as_ref(), table).await? {
            return Ok(());
        }
        let Some(handles) = tables.remove(table) else {
            return Ok(());
        };
        for handle in handles {
            self.let_go(handle).await?;
        }
        info!(role = %self.role, table = %table, "Released watches of deleted table");
        Ok(())
    }

    /// Keep the cache current and drop the watches of deleted tables
    fn spawn_followers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let footprint = self.clone();
        let mut notifications = self.registrar.subscribe();
        let invalidations = tokio::spawn(async move {
            loop {
                match notifications.recv().await {
                    Ok(WatchNotification::Invalidated(target)) => {
                        let Some(table) = target.table() else {
                            continue;
                        };
                        if let Err(e) = footprint.unwatch_deleted_table(table).await {
                            warn!(role = %footprint.role, table = %table, error = %e, "Failed to release table watches");
                        }
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        vec![self.cache.follow(&self.registrar), invalidations]
    }

    async fn release_all(&self) {
        let tables: Vec<TableId> = self.tables.lock().await.keys().cloned().collect();
        for table in tables {
            let _ = self.unwatch_table(&table).await;
        }
        let system: Vec<WatchHandle> = self.system.lock().await.drain(..).collect();
        for handle in system {
            let _ = self.let_go(handle).await;
        }
    }
}

/// Watches of one role, as returned by `GET /admin/watches`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessWatches {
    pub role: String,
    pub session: SessionId,
    pub degraded: bool,
    pub watches: Vec<RegistrationInfo>,
}

/// Watch totals with the budget envelope for the current table count
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchSummary {
    pub total: usize,
    pub tables: usize,
    pub envelope_min: u64,
    pub envelope_max: u64,
    pub within_budget: bool,
    pub processes: Vec<ProcessWatches>,
}

pub struct Instance {
    config: Config,
    service: LocalCoordinationService,
    store: Arc<MetadataStore>,
    machine: Arc<LocationStateMachine>,
    hosts: Arc<HostDirectory>,
    tservers: Vec<Arc<TabletServer>>,
    manager: Arc<AssignmentManager>,
    manager_client: Arc<LocalClient>,
    ops: TableOperations,
    footprints: Vec<Arc<ProcessFootprint>>,
    budget: WatcherBudget,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Instance {
    /// Bring up every role of the instance
    pub async fn start(config: Config) -> Result<Arc<Self>> {
        config.validate()?;
        info!(instance = %config.instance_name, mode = %config.last_location_mode, "Starting instance");

        let store = Arc::new(match &config.manager.db_path {
            Some(path) => {
                info!(path = %path.display(), "Opening metadata store");
                MetadataStore::open(path)?
            }
            None => MetadataStore::in_memory(),
        });

        let session_timeout = config.manager.session_timeout();
        let heartbeat = session_timeout / 3;
        let service = LocalCoordinationService::new();
        let mut tasks = vec![service.spawn_reaper(session_timeout)];

        let manager_client = service.connect()?;
        for path in paths::INSTANCE_PATHS {
            manager_client.set_data(path, Vec::new()).await?;
        }
        for key in SYSTEM_PROPERTIES {
            let value = config.property_value(key).unwrap_or_default();
            manager_client
                .set_data(&paths::property(key), value.into_bytes())
                .await?;
        }

        let machine = Arc::new(
            LocationStateMachine::new(
                store.clone(),
                config.last_location_mode,
                config.manager.cas_max_retries,
            )
            .with_notifier(manager_client.clone()),
        );

        // A server is named by its address and the session of its lock, so
        // records left by an earlier run never match a live server
        let mut server_clients = Vec::with_capacity(config.manager.tablet_servers);
        for i in 0..config.manager.tablet_servers {
            let client = service.connect()?;
            let address = format!("localhost:{}", TSERVER_BASE_PORT as usize + i);
            let id = ServerId::with_session(&address, client.session());
            server_clients.push((id, client));
        }
        let servers: Vec<ServerId> = server_clients.iter().map(|(id, _)| id.clone()).collect();

        let resync = config.watch.resync_attempts;
        let mut footprints = Vec::with_capacity(4);
        for role in [MANAGER, TSERVER, GC, MONITOR] {
            let client = if role == MANAGER {
                manager_client.clone()
            } else {
                service.connect()?
            };
            tasks.push(spawn_heartbeat(&client, heartbeat));
            let footprint = ProcessFootprint::start(role, client, &servers, resync).await?;
            tasks.extend(footprint.spawn_followers());
            footprints.push(footprint);
        }
        let settings = footprints[1].cache().clone();

        let hosts = Arc::new(HostDirectory::new());
        let mut tservers = Vec::with_capacity(server_clients.len());
        for (id, client) in server_clients {
            tasks.push(spawn_heartbeat(&client, heartbeat));
            let server = Arc::new(
                TabletServer::new(
                    id,
                    client,
                    machine.clone(),
                    config.manager.memtable_max_entries,
                )
                .with_settings(settings.clone()),
            );
            tasks.push(server.start().await?);
            hosts.register(server.clone());
            tservers.push(server);
        }

        let manager_registrar = footprints[0].registrar().clone();
        let manager = Arc::new(AssignmentManager::new(
            machine.clone(),
            manager_client.clone(),
            manager_registrar.clone(),
            hosts.clone(),
            config.manager.assignment_interval(),
        ));

        let ops = TableOperations::new(
            store.clone(),
            manager_client.clone(),
            hosts.clone(),
            WaitPolicy::from_config(&config.admin),
        );

        let instance = Arc::new(Self {
            budget: WatcherBudget::new(config.watch.budget),
            config,
            service,
            store,
            machine,
            hosts,
            tservers,
            manager,
            manager_client,
            ops,
            footprints,
            tasks: std::sync::Mutex::new(tasks),
        });

        instance.collect_garbage();
        for record in instance.store.list_tables()? {
            instance.ops.republish(&record).await?;
            instance.watch_table(&record.table).await?;
        }
        // Settle records left by an earlier run before serving
        instance.manager.balance().await;

        let follower = instance.follow_properties(manager_registrar.subscribe());
        let collector = instance.follow_deletions();
        let assignment = instance.manager.spawn();
        instance.track(follower);
        instance.track(collector);
        instance.track(assignment);

        info!(
            tservers = instance.tservers.len(),
            processes = instance.footprints.len(),
            "Instance ready"
        );
        Ok(instance)
    }

    fn track(&self, task: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(task);
    }

    /// Swap the mode policy whenever the mode property node changes
    fn follow_properties(
        self: &Arc<Self>,
        mut notifications: broadcast::Receiver<WatchNotification>,
    ) -> JoinHandle<()> {
        let instance = Arc::downgrade(self);
        let mode_target = WatchTarget::SystemProperty(LAST_LOCATION_MODE_KEY.to_string());
        tokio::spawn(async move {
            loop {
                let reread = match notifications.recv().await {
                    Ok(WatchNotification::Changed(target)) => target == mode_target,
                    Ok(WatchNotification::Resynced { .. })
                    | Err(broadcast::error::RecvError::Lagged(_)) => true,
                    Ok(_) => false,
                    Err(broadcast::error::RecvError::Closed) => return,
                };
                if !reread {
                    continue;
                }
                let Some(instance) = instance.upgrade() else {
                    return;
                };
                if let Err(e) = instance.reload_mode().await {
                    warn!(error = %e, "Failed to reload last location mode");
                }
            }
        })
    }

    async fn reload_mode(&self) -> Result<()> {
        let path = paths::property(LAST_LOCATION_MODE_KEY);
        let Some(bytes) = self.manager_client.get_data(&path).await? else {
            return Ok(());
        };
        let mode: LocationMode = String::from_utf8_lossy(&bytes).parse()?;
        self.machine.set_mode(mode);
        Ok(())
    }

    /// The garbage collector sweeps tablet records of deleted tables
    fn follow_deletions(self: &Arc<Self>) -> JoinHandle<()> {
        let instance = Arc::downgrade(self);
        let mut notifications = self.footprints[2].registrar().subscribe();
        tokio::spawn(async move {
            loop {
                let sweep = match notifications.recv().await {
                    Ok(WatchNotification::Invalidated(target)) => target.table().is_some(),
                    Ok(WatchNotification::Resynced { .. })
                    | Err(broadcast::error::RecvError::Lagged(_)) => true,
                    Ok(_) => false,
                    Err(broadcast::error::RecvError::Closed) => return,
                };
                if !sweep {
                    continue;
                }
                let Some(instance) = instance.upgrade() else {
                    return;
                };
                instance.collect_garbage();
            }
        })
    }

    fn collect_garbage(&self) {
        match self.store.sweep_orphans() {
            Ok(0) => {}
            Ok(removed) => info!(tablets = removed, "Removed orphaned tablet records"),
            Err(e) => warn!(error = %e, "Orphan sweep failed"),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn service(&self) -> &LocalCoordinationService {
        &self.service
    }

    pub fn store(&self) -> &Arc<MetadataStore> {
        &self.store
    }

    pub fn machine(&self) -> &Arc<LocationStateMachine> {
        &self.machine
    }

    pub fn ops(&self) -> &TableOperations {
        &self.ops
    }

    pub fn manager(&self) -> &Arc<AssignmentManager> {
        &self.manager
    }

    pub fn tservers(&self) -> &[Arc<TabletServer>] {
        &self.tservers
    }

    pub fn hosts(&self) -> &Arc<HostDirectory> {
        &self.hosts
    }

    pub fn footprints(&self) -> &[Arc<ProcessFootprint>] {
        &self.footprints
    }

    pub fn footprint(&self, role: &str) -> Option<&Arc<ProcessFootprint>> {
        self.footprints.iter().find(|f| f.role() == role)
    }

    pub fn mode(&self) -> LocationMode {
        self.machine.mode()
    }

    async fn watch_table(&self, table: &TableId) -> Result<()> {
        for footprint in &self.footprints {
            footprint.watch_table(table).await?;
        }
        Ok(())
    }

    pub async fn create_table(&self, table: &TableId, splits: &[String]) -> Result<usize> {
        let extents = self.ops.create_table(table, splits).await?;
        self.watch_table(table).await?;
        // Don't leave the new tablets to the next tick
        self.manager.balance().await;
        Ok(extents.len())
    }

    pub async fn delete_table(&self, table: &TableId) -> Result<()> {
        self.ops.delete_table(table).await?;
        for footprint in &self.footprints {
            footprint.unwatch_table(table).await?;
        }
        Ok(())
    }

    /// A system property as the monitor currently sees it
    pub fn property(&self, key: &str) -> Result<String> {
        if !SYSTEM_PROPERTIES.contains(&key) {
            return Err(Error::NotFound(format!("property {}", key)));
        }
        self.footprint(MONITOR)
            .and_then(|monitor| monitor.cache().property(key))
            .ok_or_else(|| Error::NotFound(format!("property {} is not published", key)))
    }

    /// Publish a system property. Only the last location mode and the
    /// memtable limit may change at runtime; the call returns once every
    /// role sees the new value and the state machine uses the new mode.
    pub async fn set_property(&self, key: &str, value: &str) -> Result<()> {
        if !SYSTEM_PROPERTIES.contains(&key) {
            return Err(Error::NotFound(format!("property {}", key)));
        }
        let published = match key {
            LAST_LOCATION_MODE_KEY => value.parse::<LocationMode>()?.to_string(),
            MEMTABLE_MAX_ENTRIES_KEY => value
                .parse::<usize>()
                .ok()
                .filter(|limit| *limit > 0)
                .ok_or_else(|| {
                    Error::ConfigurationInvalid(format!(
                        "{} must be a positive integer, got {}",
                        key, value
                    ))
                })?
                .to_string(),
            _ => {
                return Err(Error::ConfigurationInvalid(format!(
                    "property {} cannot be changed at runtime",
                    key
                )))
            }
        };

        self.manager_client
            .set_data(&paths::property(key), published.clone().into_bytes())
            .await?;
        info!(property = key, value = %published, "System property published");

        let machine = &self.machine;
        let footprints = &self.footprints;
        poll_until(self.ops.wait_policy(), "property", || {
            let mode_applied =
                key != LAST_LOCATION_MODE_KEY || machine.mode().to_string() == published;
            let seen = footprints
                .iter()
                .all(|f| f.cache().property(key).as_deref() == Some(published.as_str()));
            Ok(mode_applied && seen)
        })
        .await
    }

    /// Sum of watches held by every role
    pub async fn watch_count(&self) -> usize {
        join_all(
            self.footprints
                .iter()
                .map(|footprint| footprint.registrar().active_count()),
        )
        .await
        .into_iter()
        .sum()
    }

    pub async fn watch_summary(&self) -> Result<WatchSummary> {
        let mut processes = Vec::with_capacity(self.footprints.len());
        let mut total = 0;
        for footprint in &self.footprints {
            let watches = footprint.registrar().registrations().await;
            total += watches.len();
            processes.push(ProcessWatches {
                role: footprint.role().to_string(),
                session: footprint.session(),
                degraded: footprint.registrar().is_degraded(),
                watches,
            });
        }
        let tables = self.store.list_tables()?.len();
        let envelope = self.budget.envelope(tables as u64);
        Ok(WatchSummary {
            total,
            tables,
            envelope_min: *envelope.start(),
            envelope_max: *envelope.end(),
            within_budget: envelope.contains(&(total as u64)),
            processes,
        })
    }

    /// Stop every background task and close every session. Returns once the
    /// tasks are gone, so the metadata store can be reopened afterwards.
    pub async fn shutdown(&self) {
        info!("Shutting down instance");
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            let _ = task.await;
        }
        for footprint in &self.footprints {
            footprint.release_all().await;
            if let Err(e) = footprint.client.close().await {
                warn!(role = %footprint.role, error = %e, "Failed to close coordination session");
            }
        }
        for server in &self.tservers {
            server.stop().await;
        }
    }
}
