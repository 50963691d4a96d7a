//! Per-process cache of watched coordination nodes
//!
//! A process reads the nodes it watches through its [`NodeCache`]. Every
//! watch notification is taken as a hint: the cache re-reads the node from
//! the coordination service rather than trusting the notification.

use crate::common::{Result, TableId};
use crate::coordination::{paths, CoordinationClient};
use crate::coordinator::watch::{WatchNotification, WatchRegistrar, WatchTarget};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub struct NodeCache {
    name: String,
    client: Arc<dyn CoordinationClient>,
    entries: RwLock<HashMap<WatchTarget, Option<Vec<u8>>>>,
}

impl NodeCache {
    pub fn new(name: impl Into<String>, client: Arc<dyn CoordinationClient>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            client,
            entries: RwLock::new(HashMap::new()),
        })
    }

    /// Start caching `target`
    pub async fn load(&self, target: &WatchTarget) -> Result<()> {
        let data = self.client.get_data(&target.path()).await?;
        self.entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(target.clone(), data);
        Ok(())
    }

    pub fn evict(&self, target: &WatchTarget) {
        self.entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(target);
    }

    /// Cached data of `target`; `None` when not cached or the node is absent
    pub fn get(&self, target: &WatchTarget) -> Option<Vec<u8>> {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(target)
            .cloned()
            .flatten()
    }

    pub fn property(&self, key: &str) -> Option<String> {
        self.get(&WatchTarget::SystemProperty(key.to_string()))
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Re-read one cached node. Targets no longer cached are left alone.
    async fn refresh(&self, target: &WatchTarget) -> Result<()> {
        let data = self.client.get_data(&target.path()).await?;
        if let Some(entry) = self
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get_mut(target)
        {
            *entry = data;
        }
        Ok(())
    }

    async fn refresh_all(&self) {
        let targets: Vec<WatchTarget> = self
            .entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect();
        for target in &targets {
            if let Err(e) = self.refresh(target).await {
                warn!(cache = %self.name, target = %target, error = %e, "Failed to refresh cached node");
            }
        }
        debug!(cache = %self.name, nodes = targets.len(), "Cache refreshed");
    }

    /// Keep the cache current with `registrar`'s notifications
    pub fn follow(self: &Arc<Self>, registrar: &WatchRegistrar) -> JoinHandle<()> {
        let cache = self.clone();
        let mut notifications = registrar.subscribe();
        tokio::spawn(async move {
            loop {
                match notifications.recv().await {
                    Ok(WatchNotification::Changed(target))
                    | Ok(WatchNotification::Invalidated(target)) => {
                        if let Err(e) = cache.refresh(&target).await {
                            warn!(cache = %cache.name, target = %target, error = %e, "Failed to refresh cached node");
                        }
                    }
                    Ok(WatchNotification::Resynced { .. })
                    | Ok(WatchNotification::Lagged { .. })
                    | Err(broadcast::error::RecvError::Lagged(_)) => cache.refresh_all().await,
                    Ok(WatchNotification::SessionLost) => {}
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        })
    }
}

/// Whether `table`'s state node exists, read from the service
pub async fn table_exists(client: &dyn CoordinationClient, table: &TableId) -> Result<bool> {
    Ok(client.get_data(&paths::table_state(table)).await?.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::LocalCoordinationService;
    use std::time::Duration;

    async fn eventually<F: Fn() -> bool>(check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_cache_follows_changes() {
        let service = LocalCoordinationService::new();
        let writer = service.connect().unwrap();
        let client = service.connect().unwrap();
        let registrar = WatchRegistrar::new("test", client.clone(), 3);
        let cache = NodeCache::new("test", client);
        let _follower = cache.follow(&registrar);

        let target = WatchTarget::SystemProperty("log.level".into());
        writer
            .set_data(&target.path(), b"info".to_vec())
            .await
            .unwrap();
        let _handle = registrar.register(target.clone()).await.unwrap();
        cache.load(&target).await.unwrap();
        assert_eq!(cache.property("log.level").as_deref(), Some("info"));

        writer
            .set_data(&target.path(), b"debug".to_vec())
            .await
            .unwrap();
        eventually(|| cache.property("log.level").as_deref() == Some("debug")).await;

        writer.delete(&target.path()).await.unwrap();
        eventually(|| cache.property("log.level").is_none()).await;
        assert_eq!(cache.len(), 1);

        cache.evict(&target);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_table_exists() {
        let service = LocalCoordinationService::new();
        let client = service.connect().unwrap();
        let table = TableId::new("t1").unwrap();
        assert!(!table_exists(client.as_ref(), &table).await.unwrap());

        client
            .set_data(&paths::table_state(&table), b"online".to_vec())
            .await
            .unwrap();
        assert!(table_exists(client.as_ref(), &table).await.unwrap());
    }
}
