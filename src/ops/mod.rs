//! Administrative table operations
//!
//! Table lifecycle, location queries and the wait-capable admin commands
//! (`flush`, `set_online`, `set_offline`). Operations change authoritative
//! records by compare-and-set and publish the matching coordination node so
//! watching processes re-read; waits poll metadata snapshots.

pub mod flush;
pub mod online;
pub mod wait;

pub use flush::FlushOutcome;
pub use wait::{poll_until, WaitPolicy};

use crate::common::{Error, KeyExtent, Result, RowRange, ServerId, TableId};
use crate::coordination::{paths, CoordinationClient};
use crate::coordinator::assignment::HostDirectory;
use crate::coordinator::location::LocationSnapshot;
use crate::coordinator::metadata::{MetadataStore, TableGoal, TableRecord, Versioned};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Bounded retries when bumping a table record under contention
const TABLE_CAS_RETRIES: usize = 16;

/// One tablet as listed by `GET /tables/:table/locations`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletView {
    pub extent: String,
    pub start: Option<String>,
    pub end: Option<String>,
    pub state: String,
    pub current: Option<ServerId>,
    pub future: Option<ServerId>,
    pub last: Option<ServerId>,
    pub flush_id: u64,
}

pub struct TableOperations {
    store: Arc<MetadataStore>,
    client: Arc<dyn CoordinationClient>,
    hosts: Arc<HostDirectory>,
    wait: WaitPolicy,
}

impl TableOperations {
    pub fn new(
        store: Arc<MetadataStore>,
        client: Arc<dyn CoordinationClient>,
        hosts: Arc<HostDirectory>,
        wait: WaitPolicy,
    ) -> Self {
        Self {
            store,
            client,
            hosts,
            wait,
        }
    }

    pub fn wait_policy(&self) -> &WaitPolicy {
        &self.wait
    }

    /// Create a table pre-split at `splits`. Its tablets start unassigned
    /// with the goal online.
    pub async fn create_table(&self, table: &TableId, splits: &[String]) -> Result<Vec<KeyExtent>> {
        let extents = self.store.create_table(table, splits)?;

        self.client
            .set_data(&paths::table_config(table), Vec::new())
            .await?;
        self.client
            .set_data(&paths::table_flush(table), b"0".to_vec())
            .await?;
        self.client
            .set_data(&paths::table_locations(table), Vec::new())
            .await?;
        self.publish_goal(table, TableGoal::Online).await?;

        info!(table = %table, tablets = extents.len(), "Table created");
        Ok(extents)
    }

    /// Publish a table's nodes from its durable record, as after a restart
    pub async fn republish(&self, record: &TableRecord) -> Result<()> {
        let table = &record.table;
        self.client
            .set_data(&paths::table_config(table), Vec::new())
            .await?;
        self.client
            .set_data(
                &paths::table_flush(table),
                record.flush_id.to_string().into_bytes(),
            )
            .await?;
        self.client
            .set_data(&paths::table_locations(table), Vec::new())
            .await?;
        self.publish_goal(table, record.goal).await
    }

    /// Take the table offline, then remove its records and nodes
    pub async fn delete_table(&self, table: &TableId) -> Result<()> {
        self.set_offline(table, true).await?;
        self.store.delete_table(table)?;
        self.client.delete(&paths::table_root(table)).await?;
        info!(table = %table, "Table deleted");
        Ok(())
    }

    pub fn tables(&self) -> Result<Vec<TableRecord>> {
        self.store.list_tables()
    }

    /// Snapshot of the location of the tablet covering exactly `range`
    pub fn location_state(&self, table: &TableId, range: &RowRange) -> Result<LocationSnapshot> {
        Ok(self
            .store
            .tablet_for_range(table, range)?
            .record
            .location
            .snapshot())
    }

    /// Snapshot of every tablet of `table`, in row order
    pub fn locations(&self, table: &TableId) -> Result<Vec<TabletView>> {
        // Distinguish an unknown table from one with no tablets
        self.store.table(table)?;
        Ok(self
            .store
            .tablets(table)?
            .into_iter()
            .map(|v| {
                let record = v.record;
                let snapshot = record.location.snapshot();
                TabletView {
                    extent: record.extent.to_string(),
                    start: record.extent.prev_end_row.clone(),
                    end: record.extent.end_row.clone(),
                    state: record.location.state.to_string(),
                    current: snapshot.current,
                    future: snapshot.future,
                    last: snapshot.last,
                    flush_id: record.flush_id,
                }
            })
            .collect())
    }

    /// Write one row through the server hosting it
    pub async fn write(&self, table: &TableId, row: String, value: Vec<u8>) -> Result<ServerId> {
        let tablet = self
            .store
            .tablets(table)?
            .into_iter()
            .find(|v| v.record.extent.contains_row(&row))
            .ok_or_else(|| Error::NotFound(format!("tablet for row {} in {}", row, table)))?;

        let extent = tablet.record.extent;
        let server = tablet
            .record
            .location
            .current()
            .cloned()
            .ok_or_else(|| Error::NotHosted(extent.to_string()))?;
        let host = self
            .hosts
            .get(&server)
            .ok_or_else(|| Error::NotHosted(format!("{} on {}", extent, server)))?;

        host.write(&extent, row, value).await?;
        Ok(server)
    }

    /// Read-modify-CAS a table record, retrying from fresh reads
    fn update_table<F>(&self, table: &TableId, mut update: F) -> Result<Versioned<TableRecord>>
    where
        F: FnMut(&TableRecord) -> TableRecord,
    {
        let mut last_conflict = None;
        for _ in 0..TABLE_CAS_RETRIES {
            let read = self.store.table(table)?;
            let next = update(&read.record);
            if next == read.record {
                return Ok(read);
            }
            match self.store.compare_and_set_table(&read, next) {
                Ok(written) => return Ok(written),
                Err(e @ Error::StaleWriteConflict { .. }) => {
                    crate::common::metrics::METRICS.cas_conflicts.inc();
                    last_conflict = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_conflict.unwrap_or_else(|| Error::StaleWriteConflict {
            key: format!("table {}", table),
        }))
    }

    async fn publish_goal(&self, table: &TableId, goal: TableGoal) -> Result<()> {
        let state = match goal {
            TableGoal::Online => "online",
            TableGoal::Offline => "offline",
        };
        self.client
            .set_data(&paths::table_state(table), state.as_bytes().to_vec())
            .await
    }
}
