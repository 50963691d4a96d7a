//! Bring a table online or take it offline
//!
//! Only the table goal is written here; the assignment authority sees the
//! goal change through its watch on the table state node and moves the
//! tablets. Waiting polls the tablet records until every tablet is hosted
//! (online) or unhosted (offline).

use super::{poll_until, TableOperations};
use crate::common::{Result, TableId};
use crate::coordinator::metadata::TableGoal;
use tracing::info;

impl TableOperations {
    pub async fn set_online(&self, table: &TableId, wait: bool) -> Result<()> {
        self.set_goal(table, TableGoal::Online).await?;
        if wait {
            let store = self.store.clone();
            poll_until(&self.wait, "online", || {
                Ok(store
                    .tablets(table)?
                    .iter()
                    .all(|v| v.record.location.state.is_hosted()))
            })
            .await?;
        }
        Ok(())
    }

    pub async fn set_offline(&self, table: &TableId, wait: bool) -> Result<()> {
        self.set_goal(table, TableGoal::Offline).await?;
        if wait {
            let store = self.store.clone();
            poll_until(&self.wait, "offline", || {
                Ok(store
                    .tablets(table)?
                    .iter()
                    .all(|v| v.record.location.state.is_unhosted()))
            })
            .await?;
        }
        Ok(())
    }

    async fn set_goal(&self, table: &TableId, goal: TableGoal) -> Result<()> {
        let written = self.update_table(table, |record| {
            let mut next = record.clone();
            next.goal = goal;
            next
        })?;
        // Publish even when unchanged so a missed notification is repaired
        self.publish_goal(table, goal).await?;
        info!(table = %table, goal = ?goal, version = written.version, "Table goal set");
        Ok(())
    }
}
