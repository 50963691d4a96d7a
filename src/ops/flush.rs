//! Flush a row range of a table
//!
//! A flush bumps the table's flush id and asks the host of every hosted
//! tablet overlapping the range to persist. Each host reports the persist
//! to the location state machine, which records the flush id (and, in
//! compaction mode, moves `last`). Waiting polls until every tablet hosted
//! at request time has recorded the new id or is no longer hosted by the
//! server that was asked. A host that gave the tablet up persisted it on the
//! way out, and a new host never received the request.

use super::{poll_until, TableOperations};
use crate::common::{KeyExtent, Result, ServerId, TableId};
use crate::coordination::paths;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushOutcome {
    pub flush_id: u64,
    /// Tablets asked to persist
    pub tablets: usize,
    pub waited: bool,
}

impl TableOperations {
    pub async fn flush(
        &self,
        table: &TableId,
        start: Option<&str>,
        end: Option<&str>,
        wait: bool,
    ) -> Result<FlushOutcome> {
        let written = self.update_table(table, |record| {
            let mut next = record.clone();
            next.flush_id += 1;
            next
        })?;
        let flush_id = written.record.flush_id;

        self.client
            .set_data(&paths::table_flush(table), flush_id.to_string().into_bytes())
            .await?;

        let targets: Vec<(KeyExtent, ServerId)> = self
            .store
            .tablets(table)?
            .into_iter()
            .filter(|v| v.record.extent.overlaps(start, end))
            .filter_map(|v| {
                let server = v.record.location.current().cloned()?;
                Some((v.record.extent, server))
            })
            .collect();

        for (extent, server) in &targets {
            let Some(host) = self.hosts.get(server) else {
                warn!(extent = %extent, server = %server, "Host of tablet unreachable, skipping flush");
                continue;
            };
            let extent = extent.clone();
            tokio::spawn(async move {
                if let Err(e) = host.flush(&extent, flush_id).await {
                    warn!(extent = %extent, flush_id, error = %e, "Tablet flush failed");
                }
            });
        }
        info!(table = %table, flush_id, tablets = targets.len(), wait, "Flush requested");

        if wait {
            let store = self.store.clone();
            poll_until(&self.wait, "flush", || {
                for (extent, server) in &targets {
                    let record = store.tablet(extent)?.record;
                    let same_host = record.location.current() == Some(server);
                    if record.flush_id < flush_id && same_host {
                        return Ok(false);
                    }
                }
                Ok(true)
            })
            .await?;
        }

        Ok(FlushOutcome {
            flush_id,
            tablets: targets.len(),
            waited: wait,
        })
    }
}
