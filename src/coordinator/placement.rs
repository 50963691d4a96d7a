//! Placement of tablets on tablet servers
//!
//! A tablet goes back to its `last` host when that server is live, or to a
//! live server restarted at the same address, which keeps its cached and
//! persisted data local. Otherwise HRW hashing over the live servers picks a
//! stable host for the extent.

use crate::common::{hrw_select, Error, KeyExtent, Result, ServerId};

/// Chooses hosts for unassigned tablets
#[derive(Debug, Clone, Default)]
pub struct PlacementManager {
    live: Vec<ServerId>,
}

impl PlacementManager {
    pub fn new(live: Vec<ServerId>) -> Self {
        let mut live = live;
        live.sort();
        live.dedup();
        Self { live }
    }

    pub fn live_servers(&self) -> &[ServerId] {
        &self.live
    }

    pub fn is_live(&self, server: &ServerId) -> bool {
        self.live.binary_search(server).is_ok()
    }

    /// Select a server for `extent`, preferring `last` (or its address)
    /// when live.
    pub fn select_server(&self, extent: &KeyExtent, last: Option<&ServerId>) -> Result<ServerId> {
        if let Some(last) = last {
            if self.is_live(last) {
                return Ok(last.clone());
            }
            if let Some(same_address) = self.live.iter().find(|s| s.address() == last.address()) {
                return Ok(same_address.clone());
            }
        }
        hrw_select(&extent.to_string(), &self.live).ok_or(Error::NoLiveServers)
    }
}
