//! Watcher budget
//!
//! Total active watches of a deployment must stay inside
//! `[base_min + per_table_min * tables, base_max + per_table_max * tables]`.
//! Falling outside means watches leak (typically one per tablet instead of
//! one per table) and is a regression to fix, not a runtime fault.

use crate::common::{BudgetConfig, Error, Result};
use std::ops::RangeInclusive;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatcherBudget {
    config: BudgetConfig,
}

impl WatcherBudget {
    pub fn new(config: BudgetConfig) -> Self {
        Self { config }
    }

    /// Expected number of watches for `tables` tables
    pub fn envelope(&self, tables: u64) -> RangeInclusive<u64> {
        let min = self.config.base_min + self.config.per_table_min * tables;
        let max = self.config.base_max + self.config.per_table_max * tables;
        min..=max
    }

    pub fn check(&self, observed: u64, tables: u64) -> Result<()> {
        let envelope = self.envelope(tables);
        if envelope.contains(&observed) {
            Ok(())
        } else {
            Err(Error::WatchBudgetViolated {
                observed,
                min: *envelope.start(),
                max: *envelope.end(),
            })
        }
    }
}

impl Default for WatcherBudget {
    fn default() -> Self {
        Self::new(BudgetConfig::default())
    }
}
