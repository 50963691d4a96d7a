//! Last-location mode policy
//!
//! The mode decides *when* a tablet's `last` location follows its host:
//!
//! - [`LocationMode::Assignment`]: as soon as a server confirms ownership,
//!   before any data is persisted. `last` is a placement hint.
//! - [`LocationMode::Compaction`]: only when a persistence event (flush or
//!   compaction) completes on the hosting server. `last` is a durability
//!   hint; a hosted tablet that never persisted reports `last = None`.
//!
//! The policy is a strategy object selected from configuration and
//! consulted on every transition.

use crate::common::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocationMode {
    Assignment,
    #[default]
    Compaction,
}

impl fmt::Display for LocationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocationMode::Assignment => write!(f, "assignment"),
            LocationMode::Compaction => write!(f, "compaction"),
        }
    }
}

impl FromStr for LocationMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "assignment" => Ok(LocationMode::Assignment),
            "compaction" => Ok(LocationMode::Compaction),
            other => Err(Error::ConfigurationInvalid(format!(
                "unknown last location mode '{}', expected 'assignment' or 'compaction'",
                other
            ))),
        }
    }
}

/// Lifecycle moments at which `last` may be moved to the hosting server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LastLocationTrigger {
    /// A server confirmed ownership of the tablet.
    Hosted,
    /// The hosting server completed a durable persist (flush/compaction).
    Persisted,
}

/// Strategy deciding whether `last` follows the host on a trigger.
pub trait LocationModePolicy: Send + Sync + fmt::Debug {
    fn mode(&self) -> LocationMode;

    fn updates_last_on(&self, trigger: LastLocationTrigger) -> bool;
}

#[derive(Debug, Default)]
pub struct AssignmentPolicy;

impl LocationModePolicy for AssignmentPolicy {
    fn mode(&self) -> LocationMode {
        LocationMode::Assignment
    }

    fn updates_last_on(&self, trigger: LastLocationTrigger) -> bool {
        trigger == LastLocationTrigger::Hosted
    }
}

#[derive(Debug, Default)]
pub struct CompactionPolicy;

impl LocationModePolicy for CompactionPolicy {
    fn mode(&self) -> LocationMode {
        LocationMode::Compaction
    }

    fn updates_last_on(&self, trigger: LastLocationTrigger) -> bool {
        trigger == LastLocationTrigger::Persisted
    }
}

pub fn policy_for(mode: LocationMode) -> Arc<dyn LocationModePolicy> {
    match mode {
        LocationMode::Assignment => Arc::new(AssignmentPolicy),
        LocationMode::Compaction => Arc::new(CompactionPolicy),
    }
}
