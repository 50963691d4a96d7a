//! Common utilities and types shared across tabletloc

pub mod config;
pub mod error;
pub mod hash;
pub mod metrics;
pub mod tablet;
pub mod tracing_middleware;
pub mod utils;

pub use config::{
    AdminConfig, BudgetConfig, Config, ManagerConfig, WatchConfig, LAST_LOCATION_MODE_KEY,
    MEMTABLE_MAX_ENTRIES_KEY, SYSTEM_PROPERTIES,
};
pub use error::{Error, Result};
pub use hash::{hrw_hash, hrw_select};
pub use tablet::{KeyExtent, RowRange, ServerId, TableId};
pub use utils::{parse_duration, retry_with_backoff, timestamp_now_millis, Backoff};
