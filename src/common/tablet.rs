//! Tablet identity: tables, tablet servers and key extents
//!
//! A tablet covers the rows `(prev_end_row, end_row]` of one table. `None`
//! bounds are open, so a table with no splits has a single tablet
//! `(None, None]`.

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Separator between the table id and the row part of a metadata key.
const KEY_SEPARATOR: u8 = b';';
/// Tag for tablets with a bounded end row; sorts before [`LAST_TABLET_TAG`].
const ROW_TABLET_TAG: u8 = 0x01;
/// Tag for the last tablet of a table (open end row).
const LAST_TABLET_TAG: u8 = 0x02;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableId(String);

impl TableId {
    /// Validate and wrap a table id. Ids are restricted to `[A-Za-z0-9_-]`
    /// so they can be embedded in metadata keys and coordination paths.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::Other("table id must not be empty".into()));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(Error::Other(format!("invalid table id: {}", id)));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a tablet server: its address plus the coordination session
/// that holds its lock (e.g. `localhost:9997[18c2f0a41b2]`). A restarted
/// server keeps its address but gets a new id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(String);

impl ServerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn with_session(address: &str, session: u64) -> Self {
        Self(format!("{}[{:x}]", address, session))
    }

    /// The address part, without the session
    pub fn address(&self) -> &str {
        match self.0.find('[') {
            Some(idx) => &self.0[..idx],
            None => &self.0,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Row range `(start, end]` with open bounds expressed as `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RowRange {
    pub start: Option<String>,
    pub end: Option<String>,
}

impl RowRange {
    pub fn new(start: Option<String>, end: Option<String>) -> Self {
        Self { start, end }
    }

    /// The whole table.
    pub fn all() -> Self {
        Self::default()
    }
}

/// A tablet: one contiguous row range of one table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyExtent {
    pub table: TableId,
    pub prev_end_row: Option<String>,
    pub end_row: Option<String>,
}

impl KeyExtent {
    pub fn new(table: TableId, prev_end_row: Option<String>, end_row: Option<String>) -> Self {
        Self {
            table,
            prev_end_row,
            end_row,
        }
    }

    /// Extents covering a table pre-split at `splits`.
    pub fn from_splits(table: &TableId, splits: &[String]) -> Vec<KeyExtent> {
        let mut splits = splits.to_vec();
        splits.sort();
        splits.dedup();

        let mut extents = Vec::with_capacity(splits.len() + 1);
        let mut prev = None;
        for split in splits {
            extents.push(KeyExtent::new(table.clone(), prev.clone(), Some(split.clone())));
            prev = Some(split);
        }
        extents.push(KeyExtent::new(table.clone(), prev, None));
        extents
    }

    pub fn row_range(&self) -> RowRange {
        RowRange::new(self.prev_end_row.clone(), self.end_row.clone())
    }

    pub fn contains_row(&self, row: &str) -> bool {
        let after_prev = match &self.prev_end_row {
            Some(prev) => row > prev.as_str(),
            None => true,
        };
        let before_end = match &self.end_row {
            Some(end) => row <= end.as_str(),
            None => true,
        };
        after_prev && before_end
    }

    /// Whether any row in the inclusive range `[start, end]` falls in this
    /// tablet. `None` leaves that side unbounded.
    pub fn overlaps(&self, start: Option<&str>, end: Option<&str>) -> bool {
        let starts_before_end = match (start, &self.end_row) {
            (Some(start), Some(end_row)) => start <= end_row.as_str(),
            _ => true,
        };
        let ends_after_prev = match (end, &self.prev_end_row) {
            (Some(end), Some(prev)) => end > prev.as_str(),
            _ => true,
        };
        starts_before_end && ends_after_prev
    }

    /// Key of this tablet's record in the metadata store. Keys of one table
    /// share [`KeyExtent::table_prefix`] and sort in row order with the
    /// last tablet at the end.
    pub fn metadata_key(&self) -> Vec<u8> {
        Self::key_for(&self.table, self.end_row.as_deref())
    }

    pub fn key_for(table: &TableId, end_row: Option<&str>) -> Vec<u8> {
        let mut key = Self::table_prefix(table);
        match end_row {
            Some(row) => {
                key.push(ROW_TABLET_TAG);
                key.extend_from_slice(row.as_bytes());
            }
            None => key.push(LAST_TABLET_TAG),
        }
        key
    }

    pub fn table_prefix(table: &TableId) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(table.as_str().len() + 1);
        prefix.extend_from_slice(table.as_str().as_bytes());
        prefix.push(KEY_SEPARATOR);
        prefix
    }
}

impl fmt::Display for KeyExtent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.end_row {
            Some(end) => write!(f, "{};{}", self.table, end)?,
            None => write!(f, "{}<", self.table)?,
        }
        if let Some(prev) = &self.prev_end_row {
            write!(f, ";{}", prev)?;
        }
        Ok(())
    }
}
