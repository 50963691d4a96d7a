//! Metadata store
//!
//! Stores:
//! - Table records (goal state, requested flush id)
//! - Tablet records (location state, last location, persisted flush id)
//!
//! Every record is wrapped in a [`Versioned`] envelope and mutated only by
//! compare-and-set: the writer hands back the exact record it read, and the
//! write lands only if the stored bytes are still identical. Reads are
//! point-in-time snapshots and never wait on writers.

use crate::common::{timestamp_now_millis, Error, KeyExtent, Result, RowRange, TableId};
use crate::coordinator::location::TabletLocation;
use rocksdb::{ColumnFamily, Direction, IteratorMode, Options, DB};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use tracing::warn;

const CF_TABLES: &str = "tables";
const CF_TABLETS: &str = "tablets";

/// Record families kept by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    Tables,
    Tablets,
}

impl Family {
    fn cf_name(&self) -> &'static str {
        match self {
            Family::Tables => CF_TABLES,
            Family::Tablets => CF_TABLETS,
        }
    }
}

/// Raw byte storage with an atomic compare-and-swap.
pub trait MetadataBackend: Send + Sync {
    fn get(&self, family: Family, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Replace the value at `key` with `new` (delete when `None`) iff the
    /// stored value equals `expected` (absent when `None`).
    fn compare_and_swap(
        &self,
        family: Family,
        key: &[u8],
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> Result<bool>;

    fn delete(&self, family: Family, key: &[u8]) -> Result<()>;

    /// Consistent snapshot of all entries whose key starts with `prefix`,
    /// in key order.
    fn scan_prefix(&self, family: Family, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;
}

/// In-memory backend (tests, single-process deployments)
#[derive(Default)]
pub struct MemBackend {
    families: RwLock<HashMap<Family, BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> Error {
    Error::Internal("metadata lock poisoned".into())
}

impl MetadataBackend for MemBackend {
    fn get(&self, family: Family, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let families = self.families.read().map_err(poisoned)?;
        Ok(families.get(&family).and_then(|m| m.get(key).cloned()))
    }

    fn compare_and_swap(
        &self,
        family: Family,
        key: &[u8],
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> Result<bool> {
        let mut families = self.families.write().map_err(poisoned)?;
        let map = families.entry(family).or_default();
        if map.get(key).map(|v| v.as_slice()) != expected {
            return Ok(false);
        }
        match new {
            Some(value) => {
                map.insert(key.to_vec(), value.to_vec());
            }
            None => {
                map.remove(key);
            }
        }
        Ok(true)
    }

    fn delete(&self, family: Family, key: &[u8]) -> Result<()> {
        let mut families = self.families.write().map_err(poisoned)?;
        if let Some(map) = families.get_mut(&family) {
            map.remove(key);
        }
        Ok(())
    }

    fn scan_prefix(&self, family: Family, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let families = self.families.read().map_err(poisoned)?;
        let Some(map) = families.get(&family) else {
            return Ok(Vec::new());
        };
        Ok(map
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// RocksDB backend
///
/// RocksDB has no native conditional put on a plain `DB`, so the compare
/// and the write happen under a latch held only for that pair of calls.
pub struct RocksBackend {
    db: DB,
    write_latch: Mutex<()>,
}

impl RocksBackend {
    /// Open or create the store
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db = DB::open_cf(&opts, path, vec![CF_TABLES, CF_TABLETS])?;

        Ok(Self {
            db,
            write_latch: Mutex::new(()),
        })
    }

    fn cf(&self, family: Family) -> Result<&ColumnFamily> {
        self.db.cf_handle(family.cf_name()).ok_or_else(|| {
            Error::MetadataCorrupted(format!("missing column family {}", family.cf_name()))
        })
    }

    /// Flush memtables to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl MetadataBackend for RocksBackend {
    fn get(&self, family: Family, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cf = self.cf(family)?;
        Ok(self.db.get_cf(cf, key)?)
    }

    fn compare_and_swap(
        &self,
        family: Family,
        key: &[u8],
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> Result<bool> {
        let cf = self.cf(family)?;
        let _latch = self.write_latch.lock().map_err(poisoned)?;

        let current = self.db.get_cf(cf, key)?;
        if current.as_deref() != expected {
            return Ok(false);
        }
        match new {
            Some(value) => self.db.put_cf(cf, key, value)?,
            None => self.db.delete_cf(cf, key)?,
        }
        Ok(true)
    }

    fn delete(&self, family: Family, key: &[u8]) -> Result<()> {
        let cf = self.cf(family)?;
        let _latch = self.write_latch.lock().map_err(poisoned)?;
        self.db.delete_cf(cf, key)?;
        Ok(())
    }

    fn scan_prefix(&self, family: Family, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let cf = self.cf(family)?;
        let snapshot = self.db.snapshot();
        let iter = snapshot.iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward));

        let mut entries = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            entries.push((key.to_vec(), value.to_vec()));
        }
        Ok(entries)
    }
}

/// A record together with the version it was stored at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versioned<T> {
    pub version: u64,
    pub record: T,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableGoal {
    Online,
    Offline,
}

/// Table record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRecord {
    pub table: TableId,
    pub goal: TableGoal,
    /// Highest flush id requested for this table
    pub flush_id: u64,
    pub created_at: u64,
}

/// Tablet record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletRecord {
    pub extent: KeyExtent,
    pub location: TabletLocation,
    /// Highest flush id this tablet has persisted
    pub flush_id: u64,
    pub updated_at: u64,
}

impl TabletRecord {
    pub fn new(extent: KeyExtent) -> Self {
        Self {
            extent,
            location: TabletLocation::default(),
            flush_id: 0,
            updated_at: timestamp_now_millis(),
        }
    }
}

/// Metadata store
pub struct MetadataStore {
    backend: Arc<dyn MetadataBackend>,
    // Serializes table creation and deletion
    ddl: Mutex<()>,
}

impl MetadataStore {
    /// Open or create a RocksDB-backed store
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::with_backend(Arc::new(RocksBackend::open(path)?)))
    }

    pub fn in_memory() -> Self {
        Self::with_backend(Arc::new(MemBackend::new()))
    }

    pub fn with_backend(backend: Arc<dyn MetadataBackend>) -> Self {
        Self {
            backend,
            ddl: Mutex::new(()),
        }
    }

    // === Table operations ===

    /// Create a table record (goal online) and one unassigned tablet per
    /// split range.
    ///
    /// The table record is written last and is the commit point: tablet
    /// records without a table record are leftovers of an interrupted create
    /// or delete and are cleared first. A failure before the commit removes
    /// every tablet record this call wrote.
    pub fn create_table(&self, table: &TableId, splits: &[String]) -> Result<Vec<KeyExtent>> {
        let _ddl = self.ddl.lock().map_err(poisoned)?;
        let table_key = table.as_str().as_bytes();
        if self.backend.get(Family::Tables, table_key)?.is_some() {
            return Err(Error::AlreadyExists(format!("table {}", table)));
        }
        let leftovers = self.delete_tablets(table)?;
        if leftovers > 0 {
            warn!(table = %table, tablets = leftovers, "Cleared orphaned tablet records");
        }

        let extents = KeyExtent::from_splits(table, splits);
        let mut written: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(extents.len());
        let committed = self.write_new_table(table, &extents, &mut written);
        if let Err(e) = committed {
            for (key, bytes) in &written {
                if let Err(undo) =
                    self.backend
                        .compare_and_swap(Family::Tablets, key, Some(bytes), None)
                {
                    warn!(table = %table, error = %undo, "Failed to roll back tablet record");
                }
            }
            return Err(e);
        }
        Ok(extents)
    }

    fn write_new_table(
        &self,
        table: &TableId,
        extents: &[KeyExtent],
        written: &mut Vec<(Vec<u8>, Vec<u8>)>,
    ) -> Result<()> {
        for extent in extents {
            let record = Versioned {
                version: 1,
                record: TabletRecord::new(extent.clone()),
            };
            let key = extent.metadata_key();
            let bytes = bincode::serialize(&record)?;
            if !self
                .backend
                .compare_and_swap(Family::Tablets, &key, None, Some(&bytes))?
            {
                return Err(Error::AlreadyExists(format!("tablet {}", extent)));
            }
            written.push((key, bytes));
        }

        let record = Versioned {
            version: 1,
            record: TableRecord {
                table: table.clone(),
                goal: TableGoal::Online,
                flush_id: 0,
                created_at: timestamp_now_millis(),
            },
        };
        let bytes = bincode::serialize(&record)?;
        if !self.backend.compare_and_swap(
            Family::Tables,
            table.as_str().as_bytes(),
            None,
            Some(&bytes),
        )? {
            return Err(Error::AlreadyExists(format!("table {}", table)));
        }
        Ok(())
    }

    fn delete_tablets(&self, table: &TableId) -> Result<usize> {
        let keys = self
            .backend
            .scan_prefix(Family::Tablets, &KeyExtent::table_prefix(table))?;
        for (key, _) in &keys {
            self.backend.delete(Family::Tablets, key)?;
        }
        Ok(keys.len())
    }

    /// Remove a table and all of its tablet records
    pub fn delete_table(&self, table: &TableId) -> Result<()> {
        let _ddl = self.ddl.lock().map_err(poisoned)?;
        let table_key = table.as_str().as_bytes();
        if self.backend.get(Family::Tables, table_key)?.is_none() {
            return Err(Error::NotFound(format!("table {}", table)));
        }

        // Table record first, so no new flush or goal change targets the
        // tablets being removed
        self.backend.delete(Family::Tables, table_key)?;
        self.delete_tablets(table)?;
        Ok(())
    }

    /// Delete tablet records whose table record is gone. Returns how many
    /// were removed.
    pub fn sweep_orphans(&self) -> Result<usize> {
        let _ddl = self.ddl.lock().map_err(poisoned)?;
        let mut removed = 0;
        for (key, bytes) in self.backend.scan_prefix(Family::Tablets, &[])? {
            let versioned: Versioned<TabletRecord> = bincode::deserialize(&bytes)?;
            let table = &versioned.record.extent.table;
            if self
                .backend
                .get(Family::Tables, table.as_str().as_bytes())?
                .is_none()
            {
                self.backend.delete(Family::Tablets, &key)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn table(&self, table: &TableId) -> Result<Versioned<TableRecord>> {
        match self.backend.get(Family::Tables, table.as_str().as_bytes())? {
            Some(bytes) => Ok(bincode::deserialize(&bytes)?),
            None => Err(Error::NotFound(format!("table {}", table))),
        }
    }

    pub fn list_tables(&self) -> Result<Vec<TableRecord>> {
        self.backend
            .scan_prefix(Family::Tables, &[])?
            .into_iter()
            .map(|(_, bytes)| {
                let versioned: Versioned<TableRecord> = bincode::deserialize(&bytes)?;
                Ok(versioned.record)
            })
            .collect()
    }

    pub fn compare_and_set_table(
        &self,
        read: &Versioned<TableRecord>,
        next: TableRecord,
    ) -> Result<Versioned<TableRecord>> {
        let key = read.record.table.as_str().as_bytes().to_vec();
        self.compare_and_set(Family::Tables, &key, read, next, || {
            format!("table {}", read.record.table)
        })
    }

    // === Tablet operations ===

    /// Snapshot read of one tablet
    pub fn tablet(&self, extent: &KeyExtent) -> Result<Versioned<TabletRecord>> {
        let found: Option<Versioned<TabletRecord>> =
            match self.backend.get(Family::Tablets, &extent.metadata_key())? {
                Some(bytes) => Some(bincode::deserialize(&bytes)?),
                None => None,
            };
        match found {
            Some(v) if v.record.extent == *extent => Ok(v),
            _ => Err(Error::NotFound(format!("tablet {}", extent))),
        }
    }

    /// Snapshot read of the tablet covering exactly `range`
    pub fn tablet_for_range(
        &self,
        table: &TableId,
        range: &RowRange,
    ) -> Result<Versioned<TabletRecord>> {
        self.tablet(&KeyExtent::new(
            table.clone(),
            range.start.clone(),
            range.end.clone(),
        ))
    }

    /// Snapshot of every tablet of a table, in row order
    pub fn tablets(&self, table: &TableId) -> Result<Vec<Versioned<TabletRecord>>> {
        self.backend
            .scan_prefix(Family::Tablets, &KeyExtent::table_prefix(table))?
            .into_iter()
            .map(|(_, bytes)| Ok(bincode::deserialize(&bytes)?))
            .collect()
    }

    pub fn compare_and_set_tablet(
        &self,
        read: &Versioned<TabletRecord>,
        mut next: TabletRecord,
    ) -> Result<Versioned<TabletRecord>> {
        next.updated_at = timestamp_now_millis();
        let key = read.record.extent.metadata_key();
        self.compare_and_set(Family::Tablets, &key, read, next, || {
            format!("tablet {}", read.record.extent)
        })
    }

    fn compare_and_set<T, F>(
        &self,
        family: Family,
        key: &[u8],
        read: &Versioned<T>,
        next: T,
        label: F,
    ) -> Result<Versioned<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> String,
    {
        let expected = bincode::serialize(read)?;
        let written = Versioned {
            version: read.version + 1,
            record: next,
        };
        let bytes = bincode::serialize(&written)?;

        if self
            .backend
            .compare_and_swap(family, key, Some(&expected), Some(&bytes))?
        {
            Ok(written)
        } else {
            Err(Error::StaleWriteConflict { key: label() })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ServerId;
    use crate::coordinator::location::LocationState;
    use tempfile::tempdir;

    fn table(id: &str) -> TableId {
        TableId::new(id).unwrap()
    }

    fn exercise_store(store: &MetadataStore) {
        let t = table("t1");
        let extents = store.create_table(&t, &["m".to_string()]).unwrap();
        assert_eq!(extents.len(), 2);
        assert!(matches!(
            store.create_table(&t, &[]),
            Err(Error::AlreadyExists(_))
        ));

        let tablets = store.tablets(&t).unwrap();
        assert_eq!(tablets.len(), 2);
        assert!(tablets
            .iter()
            .all(|v| v.record.location == TabletLocation::default()));

        // CAS succeeds against the version that was read
        let read = store.tablet(&extents[0]).unwrap();
        let mut next = read.record.clone();
        next.location.state = LocationState::Assigning {
            target: ServerId::new("ts1"),
        };
        let written = store.compare_and_set_tablet(&read, next.clone()).unwrap();
        assert_eq!(written.version, read.version + 1);

        // ...and fails against a stale read
        let err = store.compare_and_set_tablet(&read, next).unwrap_err();
        assert!(matches!(err, Error::StaleWriteConflict { .. }));

        let range = extents[1].row_range();
        let last = store.tablet_for_range(&t, &range).unwrap();
        assert_eq!(last.record.extent, extents[1]);

        store.delete_table(&t).unwrap();
        assert!(store.tablets(&t).unwrap().is_empty());
        assert!(matches!(store.table(&t), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_mem_store() {
        exercise_store(&MetadataStore::in_memory());
    }

    #[test]
    fn test_rocks_store() {
        let dir = tempdir().unwrap();
        exercise_store(&MetadataStore::open(dir.path().join("meta.db")).unwrap());
    }

    #[test]
    fn test_rocks_store_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("meta.db");
        {
            let store = MetadataStore::open(&path).unwrap();
            store.create_table(&table("t1"), &[]).unwrap();
        }
        let store = MetadataStore::open(&path).unwrap();
        let tables = store.list_tables().unwrap();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].goal, TableGoal::Online);
        assert_eq!(store.tablets(&table("t1")).unwrap().len(), 1);
    }

    #[test]
    fn test_scan_is_scoped_to_table() {
        let store = MetadataStore::in_memory();
        store.create_table(&table("t1"), &["a".to_string()]).unwrap();
        store.create_table(&table("t10"), &[]).unwrap();
        assert_eq!(store.tablets(&table("t1")).unwrap().len(), 2);
        assert_eq!(store.tablets(&table("t10")).unwrap().len(), 1);
        assert_eq!(store.list_tables().unwrap().len(), 2);
    }

    /// Fails the `nth` compare-and-swap (1-based), passes everything else on
    struct FailingBackend {
        inner: MemBackend,
        nth: usize,
        calls: std::sync::atomic::AtomicUsize,
    }

    impl FailingBackend {
        fn new(nth: usize) -> Self {
            Self {
                inner: MemBackend::new(),
                nth,
                calls: std::sync::atomic::AtomicUsize::new(0),
            }
        }
    }

    impl MetadataBackend for FailingBackend {
        fn get(&self, family: Family, key: &[u8]) -> Result<Option<Vec<u8>>> {
            self.inner.get(family, key)
        }

        fn compare_and_swap(
            &self,
            family: Family,
            key: &[u8],
            expected: Option<&[u8]>,
            new: Option<&[u8]>,
        ) -> Result<bool> {
            let call = self
                .calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
                + 1;
            if call == self.nth {
                return Err(Error::Internal("injected write failure".into()));
            }
            self.inner.compare_and_swap(family, key, expected, new)
        }

        fn delete(&self, family: Family, key: &[u8]) -> Result<()> {
            self.inner.delete(family, key)
        }

        fn scan_prefix(&self, family: Family, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
            self.inner.scan_prefix(family, prefix)
        }
    }

    #[test]
    fn test_failed_create_leaves_no_tablets() {
        let t = table("t1");
        let splits = ["g".to_string(), "p".to_string()];

        // Third tablet write fails
        let store = MetadataStore::with_backend(Arc::new(FailingBackend::new(3)));
        assert!(matches!(
            store.create_table(&t, &splits),
            Err(Error::Internal(_))
        ));
        assert!(store.tablets(&t).unwrap().is_empty());
        assert!(matches!(store.table(&t), Err(Error::NotFound(_))));

        // The table record write (the commit) fails
        let store = MetadataStore::with_backend(Arc::new(FailingBackend::new(4)));
        assert!(store.create_table(&t, &splits).is_err());
        assert!(store.tablets(&t).unwrap().is_empty());
        assert!(store.list_tables().unwrap().is_empty());

        // A retry after the failure succeeds
        assert_eq!(store.create_table(&t, &splits).unwrap().len(), 3);
        assert_eq!(store.tablets(&t).unwrap().len(), 3);
    }

    #[test]
    fn test_create_clears_orphaned_tablets() {
        let store = MetadataStore::in_memory();
        let t = table("t1");
        store.create_table(&t, &["m".to_string()]).unwrap();
        // A delete interrupted after the table record went away
        store
            .backend
            .delete(Family::Tables, t.as_str().as_bytes())
            .unwrap();
        assert_eq!(store.tablets(&t).unwrap().len(), 2);

        let extents = store.create_table(&t, &[]).unwrap();
        assert_eq!(extents.len(), 1);
        let tablets = store.tablets(&t).unwrap();
        assert_eq!(tablets.len(), 1);
        assert_eq!(tablets[0].record.extent, extents[0]);
    }

    #[test]
    fn test_sweep_removes_only_orphans() {
        let store = MetadataStore::in_memory();
        store.create_table(&table("kept"), &["m".to_string()]).unwrap();
        store.create_table(&table("dropped"), &["m".to_string()]).unwrap();
        store
            .backend
            .delete(Family::Tables, b"dropped")
            .unwrap();

        assert_eq!(store.sweep_orphans().unwrap(), 2);
        assert!(store.tablets(&table("dropped")).unwrap().is_empty());
        assert_eq!(store.tablets(&table("kept")).unwrap().len(), 2);
        assert_eq!(store.sweep_orphans().unwrap(), 0);
    }

    #[test]
    fn test_tablet_range_mismatch_is_not_found() {
        let store = MetadataStore::in_memory();
        let t = table("t1");
        store.create_table(&t, &["m".to_string()]).unwrap();
        // Same end row, wrong previous end row
        let wrong = RowRange::new(Some("a".into()), Some("m".into()));
        assert!(matches!(
            store.tablet_for_range(&t, &wrong),
            Err(Error::NotFound(_))
        ));
    }
}
