//! Multi-version partition storage.
//!
//! [`MvPartitionStorage`] ties one partition's version chains and secondary
//! indexes together and applies the write commands delivered by the
//! replication log:
//!
//! 1. commands at or below the last applied log index are skipped
//! 2. every row is checked before anything is written (key sizes, stale
//!    timestamps, unique indexes), so caller errors leave no trace
//! 3. chains are updated first, then indexes
//! 4. the applied index and the visible timestamp advance last
//!
//! Reads at `t` are evaluated at `min(t, visible timestamp)`, so a command's
//! effects appear at once. An I/O or corruption error quarantines the
//! partition until it is restored from a snapshot.

mod command;
mod index;
mod meta;
mod schemas;
mod snapshot;

pub use command::{CommandEnvelope, CommandOutcome, TxId, WriteCommand};
pub use index::{IndexDescriptor, IndexEntries, IndexKind, ScanBounds, SecondaryIndex};
pub use meta::StorageMeta;
pub use snapshot::{PartitionSnapshot, SnapshotRow, SnapshotVersion};

use crate::btree::{BplusTree, HashIndexEntry, IndexMetaEntry, IndexMetaTree, SchemaMetaTree};
use crate::mvcc::{GcStats, ReadResult, VersionChain, VisibleRows};
use crate::store::PageStore;
use crate::tuple::{BinaryRow, SchemaDescriptor, Value};
use schemas::SchemaVersions;
use basalt_common::page::{PageId, PageType};
use basalt_common::{BasaltError, HybridTimestamp, Result};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Index change planned for one row.
struct IndexChange {
    index: Arc<SecondaryIndex>,
    old: Option<Vec<u8>>,
    new: Option<Vec<u8>>,
}

/// Row write planned by a command.
struct PlannedWrite {
    key: Vec<u8>,
    /// None writes a tombstone.
    row: Option<BinaryRow>,
    /// Row visible before the command.
    current: Option<BinaryRow>,
    changes: Vec<IndexChange>,
}

/// Storage of one partition.
pub struct MvPartitionStorage {
    store: Arc<PageStore>,
    partition: u32,
    meta_page: PageId,
    chain: VersionChain,
    index_meta: BplusTree<IndexMetaTree>,
    schema_meta: BplusTree<SchemaMetaTree>,
    indexes: RwLock<BTreeMap<u32, Arc<SecondaryIndex>>>,
    schemas: RwLock<SchemaVersions>,
    /// Serializes commands, index builds, gc and snapshots.
    writer: Mutex<()>,
    last_applied: AtomicU64,
    visible_ts: AtomicU64,
    quarantined: AtomicBool,
}

impl MvPartitionStorage {
    /// Opens the storage of a partition, creating it when the partition is
    /// new.
    ///
    /// `schema` is registered next to the versions stored with the
    /// partition; the newest known version is current.
    ///
    /// Indexes left half-maintained by an interrupted command are rebuilt.
    pub fn open(store: Arc<PageStore>, partition: u32, schema: SchemaDescriptor) -> Result<Self> {
        store.open_partition(partition)?;
        let _guard = store.mutation_guard();

        let root = store.partition_root(partition)?;
        let storage = if root == 0 {
            Self::create(store.clone(), partition, schema)?
        } else {
            let storage = Self::load(store.clone(), PageId::new(partition, root))?;
            storage.add_schema(schema)?;
            storage
        };

        if storage.read_meta()?.index_rebuild_pending {
            tracing::warn!(partition, "index maintenance was interrupted, rebuilding indexes");
            let _writer = storage.writer.lock();
            storage.rebuild_indexes_locked()?;
        }
        Ok(storage)
    }

    fn create(store: Arc<PageStore>, partition: u32, schema: SchemaDescriptor) -> Result<Self> {
        let meta_page = store.allocate(partition, PageType::StorageMeta)?;
        let chain = VersionChain::create(store.clone(), partition)?;
        let index_meta = BplusTree::<IndexMetaTree>::create(store.clone(), partition)?;
        let schema_meta = BplusTree::<SchemaMetaTree>::create(store.clone(), partition)?;
        schemas::write_schema(&schema_meta, store.page_size(), &schema)?;

        let meta = StorageMeta::new(
            chain.primary().meta_page().page_idx,
            index_meta.meta_page().page_idx,
            schema_meta.meta_page().page_idx,
        );
        meta.init(&mut store.write(meta_page)?, meta_page);
        store.set_partition_root(partition, meta_page.page_idx)?;

        tracing::info!(partition, meta = %meta_page, "created partition storage");
        let versions = SchemaVersions::new(Arc::new(schema));
        Ok(Self::assemble(store, meta_page, chain, index_meta, schema_meta, BTreeMap::new(), versions, &meta))
    }

    fn load(store: Arc<PageStore>, meta_page: PageId) -> Result<Self> {
        let partition = meta_page.partition;
        let meta = StorageMeta::read_from(&store.read(meta_page)?, meta_page)?;
        let chain = VersionChain::open(store.clone(), PageId::new(partition, meta.primary_meta))?;
        let index_meta = BplusTree::<IndexMetaTree>::open(store.clone(), PageId::new(partition, meta.index_meta))?;
        let schema_meta = BplusTree::<SchemaMetaTree>::open(store.clone(), PageId::new(partition, meta.schema_meta))?;

        let mut stored = schemas::read_schemas(&schema_meta)?.into_iter();
        let mut versions = match stored.next() {
            Some(first) => SchemaVersions::new(Arc::new(first)),
            None => {
                return Err(BasaltError::PageCorrupted {
                    page_id: meta_page.as_u64(),
                    reason: "partition without a schema".to_string(),
                })
            }
        };
        for schema in stored {
            versions.insert(Arc::new(schema));
        }

        let mut indexes = BTreeMap::new();
        for entry in index_meta.iter() {
            let entry = entry?;
            let descriptor = IndexDescriptor::from_bytes(entry.index_id, &entry.descriptor)?;
            let index = SecondaryIndex::open(store.clone(), PageId::new(partition, entry.meta_page), descriptor)?;
            indexes.insert(entry.index_id, Arc::new(index));
        }

        tracing::info!(
            partition,
            last_applied = meta.last_applied_index,
            indexes = indexes.len(),
            schema_versions = versions.versions.len(),
            "opened partition storage"
        );
        Ok(Self::assemble(store, meta_page, chain, index_meta, schema_meta, indexes, versions, &meta))
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        store: Arc<PageStore>,
        meta_page: PageId,
        chain: VersionChain,
        index_meta: BplusTree<IndexMetaTree>,
        schema_meta: BplusTree<SchemaMetaTree>,
        indexes: BTreeMap<u32, Arc<SecondaryIndex>>,
        schemas: SchemaVersions,
        meta: &StorageMeta,
    ) -> Self {
        Self {
            store,
            partition: meta_page.partition,
            meta_page,
            chain,
            index_meta,
            schema_meta,
            indexes: RwLock::new(indexes),
            schemas: RwLock::new(schemas),
            writer: Mutex::new(()),
            last_applied: AtomicU64::new(meta.last_applied_index),
            visible_ts: AtomicU64::new(meta.last_applied_ts.as_u64()),
            quarantined: AtomicBool::new(false),
        }
    }

    // =========================================================================
    // State
    // =========================================================================

    pub fn partition(&self) -> u32 {
        self.partition
    }

    /// Version chains of the partition.
    pub fn chain(&self) -> &VersionChain {
        &self.chain
    }

    /// Log index of the last applied command.
    pub fn last_applied_index(&self) -> u64 {
        self.last_applied.load(Ordering::Acquire)
    }

    /// Newest timestamp whose commands have fully applied.
    pub fn visible_timestamp(&self) -> HybridTimestamp {
        HybridTimestamp::from_u64(self.visible_ts.load(Ordering::Acquire))
    }

    pub fn is_quarantined(&self) -> bool {
        self.quarantined.load(Ordering::Acquire)
    }

    fn check_healthy(&self) -> Result<()> {
        if self.is_quarantined() {
            return Err(BasaltError::PartitionQuarantined(self.partition));
        }
        Ok(())
    }

    /// Quarantines the partition on fatal errors.
    fn observe<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_fatal() && !self.quarantined.swap(true, Ordering::AcqRel) {
                tracing::error!(partition = self.partition, error = %e, "partition quarantined");
            }
        }
        result
    }

    fn read_meta(&self) -> Result<StorageMeta> {
        StorageMeta::read_from(&self.store.read(self.meta_page)?, self.meta_page)
    }

    fn write_meta(&self, meta: &StorageMeta) -> Result<()> {
        meta.write_to(&mut self.store.write(self.meta_page)?);
        Ok(())
    }

    fn read_ts(&self, timestamp: HybridTimestamp) -> HybridTimestamp {
        timestamp.min(self.visible_timestamp())
    }

    // =========================================================================
    // Schemas
    // =========================================================================

    /// Current schema version.
    pub fn schema(&self) -> Arc<SchemaDescriptor> {
        self.schemas.read().current.clone()
    }

    /// Schema a row was written with.
    pub fn schema_for(&self, version: u16) -> Result<Arc<SchemaDescriptor>> {
        self.schemas
            .read()
            .versions
            .get(&version)
            .cloned()
            .ok_or_else(|| BasaltError::InvalidParameter {
                name: "schema_version".to_string(),
                value: version.to_string(),
            })
    }

    /// Adds a schema version. Key columns can not change.
    ///
    /// Any version not yet known is accepted, older ones included, so a
    /// replica can learn the versions its rows were written with in any
    /// order. Registering a known version again is a no-op unless its
    /// columns differ.
    pub fn register_schema(&self, schema: SchemaDescriptor) -> Result<()> {
        let _writer = self.writer.lock();
        self.check_healthy()?;
        let _guard = self.store.mutation_guard();
        let result = self.add_schema(schema);
        self.observe(result)
    }

    fn add_schema(&self, schema: SchemaDescriptor) -> Result<()> {
        let mut versions = self.schemas.write();
        if !versions.admit(&schema)? {
            return Ok(());
        }
        schemas::write_schema(&self.schema_meta, self.store.page_size(), &schema)?;
        tracing::debug!(partition = self.partition, version = schema.version(), "registered schema");
        versions.insert(Arc::new(schema));
        Ok(())
    }

    /// All known schema versions, oldest first.
    pub fn schemas(&self) -> Vec<SchemaDescriptor> {
        self.schemas.read().versions.values().map(|s| (**s).clone()).collect()
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Applies a replicated write command.
    pub fn apply_command(&self, envelope: &CommandEnvelope) -> Result<CommandOutcome> {
        let _writer = self.writer.lock();
        self.check_healthy()?;
        if envelope.index <= self.last_applied_index() {
            tracing::debug!(
                partition = self.partition,
                index = envelope.index,
                "command already applied"
            );
            return Ok(CommandOutcome::AlreadyApplied);
        }

        let _guard = self.store.mutation_guard();
        let result = self.execute(envelope);
        if let Err(e) = &result {
            tracing::debug!(
                partition = self.partition,
                index = envelope.index,
                tx = %envelope.command.tx_id(),
                command = envelope.command.name(),
                error = %e,
                "command failed"
            );
        }
        self.observe(result)
    }

    fn execute(&self, envelope: &CommandEnvelope) -> Result<CommandOutcome> {
        let mut meta = self.read_meta()?;
        if meta.index_rebuild_pending {
            self.rebuild_indexes_locked()?;
            meta = self.read_meta()?;
        }

        let timestamp = envelope.timestamp;
        let indexes: Vec<_> = self.indexes.read().values().cloned().collect();
        let (writes, outcome) = match &envelope.command {
            WriteCommand::Upsert { row, .. } => {
                let write = self.plan_upsert(row, timestamp, &indexes)?;
                self.check_unique(std::slice::from_ref(&write))?;
                let previous = write.current.clone();
                (vec![write], CommandOutcome::Upserted { previous })
            }
            WriteCommand::UpsertAll { rows, .. } => {
                // Last row wins for a repeated key
                let mut positions = HashMap::new();
                let mut writes: Vec<PlannedWrite> = Vec::with_capacity(rows.len());
                for row in rows {
                    let write = self.plan_upsert(row, timestamp, &indexes)?;
                    match positions.get(&write.key) {
                        Some(&i) => writes[i] = write,
                        None => {
                            positions.insert(write.key.clone(), writes.len());
                            writes.push(write);
                        }
                    }
                }
                self.check_unique(&writes)?;
                (writes, CommandOutcome::UpsertedAll { count: rows.len() })
            }
            WriteCommand::Delete { key, .. } => {
                let current = self.current_row(key, timestamp)?;
                match current {
                    Some(current) => {
                        let write = self.plan_delete(key.to_vec(), current, &indexes)?;
                        let previous = write.current.clone();
                        (vec![write], CommandOutcome::Deleted { previous })
                    }
                    None => (Vec::new(), CommandOutcome::Deleted { previous: None }),
                }
            }
            WriteCommand::DeleteExact { row, .. } => {
                let key = self.checked_key(row)?;
                match self.current_row(&key, timestamp)? {
                    Some(current) if current == *row => {
                        let write = self.plan_delete(key, current, &indexes)?;
                        let previous = write.current.clone();
                        (vec![write], CommandOutcome::Deleted { previous })
                    }
                    _ => (Vec::new(), CommandOutcome::NotMatched),
                }
            }
        };

        if !writes.is_empty() {
            meta.index_rebuild_pending = true;
            self.write_meta(&meta)?;

            for write in &writes {
                self.chain
                    .add_version(&write.key, timestamp, write.row.as_ref().map(BinaryRow::as_bytes))?;
            }
            for write in &writes {
                for change in &write.changes {
                    if let Some(old) = &change.old {
                        change.index.remove(old, &write.key)?;
                    }
                    if let Some(new) = &change.new {
                        change.index.insert(new, &write.key)?;
                    }
                }
            }
        }

        meta.index_rebuild_pending = false;
        meta.last_applied_index = envelope.index;
        meta.last_applied_ts = meta.last_applied_ts.max(timestamp);
        self.write_meta(&meta)?;
        self.last_applied.store(envelope.index, Ordering::Release);
        self.visible_ts.fetch_max(timestamp.as_u64(), Ordering::AcqRel);

        tracing::debug!(
            partition = self.partition,
            index = envelope.index,
            tx = %envelope.command.tx_id(),
            command = envelope.command.name(),
            rows = writes.len(),
            "applied command"
        );
        Ok(outcome)
    }

    /// Row visible at a command timestamp, checking the timestamp against
    /// the chain head.
    fn current_row(&self, key: &[u8], timestamp: HybridTimestamp) -> Result<Option<BinaryRow>> {
        self.chain.check_key(key)?;
        match self.chain.head(key)? {
            Some(head) if head.timestamp > timestamp => Err(BasaltError::StaleTimestamp {
                timestamp: timestamp.as_u64(),
                head: head.timestamp.as_u64(),
            }),
            Some(head) => head.value.map(BinaryRow::from_bytes).transpose(),
            None => Ok(None),
        }
    }

    /// Validates a command row against its schema and returns its key.
    fn checked_key(&self, row: &BinaryRow) -> Result<Vec<u8>> {
        let schema = self.schema_for(row.schema_version())?;
        row.validate(&schema)?;
        row.key_bytes(&schema)
    }

    fn tuple_of(&self, index: &SecondaryIndex, row: &BinaryRow) -> Result<Vec<u8>> {
        index.tuple_of(&*self.schema_for(row.schema_version())?, row)
    }

    fn plan_upsert(
        &self,
        row: &BinaryRow,
        timestamp: HybridTimestamp,
        indexes: &[Arc<SecondaryIndex>],
    ) -> Result<PlannedWrite> {
        let key = self.checked_key(row)?;
        let current = self.current_row(&key, timestamp)?;

        let mut changes = Vec::with_capacity(indexes.len());
        for index in indexes {
            let new = self.tuple_of(index, row)?;
            index.check_entry(&new, &key)?;
            let old = current.as_ref().map(|c| self.tuple_of(index, c)).transpose()?;
            if old.as_ref() != Some(&new) {
                changes.push(IndexChange {
                    index: index.clone(),
                    old,
                    new: Some(new),
                });
            }
        }
        Ok(PlannedWrite {
            key,
            row: Some(row.clone()),
            current,
            changes,
        })
    }

    fn plan_delete(&self, key: Vec<u8>, current: BinaryRow, indexes: &[Arc<SecondaryIndex>]) -> Result<PlannedWrite> {
        let changes = indexes
            .iter()
            .map(|index| {
                Ok(IndexChange {
                    index: index.clone(),
                    old: Some(self.tuple_of(index, &current)?),
                    new: None,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(PlannedWrite {
            key,
            row: None,
            current: Some(current),
            changes,
        })
    }

    /// Rejects writes that would give two live rows the same non-null tuple
    /// in a unique index, against the index and within the batch.
    fn check_unique(&self, writes: &[PlannedWrite]) -> Result<()> {
        // Rows of the batch whose entry in an index is being replaced
        let moving: HashSet<(u32, &[u8])> = writes
            .iter()
            .flat_map(|w| w.changes.iter().map(move |c| (c.index.descriptor().id, w.key.as_slice())))
            .collect();

        let mut claimed: HashMap<(u32, &[u8]), &[u8]> = HashMap::new();
        for write in writes {
            let Some(row) = &write.row else { continue };
            let schema = self.schema_for(row.schema_version())?;
            for change in &write.changes {
                let descriptor = change.index.descriptor();
                let Some(tuple) = &change.new else { continue };
                if !descriptor.unique || change.index.has_null(&schema, tuple)? {
                    continue;
                }
                let conflict = change.index.row_keys_of(tuple)?.iter().any(|other| {
                    other.as_ref() != write.key.as_slice() && !moving.contains(&(descriptor.id, other.as_ref()))
                });
                let batch_conflict = claimed
                    .insert((descriptor.id, tuple.as_slice()), write.key.as_slice())
                    .is_some_and(|other| other != write.key.as_slice());
                if conflict || batch_conflict {
                    return Err(BasaltError::UniqueViolation(descriptor.name.clone()));
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Reads a row as of a timestamp.
    pub fn read_at(&self, key: &[u8], timestamp: HybridTimestamp) -> Result<ReadResult> {
        self.check_healthy()?;
        self.observe(self.chain.read_at(key, self.read_ts(timestamp)))
    }

    /// Returns the row visible at a timestamp.
    pub fn get(&self, key: &[u8], timestamp: HybridTimestamp) -> Result<Option<BinaryRow>> {
        self.read_at(key, timestamp)?
            .into_value()
            .map(BinaryRow::from_bytes)
            .transpose()
    }

    /// Lazily iterates all rows visible at a timestamp, in key order.
    pub fn scan(&self, timestamp: HybridTimestamp) -> Result<RowScan<'_>> {
        self.check_healthy()?;
        Ok(RowScan {
            storage: self,
            rows: self.chain.scan_at(self.read_ts(timestamp)),
        })
    }

    /// Open index by id.
    pub fn index(&self, index_id: u32) -> Result<Arc<SecondaryIndex>> {
        self.indexes
            .read()
            .get(&index_id)
            .cloned()
            .ok_or_else(|| BasaltError::IndexNotFound(index_id.to_string()))
    }

    /// Descriptors of all indexes.
    pub fn indexes(&self) -> Vec<IndexDescriptor> {
        self.indexes
            .read()
            .values()
            .map(|index| index.descriptor().clone())
            .collect()
    }

    /// Rows whose indexed columns equal `values` at a timestamp, through a
    /// hash index.
    pub fn lookup_hash(&self, index_id: u32, values: &[Value], timestamp: HybridTimestamp) -> Result<IndexScan<'_>> {
        self.check_healthy()?;
        let index = self.index(index_id)?;
        let descriptor = index.descriptor();
        if descriptor.kind != IndexKind::Hash {
            return Err(BasaltError::InvalidParameter {
                name: "index".to_string(),
                value: format!("{} is not a hash index", descriptor.name),
            });
        }
        if values.len() != descriptor.columns.len() {
            return Err(BasaltError::OutOfBounds {
                index: values.len(),
                count: descriptor.columns.len(),
            });
        }
        let tuple = index.encode_search(&self.schema(), values)?;
        let bounds = ScanBounds::prefix(HashIndexEntry::lookup_prefix(&tuple));
        Ok(IndexScan {
            storage: self,
            entries: IndexEntries::new(index.clone(), bounds),
            index,
            expected: Some(tuple),
            timestamp: self.read_ts(timestamp),
        })
    }

    /// Rows in a range of a sorted index at a timestamp, in index order.
    ///
    /// Bounds may give fewer values than the index has columns; an
    /// included bound then takes every tuple starting with those values.
    pub fn scan_sorted(
        &self,
        index_id: u32,
        lower: Bound<&[Value]>,
        upper: Bound<&[Value]>,
        timestamp: HybridTimestamp,
    ) -> Result<IndexScan<'_>> {
        self.check_healthy()?;
        let index = self.index(index_id)?;
        if !matches!(index.descriptor().kind, IndexKind::Sorted(_)) {
            return Err(BasaltError::InvalidParameter {
                name: "index".to_string(),
                value: format!("{} is not a sorted index", index.descriptor().name),
            });
        }
        let schema = self.schema();
        let encode = |bound: Bound<&[Value]>| -> Result<Bound<Vec<u8>>> {
            Ok(match bound {
                Bound::Included(values) => Bound::Included(index.encode_search(&schema, values)?),
                Bound::Excluded(values) => Bound::Excluded(index.encode_search(&schema, values)?),
                Bound::Unbounded => Bound::Unbounded,
            })
        };
        let bounds = ScanBounds::range(encode(lower)?, encode(upper)?);
        Ok(IndexScan {
            storage: self,
            entries: IndexEntries::new(index.clone(), bounds),
            index,
            expected: None,
            timestamp: self.read_ts(timestamp),
        })
    }

    // =========================================================================
    // Indexes
    // =========================================================================

    /// Registers a new index and builds it from the current rows.
    pub fn create_index(&self, descriptor: IndexDescriptor) -> Result<()> {
        let _writer = self.writer.lock();
        self.check_healthy()?;
        let _guard = self.store.mutation_guard();

        {
            let indexes = self.indexes.read();
            if indexes.contains_key(&descriptor.id) {
                return Err(BasaltError::IndexExists(descriptor.id.to_string()));
            }
            if indexes
                .values()
                .any(|index| index.descriptor().name.eq_ignore_ascii_case(&descriptor.name))
            {
                return Err(BasaltError::IndexExists(descriptor.name.clone()));
            }
        }
        descriptor.projection(&self.schema())?;

        let index = self.observe(SecondaryIndex::create(self.store.clone(), self.partition, descriptor.clone()))?;
        let built = self.build_index(&index, descriptor.unique).and_then(|rows| {
            self.index_meta.insert(&IndexMetaEntry {
                index_id: descriptor.id,
                meta_page: index.meta_page().page_idx,
                descriptor: descriptor.to_bytes(),
            })?;
            Ok(rows)
        });
        let rows = match built {
            Ok(rows) => rows,
            Err(e) => {
                if let Err(destroy) = index.destroy() {
                    tracing::warn!(partition = self.partition, error = %destroy, "failed to drop partial index");
                }
                return self.observe(Err(e));
            }
        };

        tracing::info!(partition = self.partition, index = %descriptor.name, rows, "created index");
        self.indexes.write().insert(descriptor.id, Arc::new(index));
        Ok(())
    }

    /// Inserts the entries of every live row. Returns the row count.
    fn build_index(&self, index: &SecondaryIndex, check_unique: bool) -> Result<usize> {
        let mut rows = 0;
        for item in self.chain.scan_at(HybridTimestamp::MAX) {
            let (key, value) = item?;
            let row = BinaryRow::from_bytes(value)?;
            let schema = self.schema_for(row.schema_version())?;
            let tuple = index.tuple_of(&schema, &row)?;
            index.check_entry(&tuple, &key)?;
            if check_unique && !index.has_null(&schema, &tuple)? && !index.row_keys_of(&tuple)?.is_empty() {
                return Err(BasaltError::UniqueViolation(index.descriptor().name.clone()));
            }
            index.insert(&tuple, &key)?;
            rows += 1;
        }
        Ok(rows)
    }

    /// Rebuilds every index from the newest row versions.
    pub fn rebuild_indexes(&self) -> Result<()> {
        let _writer = self.writer.lock();
        self.check_healthy()?;
        let _guard = self.store.mutation_guard();
        let result = self.rebuild_indexes_locked();
        self.observe(result)
    }

    fn rebuild_indexes_locked(&self) -> Result<()> {
        let mut meta = self.read_meta()?;
        meta.index_rebuild_pending = true;
        self.write_meta(&meta)?;

        let indexes: Vec<_> = self.indexes.read().values().cloned().collect();
        for index in indexes {
            let removed = index.clear()?;
            let rows = self.build_index(&index, false)?;
            tracing::info!(
                partition = self.partition,
                index = %index.descriptor().name,
                removed,
                rows,
                "rebuilt index"
            );
        }

        meta.index_rebuild_pending = false;
        self.write_meta(&meta)
    }

    // =========================================================================
    // Garbage collection
    // =========================================================================

    /// Drops versions no reader at or above `watermark` can see.
    pub fn gc(&self, watermark: HybridTimestamp) -> Result<GcStats> {
        let _writer = self.writer.lock();
        self.check_healthy()?;
        let _guard = self.store.mutation_guard();
        let result = self.chain.gc(watermark);
        self.observe(result)
    }
}

/// Rows visible at one timestamp, in row key order.
pub struct RowScan<'a> {
    storage: &'a MvPartitionStorage,
    rows: VisibleRows<'a>,
}

impl RowScan<'_> {
    pub fn rewind(&mut self) {
        self.rows.rewind();
    }
}

impl Iterator for RowScan<'_> {
    type Item = Result<BinaryRow>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.rows.next()?;
        Some(
            self.storage
                .observe(item)
                .and_then(|(_, value): (Bytes, Bytes)| BinaryRow::from_bytes(value)),
        )
    }
}

/// Rows found through a secondary index.
///
/// Each entry is checked against the row visible at the scan timestamp;
/// entries whose row no longer carries the indexed tuple are skipped.
pub struct IndexScan<'a> {
    storage: &'a MvPartitionStorage,
    entries: IndexEntries,
    index: Arc<SecondaryIndex>,
    /// Exact tuple of a point lookup.
    expected: Option<Vec<u8>>,
    timestamp: HybridTimestamp,
}

impl IndexScan<'_> {
    pub fn rewind(&mut self) {
        self.entries.rewind();
    }

    fn resolve(&self, tuple: &[u8], row_key: &[u8]) -> Result<Option<BinaryRow>> {
        if self.expected.as_deref().is_some_and(|expected| expected != tuple) {
            return Ok(None);
        }
        let Some(value) = self.storage.chain.read_at(row_key, self.timestamp)?.into_value() else {
            return Ok(None);
        };
        let row = BinaryRow::from_bytes(value)?;
        let matches = self.storage.tuple_of(&self.index, &row)? == tuple;
        Ok(matches.then_some(row))
    }
}

impl Iterator for IndexScan<'_> {
    type Item = Result<BinaryRow>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let resolved = self
                .entries
                .next()?
                .and_then(|(tuple, row_key)| self.resolve(&tuple, &row_key));
            match self.storage.observe(resolved) {
                Ok(Some(row)) => return Some(Ok(row)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
