//! Partition snapshots for replica catch-up.
//!
//! A snapshot carries every retained version of every row together with the
//! schemas, the index definitions and the applied log position. Index trees
//! are not shipped; they are rebuilt from the rows on restore.

use super::{IndexDescriptor, MvPartitionStorage};
use crate::store::PageStore;
use crate::tuple::SchemaDescriptor;
use basalt_common::{BasaltError, HybridTimestamp, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// One version of a row. A missing value is a tombstone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotVersion {
    pub timestamp: HybridTimestamp,
    pub value: Option<Vec<u8>>,
}

/// A row key with its versions, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRow {
    pub key: Vec<u8>,
    pub versions: Vec<SnapshotVersion>,
}

/// Full state of one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSnapshot {
    pub partition: u32,
    pub last_applied_index: u64,
    pub last_applied_ts: HybridTimestamp,
    /// Schema versions, oldest first.
    pub schemas: Vec<SchemaDescriptor>,
    pub indexes: Vec<IndexDescriptor>,
    /// Rows in key order.
    pub rows: Vec<SnapshotRow>,
}

impl MvPartitionStorage {
    /// Captures the partition. Commands wait until the snapshot is taken.
    pub fn snapshot(&self) -> Result<PartitionSnapshot> {
        let _writer = self.writer.lock();
        self.check_healthy()?;

        let mut rows = Vec::new();
        for entry in self.chain.primary().iter() {
            let entry = self.observe(entry)?;
            let versions = self
                .chain
                .scan_chain(&entry.key)
                .map(|version| {
                    version.map(|v| SnapshotVersion {
                        timestamp: v.timestamp,
                        value: v.value.map(|value| value.to_vec()),
                    })
                })
                .collect::<Result<Vec<_>>>();
            rows.push(SnapshotRow {
                key: entry.key.to_vec(),
                versions: self.observe(versions)?,
            });
        }

        let snapshot = PartitionSnapshot {
            partition: self.partition,
            last_applied_index: self.last_applied_index(),
            last_applied_ts: self.visible_timestamp(),
            schemas: self.schemas(),
            indexes: self.indexes(),
            rows,
        };
        tracing::info!(
            partition = self.partition,
            last_applied = snapshot.last_applied_index,
            rows = snapshot.rows.len(),
            "took partition snapshot"
        );
        Ok(snapshot)
    }

    /// Replaces a partition's contents with a snapshot.
    ///
    /// Whatever the store holds for the partition is destroyed first, so any
    /// storage previously opened on it must be dropped before calling this.
    pub fn restore(store: Arc<PageStore>, snapshot: &PartitionSnapshot) -> Result<Self> {
        let partition = snapshot.partition;
        let (first, newer) = snapshot
            .schemas
            .split_first()
            .ok_or_else(|| BasaltError::InvalidParameter {
                name: "snapshot".to_string(),
                value: format!("partition {} snapshot has no schema", partition),
            })?;

        store.destroy_partition(partition)?;
        let storage = Self::open(store, partition, first.clone())?;
        for schema in newer {
            storage.register_schema(schema.clone())?;
        }

        {
            let _writer = storage.writer.lock();
            let _guard = storage.store.mutation_guard();
            for row in &snapshot.rows {
                for version in row.versions.iter().rev() {
                    storage
                        .chain
                        .add_version(&row.key, version.timestamp, version.value.as_deref())?;
                }
            }
        }

        for descriptor in &snapshot.indexes {
            storage.create_index(descriptor.clone())?;
        }

        {
            let _writer = storage.writer.lock();
            let _guard = storage.store.mutation_guard();
            let mut meta = storage.read_meta()?;
            meta.last_applied_index = snapshot.last_applied_index;
            meta.last_applied_ts = snapshot.last_applied_ts;
            storage.write_meta(&meta)?;
            storage
                .last_applied
                .store(snapshot.last_applied_index, Ordering::Release);
            storage
                .visible_ts
                .store(snapshot.last_applied_ts.as_u64(), Ordering::Release);
        }

        tracing::info!(
            partition,
            last_applied = snapshot.last_applied_index,
            rows = snapshot.rows.len(),
            indexes = snapshot.indexes.len(),
            "restored partition from snapshot"
        );
        Ok(storage)
    }
}
