//! Schema versions of a partition.
//!
//! Every version rows were written with is kept in the schema tree, so rows
//! of old versions stay decodable after a restart whichever version the
//! partition is reopened with.

use crate::btree::{BplusTree, SchemaMetaEntry, SchemaMetaTree};
use crate::tuple::SchemaDescriptor;
use basalt_common::{BasaltError, Result};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Known schema versions. The newest one is current.
pub(super) struct SchemaVersions {
    pub(super) current: Arc<SchemaDescriptor>,
    pub(super) versions: BTreeMap<u16, Arc<SchemaDescriptor>>,
}

impl SchemaVersions {
    pub(super) fn new(schema: Arc<SchemaDescriptor>) -> Self {
        Self {
            versions: BTreeMap::from([(schema.version(), schema.clone())]),
            current: schema,
        }
    }

    /// Checks a version before it is added. Returns false when the very
    /// same version is already known.
    pub(super) fn admit(&self, schema: &SchemaDescriptor) -> Result<bool> {
        if let Some(known) = self.versions.get(&schema.version()) {
            if **known == *schema {
                return Ok(false);
            }
            return Err(BasaltError::InvalidParameter {
                name: "schema_version".to_string(),
                value: format!("{} is registered with other columns", schema.version()),
            });
        }
        if !schema.same_key(&self.current) {
            return Err(BasaltError::InvalidParameter {
                name: "schema".to_string(),
                value: format!("version {} changes the key columns", schema.version()),
            });
        }
        Ok(true)
    }

    pub(super) fn insert(&mut self, schema: Arc<SchemaDescriptor>) {
        if schema.version() > self.current.version() {
            self.current = schema.clone();
        }
        self.versions.insert(schema.version(), schema);
    }
}

/// Writes a schema version into the schema tree.
pub(super) fn write_schema(tree: &BplusTree<SchemaMetaTree>, page_size: usize, schema: &SchemaDescriptor) -> Result<()> {
    let bytes = schema.to_bytes();
    let chunk_size = SchemaMetaTree::chunk_size(page_size);
    let chunks = bytes.len().div_ceil(chunk_size);
    if chunks > usize::from(u16::MAX) {
        return Err(BasaltError::InvalidParameter {
            name: "schema".to_string(),
            value: format!("version {} encodes to {} bytes", schema.version(), bytes.len()),
        });
    }
    for chunk in 0..chunks {
        let start = chunk * chunk_size;
        let end = (start + chunk_size).min(bytes.len());
        tree.insert(&SchemaMetaEntry {
            version: schema.version(),
            chunk: chunk as u16,
            bytes: bytes.slice(start..end),
        })?;
    }
    Ok(())
}

/// Reads every schema version from the schema tree, oldest first.
pub(super) fn read_schemas(tree: &BplusTree<SchemaMetaTree>) -> Result<Vec<SchemaDescriptor>> {
    let mut schemas = Vec::new();
    let mut pending: Option<(u16, Vec<u8>)> = None;
    for entry in tree.iter() {
        let entry = entry?;
        match &mut pending {
            Some((version, bytes)) if *version == entry.version => bytes.extend_from_slice(&entry.bytes),
            _ => {
                if entry.chunk != 0 {
                    return Err(BasaltError::Internal(format!(
                        "schema version {} starts at chunk {}",
                        entry.version, entry.chunk
                    )));
                }
                if let Some((_, bytes)) = pending.take() {
                    schemas.push(SchemaDescriptor::from_bytes(&bytes)?);
                }
                pending = Some((entry.version, entry.bytes.to_vec()));
            }
        }
    }
    if let Some((_, bytes)) = pending {
        schemas.push(SchemaDescriptor::from_bytes(&bytes)?);
    }
    Ok(schemas)
}
