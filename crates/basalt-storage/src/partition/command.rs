//! Write commands applied to a partition.

use crate::tuple::BinaryRow;
use basalt_common::HybridTimestamp;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Transaction identifier assigned by the replication layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct TxId(pub u64);

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

/// A row mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteCommand {
    /// Inserts or replaces a row.
    Upsert { row: BinaryRow, tx: TxId },
    /// Upserts a batch of rows at one timestamp. A key repeated in the batch
    /// takes its last row.
    UpsertAll { rows: Vec<BinaryRow>, tx: TxId },
    /// Deletes the row with an encoded key.
    Delete { key: Bytes, tx: TxId },
    /// Deletes a row only if its current bytes equal `row`.
    DeleteExact { row: BinaryRow, tx: TxId },
}

impl WriteCommand {
    pub fn tx_id(&self) -> TxId {
        match self {
            WriteCommand::Upsert { tx, .. }
            | WriteCommand::UpsertAll { tx, .. }
            | WriteCommand::Delete { tx, .. }
            | WriteCommand::DeleteExact { tx, .. } => *tx,
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            WriteCommand::Upsert { .. } => "upsert",
            WriteCommand::UpsertAll { .. } => "upsert-all",
            WriteCommand::Delete { .. } => "delete",
            WriteCommand::DeleteExact { .. } => "delete-exact",
        }
    }
}

/// A command as delivered by the replication log.
///
/// Log indexes start at 1 and increase by command. The timestamp is the
/// commit timestamp every version written by the command carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandEnvelope {
    pub index: u64,
    pub timestamp: HybridTimestamp,
    pub command: WriteCommand,
}

impl CommandEnvelope {
    pub fn new(index: u64, timestamp: HybridTimestamp, command: WriteCommand) -> Self {
        Self {
            index,
            timestamp,
            command,
        }
    }
}

/// Result of applying a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// The row was written. `previous` is the row it replaced.
    Upserted { previous: Option<BinaryRow> },
    /// All rows of the batch were written.
    UpsertedAll { count: usize },
    /// The row is gone. `previous` is the row that was deleted, None when
    /// there was nothing to delete.
    Deleted { previous: Option<BinaryRow> },
    /// The current row differed from the expected one. Nothing was written.
    NotMatched,
    /// The command's log index was applied before. Nothing was written.
    AlreadyApplied,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_metadata() {
        let command = WriteCommand::Delete {
            key: Bytes::from_static(b"\x01k"),
            tx: TxId(9),
        };
        assert_eq!(command.tx_id(), TxId(9));
        assert_eq!(command.name(), "delete");
        assert_eq!(TxId(9).to_string(), "tx-9");

        let batch = WriteCommand::UpsertAll {
            rows: Vec::new(),
            tx: TxId(3),
        };
        assert_eq!(batch.tx_id(), TxId(3));
        assert_eq!(batch.name(), "upsert-all");
    }
}
