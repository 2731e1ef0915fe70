//! Error types for the Basalt store.

use thiserror::Error;

/// Result type alias using BasaltError.
pub type Result<T> = std::result::Result<T, BasaltError>;

/// Errors that can occur in Basalt operations.
#[derive(Debug, Error)]
pub enum BasaltError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage I/O error: {0}")]
    StorageIo(String),

    // Page store errors
    #[error("Out of page memory: {used} of {capacity} frames in use")]
    OutOfMemory { used: usize, capacity: usize },

    #[error("Page not found: {page_id}")]
    PageNotFound { page_id: u64 },

    #[error("Page corrupted: {page_id}, reason: {reason}")]
    PageCorrupted { page_id: u64, reason: String },

    #[error("Page size mismatch: expected {expected}, got {actual}")]
    PageSizeMismatch { expected: usize, actual: usize },

    #[error("Unsupported page format version {found} (supported {supported})")]
    UnsupportedFormat { found: u32, supported: u32 },

    // B+ tree errors
    #[error("B+ tree corrupted at page {page_id}: {reason}")]
    CorruptedTree { page_id: u64, reason: String },

    #[error("Key too large: {size} bytes (max {max})")]
    KeyTooLarge { size: usize, max: usize },

    // Codec errors
    #[error("Column not found: {0}")]
    ColumnNotFound(String),

    #[error("Element index {index} out of bounds (count {count})")]
    OutOfBounds { index: usize, count: usize },

    #[error("Type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    #[error("Null value not allowed")]
    NullNotAllowed,

    #[error("Malformed tuple: {0}")]
    MalformedTuple(String),

    // Version chain errors
    #[error("Stale timestamp {timestamp}, chain head is at {head}")]
    StaleTimestamp { timestamp: u64, head: u64 },

    // Partition errors
    #[error("Partition {0} is quarantined")]
    PartitionQuarantined(u32),

    #[error("Index not found: {0}")]
    IndexNotFound(String),

    #[error("Index already exists: {0}")]
    IndexExists(String),

    #[error("Duplicate key in unique index {0}")]
    UniqueViolation(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter { name: String, value: String },

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BasaltError {
    /// Builds a tree corruption error for the given packed page id.
    pub fn corrupted_tree(page_id: u64, reason: impl Into<String>) -> Self {
        BasaltError::CorruptedTree {
            page_id,
            reason: reason.into(),
        }
    }

    /// Returns true for faults that leave a partition unusable until it is
    /// restored from a healthy replica.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BasaltError::Io(_)
                | BasaltError::StorageIo(_)
                | BasaltError::PageCorrupted { .. }
                | BasaltError::CorruptedTree { .. }
                | BasaltError::UnsupportedFormat { .. }
                | BasaltError::PageSizeMismatch { .. }
                | BasaltError::Internal(_)
        )
    }

    /// Returns true when retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BasaltError::OutOfMemory { .. })
    }

    /// Returns true when the error was caused by the arguments of the call.
    /// Such errors never leave partial state behind.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            BasaltError::ColumnNotFound(_)
                | BasaltError::OutOfBounds { .. }
                | BasaltError::TypeMismatch { .. }
                | BasaltError::NullNotAllowed
                | BasaltError::MalformedTuple(_)
                | BasaltError::KeyTooLarge { .. }
                | BasaltError::StaleTimestamp { .. }
                | BasaltError::IndexNotFound(_)
                | BasaltError::IndexExists(_)
                | BasaltError::UniqueViolation(_)
                | BasaltError::InvalidParameter { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn test_io_error_conversion() {
        let io_err = IoError::new(ErrorKind::NotFound, "file not found");
        let err: BasaltError = io_err.into();
        assert!(matches!(err, BasaltError::Io(_)));
        assert!(err.to_string().contains("I/O error"));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_out_of_memory_display() {
        let err = BasaltError::OutOfMemory {
            used: 64,
            capacity: 64,
        };
        assert_eq!(err.to_string(), "Out of page memory: 64 of 64 frames in use");
        assert!(err.is_retryable());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_page_corrupted_display() {
        let err = BasaltError::PageCorrupted {
            page_id: 100,
            reason: "invalid checksum".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Page corrupted: 100, reason: invalid checksum"
        );
    }

    #[test]
    fn test_corrupted_tree_is_fatal() {
        let err = BasaltError::corrupted_tree(7, "unexpected page type 4");
        assert_eq!(
            err.to_string(),
            "B+ tree corrupted at page 7: unexpected page type 4"
        );
        assert!(err.is_fatal());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_codec_errors_are_caller_errors() {
        let err = BasaltError::OutOfBounds { index: 5, count: 2 };
        assert_eq!(err.to_string(), "Element index 5 out of bounds (count 2)");
        assert!(err.is_caller_error());

        let err = BasaltError::ColumnNotFound("email".to_string());
        assert_eq!(err.to_string(), "Column not found: email");
        assert!(err.is_caller_error());
        assert!(!err.is_fatal());

        let err = BasaltError::MalformedTuple("truncated element".to_string());
        assert_eq!(err.to_string(), "Malformed tuple: truncated element");
        assert!(err.is_caller_error());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_stale_timestamp_display() {
        let err = BasaltError::StaleTimestamp {
            timestamp: 10,
            head: 20,
        };
        assert_eq!(err.to_string(), "Stale timestamp 10, chain head is at 20");
    }

    #[test]
    fn test_quarantine_display() {
        let err = BasaltError::PartitionQuarantined(3);
        assert_eq!(err.to_string(), "Partition 3 is quarantined");
        assert!(!err.is_caller_error());
    }

    #[test]
    fn test_unique_violation_is_caller_error() {
        let err = BasaltError::UniqueViolation("users_email".to_string());
        assert_eq!(err.to_string(), "Duplicate key in unique index users_email");
        assert!(err.is_caller_error());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_config_errors_display() {
        let err = BasaltError::ConfigError("page size must be a power of two".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: page size must be a power of two"
        );

        let err = BasaltError::InvalidParameter {
            name: "page_size".to_string(),
            value: "3000".to_string(),
        };
        assert_eq!(err.to_string(), "Invalid parameter: page_size = 3000");
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<BasaltError>();
    }
}
