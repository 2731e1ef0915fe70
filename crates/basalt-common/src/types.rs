//! Column type identifiers.

use serde::{Deserialize, Serialize};

/// Base type of a column as carried in schema descriptors.
///
/// Only the base type is kept per element. Precision and length limits are
/// enforced by the catalog and never reach the encoded form; decimals keep
/// their scale separately because it is needed to rebuild the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ColumnType {
    Boolean = 1,

    // Integer types
    Int8 = 10,
    Int16 = 11,
    Int32 = 12,
    Int64 = 13,

    // Floating point types
    Float32 = 30,
    Float64 = 31,

    // Fixed-precision decimal
    Decimal = 40,

    String = 50,
    Bytes = 60,

    // Date/Time types (days, nanoseconds of day, microseconds since epoch)
    Date = 70,
    Time = 71,
    Timestamp = 72,

    Uuid = 80,
}

impl ColumnType {
    /// Returns the fixed encoded payload size, or None for variable-length types.
    pub fn fixed_size(&self) -> Option<usize> {
        match self {
            ColumnType::Boolean | ColumnType::Int8 => Some(1),
            ColumnType::Int16 => Some(2),
            ColumnType::Int32 | ColumnType::Float32 | ColumnType::Date => Some(4),
            ColumnType::Int64 | ColumnType::Float64 => Some(8),
            ColumnType::Time | ColumnType::Timestamp => Some(8),
            ColumnType::Decimal | ColumnType::Uuid => Some(16),
            ColumnType::String | ColumnType::Bytes => None,
        }
    }

    /// Returns true if this type has a fixed byte size.
    pub fn is_fixed_size(&self) -> bool {
        self.fixed_size().is_some()
    }

    /// Returns true if values of this type carry a scale.
    pub fn has_scale(&self) -> bool {
        matches!(self, ColumnType::Decimal)
    }

    /// Decodes a type tag.
    pub fn from_u8(tag: u8) -> Option<Self> {
        Some(match tag {
            1 => ColumnType::Boolean,
            10 => ColumnType::Int8,
            11 => ColumnType::Int16,
            12 => ColumnType::Int32,
            13 => ColumnType::Int64,
            30 => ColumnType::Float32,
            31 => ColumnType::Float64,
            40 => ColumnType::Decimal,
            50 => ColumnType::String,
            60 => ColumnType::Bytes,
            70 => ColumnType::Date,
            71 => ColumnType::Time,
            72 => ColumnType::Timestamp,
            80 => ColumnType::Uuid,
            _ => return None,
        })
    }
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Int8 => "INT8",
            ColumnType::Int16 => "INT16",
            ColumnType::Int32 => "INT32",
            ColumnType::Int64 => "INT64",
            ColumnType::Float32 => "FLOAT32",
            ColumnType::Float64 => "FLOAT64",
            ColumnType::Decimal => "DECIMAL",
            ColumnType::String => "STRING",
            ColumnType::Bytes => "BYTES",
            ColumnType::Date => "DATE",
            ColumnType::Time => "TIME",
            ColumnType::Timestamp => "TIMESTAMP",
            ColumnType::Uuid => "UUID",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [ColumnType; 14] = [
        ColumnType::Boolean,
        ColumnType::Int8,
        ColumnType::Int16,
        ColumnType::Int32,
        ColumnType::Int64,
        ColumnType::Float32,
        ColumnType::Float64,
        ColumnType::Decimal,
        ColumnType::String,
        ColumnType::Bytes,
        ColumnType::Date,
        ColumnType::Time,
        ColumnType::Timestamp,
        ColumnType::Uuid,
    ];

    #[test]
    fn test_tag_roundtrip() {
        for ty in ALL {
            assert_eq!(ColumnType::from_u8(ty as u8), Some(ty));
        }
        assert_eq!(ColumnType::from_u8(0), None);
        assert_eq!(ColumnType::from_u8(255), None);
    }

    #[test]
    fn test_fixed_sizes() {
        assert_eq!(ColumnType::Int64.fixed_size(), Some(8));
        assert_eq!(ColumnType::Decimal.fixed_size(), Some(16));
        assert_eq!(ColumnType::String.fixed_size(), None);
        assert!(!ColumnType::Bytes.is_fixed_size());
        assert!(ColumnType::Uuid.is_fixed_size());
    }

    #[test]
    fn test_only_decimal_has_scale() {
        for ty in ALL {
            assert_eq!(ty.has_scale(), ty == ColumnType::Decimal);
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(ColumnType::Int64.to_string(), "INT64");
        assert_eq!(ColumnType::String.to_string(), "STRING");
    }
}
