//! Binary rows.

use super::codec::{encode, TupleReader};
use super::schema::{BinaryTupleSchema, SchemaDescriptor};
use super::value::Value;
use basalt_common::{BasaltError, Result};
use bytes::{BufMut, Bytes, BytesMut};

/// A full row: the schema version it was written with, then the row tuple.
///
/// Layout:
/// - schema_version: 2 bytes (little-endian)
/// - tuple: all columns of that schema version, key columns first
///
/// The key columns come first in the tuple, so the encoded row key is a
/// prefix of the tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BinaryRow {
    bytes: Bytes,
}

impl BinaryRow {
    /// Size of the row header in bytes.
    pub const HEADER_SIZE: usize = 2;

    /// Encodes a row from one value per column.
    pub fn encode(schema: &SchemaDescriptor, values: &[Value]) -> Result<Self> {
        let tuple = encode(&schema.row_schema(), values)?;
        let mut buf = BytesMut::with_capacity(Self::HEADER_SIZE + tuple.len());
        buf.put_u16_le(schema.version());
        buf.put_slice(&tuple);
        Ok(Self {
            bytes: buf.freeze(),
        })
    }

    /// Wraps stored row bytes.
    pub fn from_bytes(bytes: Bytes) -> Result<Self> {
        if bytes.len() < Self::HEADER_SIZE {
            return Err(BasaltError::Internal(format!(
                "row of {} bytes has no header",
                bytes.len()
            )));
        }
        Ok(Self { bytes })
    }

    /// Returns the schema version the row was written with.
    pub fn schema_version(&self) -> u16 {
        u16::from_le_bytes([self.bytes[0], self.bytes[1]])
    }

    /// Returns the encoded row, header included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Returns the encoded row as shared bytes.
    pub fn to_bytes(&self) -> Bytes {
        self.bytes.clone()
    }

    /// Returns the row tuple.
    pub fn tuple(&self) -> &[u8] {
        &self.bytes[Self::HEADER_SIZE..]
    }

    fn check_version(&self, schema: &SchemaDescriptor) -> Result<()> {
        if self.schema_version() != schema.version() {
            return Err(BasaltError::TypeMismatch {
                expected: format!("row of schema version {}", schema.version()),
                actual: format!("schema version {}", self.schema_version()),
            });
        }
        Ok(())
    }

    /// Checks that the row is a complete tuple of `schema`.
    ///
    /// Rows arriving in commands are checked before anything is stored, so
    /// damaged input fails with `MalformedTuple` instead of surfacing later as
    /// a decode fault in stored data.
    pub fn validate(&self, schema: &SchemaDescriptor) -> Result<()> {
        self.check_version(schema)?;
        let row_schema = schema.row_schema();
        let mut reader = TupleReader::new(&row_schema, self.tuple());
        let checked = reader.values().and_then(|_| reader.encoded_len());
        match checked {
            Ok(len) if len == self.tuple().len() => Ok(()),
            Ok(len) => Err(BasaltError::MalformedTuple(format!(
                "{} trailing bytes after {} columns",
                self.tuple().len() - len,
                row_schema.element_count()
            ))),
            Err(e) if e.is_caller_error() => Err(e),
            Err(e) => Err(BasaltError::MalformedTuple(e.to_string())),
        }
    }

    /// Decodes one column.
    pub fn value(&self, schema: &SchemaDescriptor, column: usize) -> Result<Value> {
        self.check_version(schema)?;
        let row_schema = schema.row_schema();
        TupleReader::new(&row_schema, self.tuple()).value(column)
    }

    /// Decodes one column by name.
    pub fn value_by_name(&self, schema: &SchemaDescriptor, name: &str) -> Result<Value> {
        let column = schema
            .column_index(name)
            .ok_or_else(|| BasaltError::ColumnNotFound(name.to_string()))?;
        self.value(schema, column)
    }

    /// Decodes every column.
    pub fn values(&self, schema: &SchemaDescriptor) -> Result<Vec<Value>> {
        self.check_version(schema)?;
        let row_schema = schema.row_schema();
        TupleReader::new(&row_schema, self.tuple()).values()
    }

    /// Returns the encoded row key.
    pub fn key_bytes(&self, schema: &SchemaDescriptor) -> Result<Vec<u8>> {
        self.check_version(schema)?;
        let row_schema = schema.row_schema();
        let mut reader = TupleReader::new(&row_schema, self.tuple());
        let end = reader.element_range(schema.key_columns() - 1)?.end;
        Ok(self.tuple()[..end].to_vec())
    }

    /// Encodes the columns of a projection, applying its collations.
    pub fn project(&self, schema: &SchemaDescriptor, projection: &BinaryTupleSchema) -> Result<Vec<u8>> {
        self.check_version(schema)?;
        let row_schema = schema.row_schema();
        let mut reader = TupleReader::new(&row_schema, self.tuple());
        let values = (0..projection.element_count())
            .map(|i| {
                let column = projection.column_index(i).ok_or(BasaltError::OutOfBounds {
                    index: i,
                    count: projection.element_count(),
                })?;
                reader.value(column)
            })
            .collect::<Result<Vec<_>>>()?;
        encode(projection, &values)
    }
}

/// Encodes a row key from the key column values.
pub fn encode_key(schema: &SchemaDescriptor, key: &[Value]) -> Result<Vec<u8>> {
    encode(&schema.key_schema(), key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple::schema::{Collation, ColumnDescriptor};
    use basalt_common::types::ColumnType;

    fn schema() -> SchemaDescriptor {
        SchemaDescriptor::new(
            3,
            vec![
                ColumnDescriptor::new("REGION", ColumnType::String, false),
                ColumnDescriptor::new("ID", ColumnType::Int64, false),
                ColumnDescriptor::new("NAME", ColumnType::String, true),
                ColumnDescriptor::new("QTY", ColumnType::Int32, true),
            ],
            2,
        )
        .unwrap()
    }

    fn row() -> BinaryRow {
        BinaryRow::encode(
            &schema(),
            &[
                Value::from("eu"),
                Value::Int64(7),
                Value::from("Shirt"),
                Value::Int32(12),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_row_values() {
        let schema = schema();
        let row = row();
        assert_eq!(row.schema_version(), 3);
        assert_eq!(row.value(&schema, 2).unwrap(), Value::from("Shirt"));
        assert_eq!(row.value_by_name(&schema, "qty").unwrap(), Value::Int32(12));
        assert!(matches!(
            row.value_by_name(&schema, "missing"),
            Err(BasaltError::ColumnNotFound(_))
        ));
        assert_eq!(row.values(&schema).unwrap().len(), 4);
    }

    #[test]
    fn test_key_bytes_match_key_encoding() {
        let schema = schema();
        let key = encode_key(&schema, &[Value::from("eu"), Value::Int64(7)]).unwrap();
        assert_eq!(row().key_bytes(&schema).unwrap(), key);
    }

    #[test]
    fn test_projection() {
        let schema = schema();
        let projection = schema
            .projection(&[3, 2])
            .unwrap()
            .with_collations(&[Collation::DESC, Collation::ASC])
            .unwrap();
        let bytes = row().project(&schema, &projection).unwrap();
        let mut reader = TupleReader::new(&projection, &bytes);
        assert_eq!(reader.value(0).unwrap(), Value::Int32(12));
        assert_eq!(reader.value(1).unwrap(), Value::from("Shirt"));
    }

    #[test]
    fn test_schema_version_checked() {
        let other = SchemaDescriptor::new(4, schema().columns().to_vec(), 2).unwrap();
        assert!(matches!(
            row().value(&other, 0),
            Err(BasaltError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_truncated_rows() {
        let schema = schema();
        let row = row();
        row.validate(&schema).unwrap();

        let bytes = row.as_bytes();
        for len in [BinaryRow::HEADER_SIZE + 3, bytes.len() - 2] {
            let cut = BinaryRow::from_bytes(Bytes::copy_from_slice(&bytes[..len])).unwrap();
            let err = cut.validate(&schema).unwrap_err();
            assert!(matches!(err, BasaltError::MalformedTuple(_)), "len {}: {}", len, err);
            assert!(err.is_caller_error());
        }

        let mut padded = bytes.to_vec();
        padded.push(0);
        let padded = BinaryRow::from_bytes(Bytes::from(padded)).unwrap();
        assert!(matches!(
            padded.validate(&schema),
            Err(BasaltError::MalformedTuple(_))
        ));
    }

    #[test]
    fn test_from_bytes() {
        let row = row();
        let copy = BinaryRow::from_bytes(row.to_bytes()).unwrap();
        assert_eq!(copy, row);
        assert!(BinaryRow::from_bytes(Bytes::from_static(&[1])).is_err());
    }
}
