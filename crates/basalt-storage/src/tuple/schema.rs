//! Schema descriptors and binary tuple schemas.

use basalt_common::types::ColumnType;
use basalt_common::{BasaltError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// A column as described by the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    /// Column name, matched case-insensitively.
    pub name: String,
    /// Base type.
    pub ty: ColumnType,
    /// Whether the column accepts nulls.
    pub nullable: bool,
    /// Decimal scale. Ignored for every other type.
    #[serde(default)]
    pub scale: u8,
}

impl ColumnDescriptor {
    /// Creates a column descriptor with scale 0.
    pub fn new(name: impl Into<String>, ty: ColumnType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            ty,
            nullable,
            scale: 0,
        }
    }

    /// Creates a decimal column descriptor.
    pub fn decimal(name: impl Into<String>, scale: u8, nullable: bool) -> Self {
        Self {
            name: name.into(),
            ty: ColumnType::Decimal,
            nullable,
            scale,
        }
    }
}

/// One version of a table schema.
///
/// Columns are ordered with the key columns first. A descriptor is never
/// changed after creation; schema changes produce a new version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    version: u16,
    columns: Vec<ColumnDescriptor>,
    key_columns: usize,
}

impl SchemaDescriptor {
    /// Creates a schema version.
    ///
    /// Requires at least one key column, non-nullable key columns and
    /// unique column names.
    pub fn new(version: u16, columns: Vec<ColumnDescriptor>, key_columns: usize) -> Result<Self> {
        if key_columns == 0 || key_columns > columns.len() {
            return Err(BasaltError::InvalidParameter {
                name: "key_columns".to_string(),
                value: key_columns.to_string(),
            });
        }
        if let Some(column) = columns[..key_columns].iter().find(|c| c.nullable) {
            return Err(BasaltError::InvalidParameter {
                name: "key column".to_string(),
                value: format!("{} is nullable", column.name),
            });
        }
        for (i, column) in columns.iter().enumerate() {
            if columns[..i]
                .iter()
                .any(|other| other.name.eq_ignore_ascii_case(&column.name))
            {
                return Err(BasaltError::InvalidParameter {
                    name: "column".to_string(),
                    value: format!("duplicate name {}", column.name),
                });
            }
        }
        Ok(Self {
            version,
            columns,
            key_columns,
        })
    }

    /// Returns the schema version.
    pub fn version(&self) -> u16 {
        self.version
    }

    /// Returns all columns, key columns first.
    pub fn columns(&self) -> &[ColumnDescriptor] {
        &self.columns
    }

    /// Returns the number of columns.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Returns true if the schema has no columns. Never true for a valid schema.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Returns the number of key columns.
    pub fn key_columns(&self) -> usize {
        self.key_columns
    }

    /// Returns the position of a column, or None if there is no such column.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Returns a column by name.
    pub fn column(&self, name: &str) -> Result<&ColumnDescriptor> {
        self.column_index(name)
            .map(|i| &self.columns[i])
            .ok_or_else(|| BasaltError::ColumnNotFound(name.to_string()))
    }

    /// Returns true if both versions share the same key columns.
    pub fn same_key(&self, other: &SchemaDescriptor) -> bool {
        self.key_columns == other.key_columns
            && self.columns[..self.key_columns] == other.columns[..other.key_columns]
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    const COLUMN_NULLABLE: u8 = 0x01;

    /// Serializes the descriptor for the schema tree of a partition.
    ///
    /// Layout: version u16, key columns u16, column count u16, then per
    /// column its name (u16 length + UTF-8), type tag, flags and scale.
    /// Integers are little-endian.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u16_le(self.version);
        buf.put_u16_le(self.key_columns as u16);
        buf.put_u16_le(self.columns.len() as u16);
        for column in &self.columns {
            buf.put_u16_le(column.name.len() as u16);
            buf.put_slice(column.name.as_bytes());
            buf.put_u8(column.ty as u8);
            buf.put_u8(if column.nullable { Self::COLUMN_NULLABLE } else { 0 });
            buf.put_u8(column.scale);
        }
        buf.freeze()
    }

    /// Deserializes a stored descriptor.
    pub fn from_bytes(mut data: &[u8]) -> Result<Self> {
        let malformed = |what: &str| BasaltError::Internal(format!("schema descriptor: {}", what));

        if data.remaining() < 6 {
            return Err(malformed("truncated header"));
        }
        let version = data.get_u16_le();
        let key_columns = data.get_u16_le() as usize;
        let count = data.get_u16_le() as usize;

        let mut columns = Vec::with_capacity(count);
        for _ in 0..count {
            if data.remaining() < 2 {
                return Err(malformed("truncated column"));
            }
            let len = data.get_u16_le() as usize;
            if data.remaining() < len + 3 {
                return Err(malformed("truncated column"));
            }
            let name = String::from_utf8(data[..len].to_vec()).map_err(|_| malformed("bad column name"))?;
            data.advance(len);
            let tag = data.get_u8();
            let ty = ColumnType::from_u8(tag).ok_or_else(|| malformed(&format!("unknown type {}", tag)))?;
            let flags = data.get_u8();
            let scale = data.get_u8();
            columns.push(ColumnDescriptor {
                name,
                ty,
                nullable: flags & Self::COLUMN_NULLABLE != 0,
                scale,
            });
        }
        if data.has_remaining() {
            return Err(malformed("trailing bytes"));
        }
        Self::new(version, columns, key_columns).map_err(|e| malformed(&e.to_string()))
    }

    /// Schema of a full row.
    pub fn row_schema(&self) -> BinaryTupleSchema {
        self.dense(0, self.columns.len())
    }

    /// Schema of the key columns.
    pub fn key_schema(&self) -> BinaryTupleSchema {
        self.dense(0, self.key_columns)
    }

    /// Schema of the value columns.
    pub fn value_schema(&self) -> BinaryTupleSchema {
        self.dense(self.key_columns, self.columns.len())
    }

    /// Schema of an arbitrary list of columns, in the given order.
    pub fn projection(&self, columns: &[usize]) -> Result<BinaryTupleSchema> {
        let elements = columns
            .iter()
            .map(|&i| {
                self.columns
                    .get(i)
                    .map(Element::from_column)
                    .ok_or(BasaltError::OutOfBounds {
                        index: i,
                        count: self.columns.len(),
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(BinaryTupleSchema {
            elements,
            shape: SchemaShape::Sparse {
                columns: columns.to_vec(),
            },
        })
    }

    /// Schema of a list of columns given by name.
    pub fn projection_by_name<S: AsRef<str>>(&self, names: &[S]) -> Result<BinaryTupleSchema> {
        let columns = names
            .iter()
            .map(|name| {
                self.column_index(name.as_ref())
                    .ok_or_else(|| BasaltError::ColumnNotFound(name.as_ref().to_string()))
            })
            .collect::<Result<Vec<_>>>()?;
        self.projection(&columns)
    }

    fn dense(&self, begin: usize, end: usize) -> BinaryTupleSchema {
        let elements = self.columns[begin..end]
            .iter()
            .map(Element::from_column)
            .collect();
        // A dense tuple can be turned back into a row when it covers the
        // whole key or the whole row
        let full_size = begin == 0 && (end == self.columns.len() || end == self.key_columns);
        BinaryTupleSchema {
            elements,
            shape: SchemaShape::Dense {
                column_base: begin,
                full_size,
            },
        }
    }
}

/// Sort direction and null placement of one tuple element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Collation {
    /// Larger values first.
    pub descending: bool,
    /// Nulls before all values.
    pub nulls_first: bool,
}

impl Collation {
    /// Ascending, nulls first.
    pub const ASC: Collation = Collation {
        descending: false,
        nulls_first: true,
    };

    /// Descending, nulls last.
    pub const DESC: Collation = Collation {
        descending: true,
        nulls_first: false,
    };
}

impl Default for Collation {
    fn default() -> Self {
        Self::ASC
    }
}

/// Description of one tuple element.
///
/// Only the base type, nullability and, for decimals, the scale are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Element {
    pub ty: ColumnType,
    pub nullable: bool,
    pub scale: u8,
    pub collation: Collation,
}

impl Element {
    /// Creates an ascending element.
    pub fn new(ty: ColumnType, nullable: bool) -> Self {
        Self {
            ty,
            nullable,
            scale: 0,
            collation: Collation::ASC,
        }
    }

    fn from_column(column: &ColumnDescriptor) -> Self {
        Self {
            ty: column.ty,
            nullable: column.nullable,
            scale: if column.ty.has_scale() { column.scale } else { 0 },
            collation: Collation::ASC,
        }
    }
}

/// How tuple elements map back to row columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaShape {
    /// A contiguous run of row columns starting at `column_base`.
    Dense { column_base: usize, full_size: bool },
    /// Arbitrary row columns.
    Sparse { columns: Vec<usize> },
    /// Elements not tied to any row.
    Free,
}

/// Schema of a binary tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryTupleSchema {
    elements: Vec<Element>,
    shape: SchemaShape,
}

impl BinaryTupleSchema {
    /// Creates a schema from explicit elements.
    pub fn new(elements: Vec<Element>) -> Self {
        Self {
            elements,
            shape: SchemaShape::Free,
        }
    }

    /// Returns the number of elements.
    #[inline]
    pub fn element_count(&self) -> usize {
        self.elements.len()
    }

    /// Returns all elements.
    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    /// Returns one element, failing with `OutOfBounds` past the end.
    pub fn element(&self, index: usize) -> Result<&Element> {
        self.elements.get(index).ok_or(BasaltError::OutOfBounds {
            index,
            count: self.elements.len(),
        })
    }

    /// Returns true if any element is nullable.
    pub fn has_nullable_elements(&self) -> bool {
        self.elements.iter().any(|e| e.nullable)
    }

    /// Returns the shape of this schema.
    pub fn shape(&self) -> &SchemaShape {
        &self.shape
    }

    /// Returns the row column of an element, if the schema maps to a row.
    pub fn column_index(&self, index: usize) -> Option<usize> {
        if index >= self.elements.len() {
            return None;
        }
        match &self.shape {
            SchemaShape::Dense { column_base, .. } => Some(column_base + index),
            SchemaShape::Sparse { columns } => columns.get(index).copied(),
            SchemaShape::Free => None,
        }
    }

    /// Returns true if a tuple of this schema can be converted back into a row.
    pub fn convertible(&self) -> bool {
        matches!(self.shape, SchemaShape::Dense { full_size: true, .. })
    }

    /// Returns a copy with the given collation per element.
    pub fn with_collations(mut self, collations: &[Collation]) -> Result<Self> {
        if collations.len() != self.elements.len() {
            return Err(BasaltError::OutOfBounds {
                index: collations.len(),
                count: self.elements.len(),
            });
        }
        for (element, collation) in self.elements.iter_mut().zip(collations) {
            element.collation = *collation;
        }
        Ok(self)
    }
}
