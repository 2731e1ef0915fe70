//! Order-preserving binary tuple encoding.
//!
//! A tuple is the concatenation of its elements. Each element starts with
//! a marker byte followed by the value bytes:
//!
//! | Type                         | Value bytes                               |
//! |------------------------------|-------------------------------------------|
//! | Boolean                      | 1 byte, 0 or 1                            |
//! | Int8/16/32/64, Date, Time, Timestamp | big-endian, sign bit flipped      |
//! | Float32/64                   | IEEE-754 bits mapped to total order       |
//! | Decimal                      | unscaled i128 at the element scale        |
//! | Uuid                         | 16 raw bytes                              |
//! | String, Bytes                | `0x00` escaped as `0x00 0xFF`, `0x00 0x00` terminator |
//!
//! Comparing two encoded tuples byte by byte gives the same order as
//! comparing their values element by element. A descending element is
//! stored complemented.

use super::schema::{BinaryTupleSchema, Element};
use super::value::{Decimal, Value};
use basalt_common::types::ColumnType;
use basalt_common::{BasaltError, Result};
use std::ops::Range;

const MARKER_NULL_LOW: u8 = 0x00;
const MARKER_VALUE: u8 = 0x01;
const MARKER_NULL_HIGH: u8 = 0x02;

const ESCAPE: u8 = 0x00;
const ESCAPED_ZERO: u8 = 0xFF;
const TERMINATOR: u8 = 0x00;

/// Encodes values under a schema.
pub fn encode(schema: &BinaryTupleSchema, values: &[Value]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(estimate_size(values));
    encode_into(schema, values, &mut out)?;
    Ok(out)
}

/// Encodes values under a schema, appending to `out`.
pub fn encode_into(schema: &BinaryTupleSchema, values: &[Value], out: &mut Vec<u8>) -> Result<()> {
    if values.len() != schema.element_count() {
        return Err(BasaltError::OutOfBounds {
            index: values.len(),
            count: schema.element_count(),
        });
    }
    for (element, value) in schema.elements().iter().zip(values) {
        encode_element(element, value, out)?;
    }
    Ok(())
}

/// Decodes the element at `index`.
pub fn decode(schema: &BinaryTupleSchema, bytes: &[u8], index: usize) -> Result<Value> {
    TupleReader::new(schema, bytes).value(index)
}

fn estimate_size(values: &[Value]) -> usize {
    values
        .iter()
        .map(|v| match v {
            Value::String(s) => s.len() + 3,
            Value::Bytes(b) => b.len() + 3,
            _ => 17,
        })
        .sum()
}

fn encode_element(element: &Element, value: &Value, out: &mut Vec<u8>) -> Result<()> {
    let start = out.len();

    if value.is_null() {
        if !element.nullable {
            return Err(BasaltError::NullNotAllowed);
        }
        // Pick the marker that lands on the requested side after an
        // optional complement
        let low = element.collation.nulls_first != element.collation.descending;
        out.push(if low { MARKER_NULL_LOW } else { MARKER_NULL_HIGH });
    } else {
        out.push(MARKER_VALUE);
        encode_value(element, value, out)?;
    }

    if element.collation.descending {
        for byte in &mut out[start..] {
            *byte = !*byte;
        }
    }
    Ok(())
}

fn encode_value(element: &Element, value: &Value, out: &mut Vec<u8>) -> Result<()> {
    match (element.ty, value) {
        (ColumnType::Boolean, Value::Boolean(v)) => out.push(*v as u8),
        (ColumnType::Int8, Value::Int8(v)) => out.push((*v as u8) ^ 0x80),
        (ColumnType::Int16, Value::Int16(v)) => {
            out.extend_from_slice(&((*v as u16) ^ (1 << 15)).to_be_bytes())
        }
        (ColumnType::Int32, Value::Int32(v)) | (ColumnType::Date, Value::Date(v)) => {
            out.extend_from_slice(&((*v as u32) ^ (1 << 31)).to_be_bytes())
        }
        (ColumnType::Int64, Value::Int64(v))
        | (ColumnType::Time, Value::Time(v))
        | (ColumnType::Timestamp, Value::Timestamp(v)) => {
            out.extend_from_slice(&((*v as u64) ^ (1 << 63)).to_be_bytes())
        }
        (ColumnType::Float32, Value::Float32(v)) => {
            let bits = v.to_bits();
            let ordered = if bits >> 31 == 1 { !bits } else { bits ^ (1 << 31) };
            out.extend_from_slice(&ordered.to_be_bytes());
        }
        (ColumnType::Float64, Value::Float64(v)) => {
            let bits = v.to_bits();
            let ordered = if bits >> 63 == 1 { !bits } else { bits ^ (1 << 63) };
            out.extend_from_slice(&ordered.to_be_bytes());
        }
        (ColumnType::Decimal, Value::Decimal(d)) => {
            let unscaled = d.rescale(element.scale).ok_or_else(|| BasaltError::TypeMismatch {
                expected: format!("DECIMAL with scale {}", element.scale),
                actual: format!("{} (scale {})", d, d.scale),
            })?;
            out.extend_from_slice(&((unscaled as u128) ^ (1 << 127)).to_be_bytes());
        }
        (ColumnType::Uuid, Value::Uuid(v)) => out.extend_from_slice(v),
        (ColumnType::String, Value::String(s)) => encode_escaped(s.as_bytes(), out),
        (ColumnType::Bytes, Value::Bytes(b)) => encode_escaped(b, out),
        (expected, actual) => {
            return Err(BasaltError::TypeMismatch {
                expected: expected.to_string(),
                actual: actual
                    .column_type()
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "NULL".to_string()),
            })
        }
    }
    Ok(())
}

fn encode_escaped(bytes: &[u8], out: &mut Vec<u8>) {
    for &b in bytes {
        out.push(b);
        if b == ESCAPE {
            out.push(ESCAPED_ZERO);
        }
    }
    out.push(ESCAPE);
    out.push(TERMINATOR);
}

fn malformed(reason: impl Into<String>) -> BasaltError {
    BasaltError::Internal(format!("malformed tuple: {}", reason.into()))
}

/// Lazy reader over the elements of an encoded tuple.
///
/// Elements are located by walking from the start; the reader remembers
/// how far it got so sequential access stays linear.
pub struct TupleReader<'a> {
    schema: &'a BinaryTupleSchema,
    bytes: &'a [u8],
    /// Start offset of each element located so far.
    offsets: Vec<usize>,
    /// Next element returned by the iterator.
    cursor: usize,
}

impl<'a> TupleReader<'a> {
    /// Creates a reader over `bytes`.
    pub fn new(schema: &'a BinaryTupleSchema, bytes: &'a [u8]) -> Self {
        Self {
            schema,
            bytes,
            offsets: vec![0],
            cursor: 0,
        }
    }

    /// Returns the number of elements.
    pub fn element_count(&self) -> usize {
        self.schema.element_count()
    }

    /// Returns the byte range of one element, marker included.
    pub fn element_range(&mut self, index: usize) -> Result<Range<usize>> {
        let count = self.schema.element_count();
        if index >= count {
            return Err(BasaltError::OutOfBounds { index, count });
        }
        while self.offsets.len() <= index + 1 {
            let i = self.offsets.len() - 1;
            let start = self.offsets[i];
            let len = element_len(&self.schema.elements()[i], &self.bytes[start.min(self.bytes.len())..])?;
            self.offsets.push(start + len);
        }
        Ok(self.offsets[index]..self.offsets[index + 1])
    }

    /// Returns the length of the encoded tuple, verifying that every
    /// element is well formed.
    pub fn encoded_len(&mut self) -> Result<usize> {
        match self.schema.element_count() {
            0 => Ok(0),
            n => Ok(self.element_range(n - 1)?.end),
        }
    }

    /// Decodes one element.
    pub fn value(&mut self, index: usize) -> Result<Value> {
        let range = self.element_range(index)?;
        decode_element(&self.schema.elements()[index], &self.bytes[range])
    }

    /// Decodes all elements.
    pub fn values(&mut self) -> Result<Vec<Value>> {
        (0..self.schema.element_count())
            .map(|i| self.value(i))
            .collect()
    }
}

impl Iterator for TupleReader<'_> {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.schema.element_count() {
            return None;
        }
        let index = self.cursor;
        self.cursor += 1;
        Some(self.value(index))
    }
}

/// Returns the encoded length of the element at the start of `bytes`.
fn element_len(element: &Element, bytes: &[u8]) -> Result<usize> {
    let flip = if element.collation.descending { 0xFF } else { 0x00 };
    let marker = *bytes.first().ok_or_else(|| malformed("truncated element"))? ^ flip;
    if marker != MARKER_VALUE {
        if marker != MARKER_NULL_LOW && marker != MARKER_NULL_HIGH {
            return Err(malformed(format!("unknown marker {:#04x}", marker)));
        }
        return Ok(1);
    }

    let len = match element.ty.fixed_size() {
        Some(size) => size,
        None => {
            let mut i = 1;
            loop {
                let b = *bytes.get(i).ok_or_else(|| malformed("unterminated string"))? ^ flip;
                if b == ESCAPE {
                    let next = *bytes.get(i + 1).ok_or_else(|| malformed("unterminated string"))? ^ flip;
                    i += 2;
                    if next == TERMINATOR {
                        break;
                    }
                    if next != ESCAPED_ZERO {
                        return Err(malformed("bad escape"));
                    }
                } else {
                    i += 1;
                }
            }
            i - 1
        }
    };
    if bytes.len() < 1 + len {
        return Err(malformed("truncated element"));
    }
    Ok(1 + len)
}

fn decode_element(element: &Element, bytes: &[u8]) -> Result<Value> {
    let owned;
    let bytes = if element.collation.descending {
        owned = bytes.iter().map(|b| !b).collect::<Vec<_>>();
        &owned[..]
    } else {
        bytes
    };
    if bytes[0] != MARKER_VALUE {
        return Ok(Value::Null);
    }
    let v = &bytes[1..];

    Ok(match element.ty {
        ColumnType::Boolean => Value::Boolean(v[0] != 0),
        ColumnType::Int8 => Value::Int8((v[0] ^ 0x80) as i8),
        ColumnType::Int16 => Value::Int16((u16::from_be_bytes([v[0], v[1]]) ^ (1 << 15)) as i16),
        ColumnType::Int32 => Value::Int32(read_i32(v)),
        ColumnType::Date => Value::Date(read_i32(v)),
        ColumnType::Int64 => Value::Int64(read_i64(v)),
        ColumnType::Time => Value::Time(read_i64(v)),
        ColumnType::Timestamp => Value::Timestamp(read_i64(v)),
        ColumnType::Float32 => {
            let ordered = u32::from_be_bytes([v[0], v[1], v[2], v[3]]);
            let bits = if ordered >> 31 == 1 { ordered ^ (1 << 31) } else { !ordered };
            Value::Float32(f32::from_bits(bits))
        }
        ColumnType::Float64 => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&v[..8]);
            let ordered = u64::from_be_bytes(buf);
            let bits = if ordered >> 63 == 1 { ordered ^ (1 << 63) } else { !ordered };
            Value::Float64(f64::from_bits(bits))
        }
        ColumnType::Decimal => {
            let mut buf = [0u8; 16];
            buf.copy_from_slice(&v[..16]);
            let unscaled = (u128::from_be_bytes(buf) ^ (1 << 127)) as i128;
            Value::Decimal(Decimal::new(unscaled, element.scale))
        }
        ColumnType::Uuid => {
            let mut buf = [0u8; 16];
            buf.copy_from_slice(&v[..16]);
            Value::Uuid(buf)
        }
        ColumnType::String => {
            let raw = decode_escaped(v);
            Value::String(String::from_utf8(raw).map_err(|_| malformed("invalid UTF-8"))?)
        }
        ColumnType::Bytes => Value::Bytes(decode_escaped(v)),
    })
}

fn read_i32(v: &[u8]) -> i32 {
    (u32::from_be_bytes([v[0], v[1], v[2], v[3]]) ^ (1 << 31)) as i32
}

fn read_i64(v: &[u8]) -> i64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&v[..8]);
    (u64::from_be_bytes(buf) ^ (1 << 63)) as i64
}

/// Strips escaping and the terminator. Input was validated by `element_len`.
fn decode_escaped(v: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(v.len());
    let mut i = 0;
    while i < v.len() {
        if v[i] == ESCAPE {
            if v.get(i + 1) == Some(&TERMINATOR) {
                break;
            }
            out.push(0);
            i += 2;
        } else {
            out.push(v[i]);
            i += 1;
        }
    }
    out
}
