//! Binary row and tuple codec.
//!
//! Rows and index keys are encoded as binary tuples driven by a schema.
//! The encoding is order-preserving, so trees compare keys as plain bytes.

mod codec;
mod row;
mod schema;
mod value;

pub use codec::{decode, encode, encode_into, TupleReader};
pub use row::{encode_key, BinaryRow};
pub use schema::{
    BinaryTupleSchema, Collation, ColumnDescriptor, Element, SchemaDescriptor, SchemaShape,
};
pub use value::{Decimal, Value};
