//! Format parsing and field mapping
//!
//! - [`catalog`]: per-entity formats and mapping rules
//! - [`parser`]: delimited and fixed-width parsers
//! - [`mapper`]: raw rows to typed fields
//! - [`value`]: semantic types, transforms and coercion

pub mod catalog;
pub mod mapper;
pub mod parser;
pub mod value;

pub use catalog::{
    DelimitedConfig, EntityCatalog, EntitySpec, FieldMapping, FieldSource, FixedWidthConfig,
    FixedWidthField, FormatConfig,
};
pub use mapper::{FieldMapper, MappedRecord};
pub use parser::{ParsedRow, RawRecord};
pub use value::{FieldType, FieldValue, Transform};
