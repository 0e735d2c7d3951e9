//! Declarative schema descriptions and their compiled form.
//!
//! Callers describe a model with [`SchemaSpec`] (an ordered field list of
//! explicit [`FieldSpec`] variants); [`compile`] turns that into the
//! immutable [`SchemaNode`] tree the model engine runs on.

pub mod compile;
pub mod types;

pub use compile::{compile, LeafNode, SchemaNode};
pub use types::{CustomField, FieldSpec, ReadHook, SchemaSpec, SetHook};
