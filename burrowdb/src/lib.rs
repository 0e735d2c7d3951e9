pub mod connection;
pub mod driver;
pub mod error;
pub mod model;
pub mod schema;

pub use connection::{
    connect, set_shared, shared, CollectionRef, ConnectConfig, Connection, ConnectionEvent,
    ConnectionState,
};
pub use driver::{ConnectTarget, Document, Driver, FindOptions, UpdateOptions};
pub use error::{BurrowError, Result};
pub use model::{Model, ModelInstance};
pub use schema::{CustomField, FieldSpec, SchemaSpec};
