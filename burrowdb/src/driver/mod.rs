//! The seam between this crate and the underlying document-store driver.
//!
//! Everything below the connection layer is an opaque async collaborator:
//! a [`Driver`] produces a [`DriverLink`] per connect attempt, a link
//! resolves [`DriverCollection`] handles, and collections run the primitive
//! operations. The crate never assumes anything about the wire protocol.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub mod memory;

/// The dynamic document representation used throughout the crate.
///
/// `serde_yaml::Value` rather than a JSON value because its `Number` can
/// carry NaN, which is the declared default for numeric schema fields.
pub type Document = serde_yaml::Value;

/// Where to connect. Defaults match the conventional local store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectTarget {
    pub database: String,
    pub host: String,
    pub port: u16,
}

impl Default for ConnectTarget {
    fn default() -> Self {
        ConnectTarget {
            database: "test".to_string(),
            host: "127.0.0.1".to_string(),
            port: 27017,
        }
    }
}

/// Options for `find`. Passed through to the driver untouched.
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    /// Restrict returned fields, driver-interpreted.
    pub projection: Option<Document>,
    pub limit: Option<u64>,
}

/// Options for `update`.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateOptions {
    pub multi: bool,
    pub upsert: bool,
}

/// Factory for connection attempts. The reconnect loop calls `connect`
/// afresh on every tick, so implementations must not assume a single call.
#[async_trait]
pub trait Driver: Send + Sync {
    async fn connect(&self, target: &ConnectTarget) -> Result<Box<dyn DriverLink>>;
}

/// One established link to the store. Dropping the link closes it.
#[async_trait]
pub trait DriverLink: Send + Sync {
    /// Resolve a collection handle by name.
    async fn collection(&self, name: &str) -> Result<Box<dyn DriverCollection>>;

    /// Resolves once the underlying link has closed, however that happened.
    /// May be awaited at most once per link.
    async fn wait_closed(&self);
}

/// Primitive operations on a single collection.
#[async_trait]
pub trait DriverCollection: Send + Sync {
    async fn find(&self, query: Document, options: FindOptions) -> Result<Box<dyn DriverCursor>>;

    async fn find_one(&self, query: Document) -> Result<Option<Document>>;

    /// Insert documents, returning them with identities assigned.
    async fn insert(&self, docs: Vec<Document>) -> Result<Vec<Document>>;

    /// Insert-or-replace by identity, returning the stored document.
    async fn save(&self, doc: Document) -> Result<Document>;

    /// Returns the number of documents updated.
    async fn update(
        &self,
        criteria: Document,
        replacement: Document,
        options: UpdateOptions,
    ) -> Result<u64>;

    /// Returns the number of documents removed.
    async fn remove(&self, criteria: Document) -> Result<u64>;
}

/// Lazy result traversal for `find`.
#[async_trait]
pub trait DriverCursor: Send {
    /// `Ok(None)` marks the end of the result set.
    async fn next(&mut self) -> Result<Option<Document>>;
}
