//! Model registry and handles.
//!
//! A model is a named, compiled schema bound to a connection. Registration
//! compiles the declarative spec once and memoizes the definition by name;
//! instances are built through [`Model::create`], [`Model::create_from`],
//! and [`Model::deserialize`], and queried through `find*`.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::connection::Connection;
use crate::driver::{Document, FindOptions};
use crate::error::{BurrowError, Result};
use crate::schema::{compile, LeafNode, SchemaNode, SchemaSpec};

pub mod instance;

pub use instance::ModelInstance;

/// A compiled model: the immutable schema tree plus the accessor table
/// generated from it at definition time.
#[derive(Debug)]
pub struct ModelDefinition {
    pub(crate) name: String,
    pub(crate) root: SchemaNode,
    /// Dotted field path → leaf accessor.
    pub(crate) accessors: HashMap<String, FieldAccessor>,
}

/// Where a leaf lives in the raw tree, and the hooks that govern it.
#[derive(Debug)]
pub(crate) struct FieldAccessor {
    pub(crate) segments: Vec<String>,
    pub(crate) leaf: LeafNode,
}

fn build_accessors(root: &SchemaNode) -> HashMap<String, FieldAccessor> {
    let mut table = HashMap::new();
    collect_accessors(root, &mut Vec::new(), &mut table);
    table
}

fn collect_accessors(
    node: &SchemaNode,
    segments: &mut Vec<String>,
    table: &mut HashMap<String, FieldAccessor>,
) {
    if let SchemaNode::Branch(children) = node {
        for (name, child) in children {
            segments.push(name.clone());
            match child {
                SchemaNode::Leaf(leaf) => {
                    table.insert(
                        segments.join("."),
                        FieldAccessor {
                            segments: segments.clone(),
                            leaf: leaf.clone(),
                        },
                    );
                }
                SchemaNode::Branch(_) => collect_accessors(child, segments, table),
            }
            segments.pop();
        }
    }
}

impl Connection {
    /// Register a model under `name`, compiling its schema. Registering a
    /// name that already exists returns the existing definition unchanged;
    /// compilation is memoized per name and the new spec is ignored.
    pub fn register_model(&self, name: &str, spec: &SchemaSpec) -> Result<Model> {
        let mut models = self.inner.models.lock().unwrap();
        if let Some(def) = models.get(name) {
            log::debug!("model '{name}' already registered, reusing definition");
            return Ok(Model {
                def: Arc::clone(def),
                conn: self.clone(),
            });
        }

        let root = compile(spec)?;
        let accessors = build_accessors(&root);
        let def = Arc::new(ModelDefinition {
            name: name.to_string(),
            root,
            accessors,
        });
        models.insert(name.to_string(), Arc::clone(&def));
        Ok(Model {
            def,
            conn: self.clone(),
        })
    }

    /// Look up a registered model by name.
    pub fn model(&self, name: &str) -> Option<Model> {
        let models = self.inner.models.lock().unwrap();
        models.get(name).map(|def| Model {
            def: Arc::clone(def),
            conn: self.clone(),
        })
    }
}

/// A registered model bound to its connection.
#[derive(Clone, Debug)]
pub struct Model {
    pub(crate) def: Arc<ModelDefinition>,
    pub(crate) conn: Connection,
}

impl Model {
    pub fn name(&self) -> &str {
        &self.def.name
    }

    /// A fresh instance holding every leaf's declared default.
    pub fn create(&self) -> ModelInstance {
        instance::build_default(self)
    }

    /// A fresh instance from initial values: each supplied leaf value runs
    /// through its validate/transform-on-write hook (which may reject the
    /// construction), missing leaves take their defaults.
    pub fn create_from(&self, values: &Document) -> Result<ModelInstance> {
        instance::build_fresh(self, values)
    }

    /// Rebuild an instance from its stored representation: load hooks
    /// instead of validation, identity attached from `_id`.
    pub fn deserialize(&self, doc: &Document) -> ModelInstance {
        instance::build_deserialized(self, doc)
    }

    /// Resolve a single matching instance, or `None` for no match.
    pub async fn find_one(&self, query: Document) -> Result<Option<ModelInstance>> {
        let found = self.conn.find_one(&self.def.name, query).await?;
        Ok(found.map(|doc| self.deserialize(&doc)))
    }

    /// `find_one` by identity.
    pub async fn find_by_id(&self, id: &Document) -> Result<Option<ModelInstance>> {
        let mut query = serde_yaml::Mapping::new();
        query.insert(Document::String("_id".into()), id.clone());
        self.find_one(Document::Mapping(query)).await
    }

    /// Materialize every matching instance, in result order.
    pub async fn find(&self, query: Document) -> Result<Vec<ModelInstance>> {
        let docs = self
            .conn
            .find(&self.def.name, query, FindOptions::default())
            .await?;
        Ok(docs.iter().map(|doc| self.deserialize(doc)).collect())
    }

    /// Stream matching instances one at a time; the channel closing is the
    /// end marker.
    pub async fn find_each(&self, query: Document) -> Result<mpsc::Receiver<Result<ModelInstance>>> {
        let mut docs = self
            .conn
            .find_each(&self.def.name, query, FindOptions::default())
            .await?;
        let (tx, rx) = mpsc::channel(16);
        let model = self.clone();
        tokio::spawn(async move {
            while let Some(next) = docs.recv().await {
                let message = next.map(|doc| model.deserialize(&doc));
                if tx.send(message).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    pub(crate) fn accessor(&self, path: &str) -> Result<&FieldAccessor> {
        self.def
            .accessors
            .get(path)
            .ok_or_else(|| BurrowError::UnknownField(path.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::memory::MemoryDriver;
    use crate::schema::FieldSpec;
    use crate::ConnectConfig;

    fn test_connection() -> Connection {
        Connection::open(Arc::new(MemoryDriver::new()), ConnectConfig::default())
    }

    #[tokio::test]
    async fn test_lookup_before_registration_is_none() {
        let conn = test_connection();
        assert!(conn.model("missing").is_none());
    }

    #[tokio::test]
    async fn test_registration_is_memoized() {
        let conn = test_connection();
        let spec = SchemaSpec::new().field("name", FieldSpec::String);
        let first = conn.register_model("user", &spec).unwrap();

        // A different spec under the same name is ignored.
        let other = SchemaSpec::new().field("age", FieldSpec::Number);
        let second = conn.register_model("user", &other).unwrap();

        assert!(Arc::ptr_eq(&first.def, &second.def));
        assert!(conn.model("user").unwrap().accessor("name").is_ok());
    }

    #[tokio::test]
    async fn test_unsupported_schema_fails_registration() {
        let conn = test_connection();
        let spec = SchemaSpec::new().field("owner", FieldSpec::Model("user".into()));
        let err = conn.register_model("pet", &spec).unwrap_err();
        assert_eq!(err, BurrowError::UnsupportedSchema("owner".into()));
        assert!(conn.model("pet").is_none());
    }

    #[tokio::test]
    async fn test_accessor_table_covers_nested_paths() {
        let conn = test_connection();
        let spec = SchemaSpec::new().field("name", FieldSpec::String).field(
            "dog",
            FieldSpec::nested(SchemaSpec::new().field("age", FieldSpec::Number)),
        );
        let model = conn.register_model("person", &spec).unwrap();

        assert!(model.accessor("name").is_ok());
        assert!(model.accessor("dog.age").is_ok());
        assert_eq!(
            model.accessor("dog").unwrap_err(),
            BurrowError::UnknownField("dog".into())
        );
    }
}
