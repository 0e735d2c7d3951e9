//! Per-document instances: the raw-value tree and its hook-driven accessors.

use std::fmt;

use serde_yaml::Mapping;

use crate::driver::Document;
use crate::error::{BurrowError, Result};
use crate::model::Model;
use crate::schema::SchemaNode;

/// The stored raw values, mirroring the schema shape. Each instance owns its
/// tree exclusively; nothing is shared between instances.
#[derive(Debug, Clone)]
pub(crate) enum RawNode {
    Leaf(serde_yaml::Value),
    Branch(Vec<(String, RawNode)>),
}

/// One in-memory document. Identity is present only after a successful save
/// or when deserialized from storage.
pub struct ModelInstance {
    pub(crate) model: Model,
    pub(crate) id: Option<Document>,
    pub(crate) raw: RawNode,
}

// Manual impl: `Model` holds hook closures and a connection, neither of
// which derives.
impl fmt::Debug for ModelInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelInstance")
            .field("model", &self.model.def.name)
            .field("id", &self.id)
            .field("raw", &self.raw)
            .finish()
    }
}

pub(crate) fn build_default(model: &Model) -> ModelInstance {
    ModelInstance {
        raw: default_tree(&model.def.root),
        id: None,
        model: model.clone(),
    }
}

pub(crate) fn build_fresh(model: &Model, values: &Document) -> Result<ModelInstance> {
    Ok(ModelInstance {
        raw: assign_tree(&model.def.root, Some(values))?,
        id: None,
        model: model.clone(),
    })
}

pub(crate) fn build_deserialized(model: &Model, doc: &Document) -> ModelInstance {
    ModelInstance {
        raw: load_tree(&model.def.root, Some(doc)),
        id: doc.get("_id").filter(|v| !v.is_null()).cloned(),
        model: model.clone(),
    }
}

fn default_tree(node: &SchemaNode) -> RawNode {
    match node {
        SchemaNode::Leaf(leaf) => RawNode::Leaf(leaf.default.clone()),
        SchemaNode::Branch(children) => RawNode::Branch(
            children
                .iter()
                .map(|(name, child)| (name.clone(), default_tree(child)))
                .collect(),
        ),
    }
}

/// Fresh construction: supplied leaves run through their set hook (which may
/// reject the field), missing leaves take their defaults.
fn assign_tree(node: &SchemaNode, values: Option<&serde_yaml::Value>) -> Result<RawNode> {
    match node {
        SchemaNode::Leaf(leaf) => Ok(RawNode::Leaf(match values {
            Some(value) => leaf.apply_set(value)?,
            None => leaf.default.clone(),
        })),
        SchemaNode::Branch(children) => {
            let mut raw = Vec::with_capacity(children.len());
            for (name, child) in children {
                let sub = values.and_then(|v| v.get(name.as_str()));
                raw.push((name.clone(), assign_tree(child, sub)?));
            }
            Ok(RawNode::Branch(raw))
        }
    }
}

/// Deserialize construction: supplied leaves run through their load hook
/// unconditionally (no validation) and missing leaves take their defaults.
fn load_tree(node: &SchemaNode, values: Option<&serde_yaml::Value>) -> RawNode {
    match node {
        SchemaNode::Leaf(leaf) => RawNode::Leaf(match values {
            Some(value) => leaf.apply_load(value),
            None => leaf.default.clone(),
        }),
        SchemaNode::Branch(children) => RawNode::Branch(
            children
                .iter()
                .map(|(name, child)| {
                    let sub = values.and_then(|v| v.get(name.as_str()));
                    (name.clone(), load_tree(child, sub))
                })
                .collect(),
        ),
    }
}

fn raw_at<'a>(node: &'a RawNode, segments: &[String]) -> Option<&'a serde_yaml::Value> {
    match (node, segments) {
        (RawNode::Leaf(value), []) => Some(value),
        (RawNode::Branch(children), [head, rest @ ..]) => children
            .iter()
            .find(|(name, _)| name == head)
            .and_then(|(_, child)| raw_at(child, rest)),
        _ => None,
    }
}

fn raw_at_mut<'a>(node: &'a mut RawNode, segments: &[String]) -> Option<&'a mut serde_yaml::Value> {
    match (node, segments) {
        (RawNode::Leaf(value), []) => Some(value),
        (RawNode::Branch(children), [head, rest @ ..]) => children
            .iter_mut()
            .find(|(name, _)| name == head)
            .and_then(|(_, child)| raw_at_mut(child, rest)),
        _ => None,
    }
}

fn serialize_node(schema: &SchemaNode, raw: &RawNode) -> Document {
    match (schema, raw) {
        (SchemaNode::Leaf(leaf), RawNode::Leaf(value)) => leaf.apply_store(value),
        (SchemaNode::Branch(children), RawNode::Branch(raw_children)) => {
            let mut mapping = Mapping::with_capacity(children.len());
            for ((name, child), (_, raw_child)) in children.iter().zip(raw_children) {
                mapping.insert(
                    Document::String(name.clone()),
                    serialize_node(child, raw_child),
                );
            }
            Document::Mapping(mapping)
        }
        // Raw trees are built from the schema, so shapes always match.
        _ => Document::Null,
    }
}

impl ModelInstance {
    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    /// The storage identity, present after a save or a deserialize.
    pub fn id(&self) -> Option<&Document> {
        self.id.as_ref()
    }

    /// Read a field through its transform-on-read hook. The stored raw value
    /// is never changed by a read.
    pub fn get(&self, path: &str) -> Result<Document> {
        let accessor = self.model.accessor(path)?;
        let raw = raw_at(&self.raw, &accessor.segments)
            .ok_or_else(|| BurrowError::UnknownField(path.to_string()))?;
        Ok(accessor.leaf.apply_get(raw))
    }

    /// Write a field through its validate/transform-on-write hook. A
    /// rejection aborts the write and the prior raw value stays intact.
    pub fn set(&mut self, path: &str, value: impl Into<Document>) -> Result<()> {
        let value = value.into();
        let (stored, segments) = {
            let accessor = self.model.accessor(path)?;
            (accessor.leaf.apply_set(&value)?, accessor.segments.clone())
        };
        let slot = raw_at_mut(&mut self.raw, &segments)
            .ok_or_else(|| BurrowError::UnknownField(path.to_string()))?;
        *slot = stored;
        Ok(())
    }

    /// Produce the document to persist: every leaf's store hook over the
    /// current raw value, identity carried through when present.
    pub fn serialize(&self) -> Document {
        let mut out = Mapping::new();
        if let Some(id) = &self.id {
            out.insert(Document::String("_id".into()), id.clone());
        }
        if let Document::Mapping(fields) = serialize_node(&self.model.def.root, &self.raw) {
            out.extend(fields);
        }
        Document::Mapping(out)
    }

    /// Serialize and persist this instance, adopting the identity the store
    /// assigned.
    pub async fn save(&mut self) -> Result<()> {
        let doc = self.serialize();
        let stored = self.model.conn.save(&self.model.def.name, doc).await?;
        self.id = stored.get("_id").filter(|v| !v.is_null()).cloned();
        Ok(())
    }

    /// Delete this instance by identity, returning the affected count. An
    /// instance that was never saved matches nothing and resolves with 0.
    pub async fn remove(&self) -> Result<u64> {
        let Some(id) = &self.id else {
            return Ok(0);
        };
        let mut criteria = Mapping::new();
        criteria.insert(Document::String("_id".into()), id.clone());
        self.model
            .conn
            .remove(&self.model.def.name, Document::Mapping(criteria))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectConfig, Connection};
    use crate::driver::memory::MemoryDriver;
    use crate::schema::{CustomField, FieldSpec, SchemaSpec};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn person_spec() -> SchemaSpec {
        SchemaSpec::new()
            .field("name", FieldSpec::String)
            .field("age", FieldSpec::Number)
            .field("is_programmer", FieldSpec::Boolean)
            .field(
                "sex",
                FieldSpec::custom(
                    CustomField::new("?")
                        .on_set(|value| match value.as_str() {
                            Some("M") | Some("F") | Some("?") => Ok(None),
                            _ => Err(BurrowError::validation("sex", "must be M, F or ?")),
                        })
                        .on_load(|value| match value.as_str() {
                            Some("M") | Some("F") => None,
                            _ => Some(serde_yaml::Value::String("?".into())),
                        }),
                ),
            )
            .field(
                "bar",
                FieldSpec::custom(CustomField::new("foo").on_get(|value| {
                    value
                        .as_str()
                        .map(|s| serde_yaml::Value::String(s.replace("foo", "bar")))
                })),
            )
            .field(
                "dog",
                FieldSpec::nested(
                    SchemaSpec::new()
                        .field("name", FieldSpec::String)
                        .field(
                            "age",
                            FieldSpec::custom(
                                CustomField::new(f64::NAN)
                                    .on_set(|value| {
                                        if value.is_number() {
                                            Ok(None)
                                        } else {
                                            Err(BurrowError::validation("dog.age", "must be a number"))
                                        }
                                    })
                                    .on_store(|value| {
                                        value.as_f64().map(|n| serde_yaml::Value::from(n * 7.0))
                                    })
                                    .on_load(|value| {
                                        value.as_f64().map(|n| serde_yaml::Value::from(n / 7.0))
                                    }),
                            ),
                        )
                        .field(
                            "is_programmer",
                            FieldSpec::custom(
                                CustomField::new(false)
                                    // Getter that computes nothing: the raw
                                    // value is surfaced unchanged.
                                    .on_get(|_| None)
                                    .on_set(|_| Ok(Some(serde_yaml::Value::Bool(false)))),
                            ),
                        ),
                ),
            )
    }

    async fn person_model() -> Model {
        let conn = Connection::open(Arc::new(MemoryDriver::new()), ConnectConfig::default());
        conn.register_model("person", &person_spec()).unwrap()
    }

    fn yaml(s: &str) -> serde_yaml::Value {
        serde_yaml::from_str(s).unwrap()
    }

    #[tokio::test]
    async fn test_defaults_before_any_assignment() {
        let model = person_model().await;
        let person = model.create();

        assert_eq!(person.id(), None);
        assert_eq!(person.get("name").unwrap(), yaml("''"));
        assert!(person.get("age").unwrap().as_f64().unwrap().is_nan());
        assert_eq!(person.get("is_programmer").unwrap(), yaml("false"));
        assert_eq!(person.get("sex").unwrap(), yaml("'?'"));
        // The get hook computes the surfaced value from the raw default.
        assert_eq!(person.get("bar").unwrap(), yaml("bar"));
        assert_eq!(person.get("dog.name").unwrap(), yaml("''"));
        assert!(person.get("dog.age").unwrap().as_f64().unwrap().is_nan());
    }

    #[tokio::test]
    async fn test_set_and_get_through_hooks() {
        let model = person_model().await;
        let mut person = model.create();

        person.set("name", "John").unwrap();
        assert_eq!(person.get("name").unwrap(), yaml("John"));

        person.set("age", 20).unwrap();
        assert_eq!(person.get("age").unwrap().as_f64(), Some(20.0));

        person.set("dog.name", "Sparks").unwrap();
        assert_eq!(person.get("dog.name").unwrap(), yaml("Sparks"));

        // The set hook's replacement value wins over the candidate.
        person.set("dog.is_programmer", true).unwrap();
        assert_eq!(person.get("dog.is_programmer").unwrap(), yaml("false"));
    }

    #[tokio::test]
    async fn test_rejected_write_keeps_prior_value() {
        let model = person_model().await;
        let mut person = model.create();

        person.set("sex", "M").unwrap();
        let err = person.set("sex", "invalid").unwrap_err();
        assert_eq!(err, BurrowError::validation("sex", "must be M, F or ?"));
        assert_eq!(person.get("sex").unwrap(), yaml("M"));

        let err = person.set("name", 42).unwrap_err();
        assert_eq!(
            err,
            BurrowError::validation("name", "expected string, got number")
        );
        assert_eq!(person.get("name").unwrap(), yaml("''"));
    }

    #[tokio::test]
    async fn test_read_never_mutates_raw() {
        let model = person_model().await;
        let mut person = model.create();

        person.set("bar", "foo foo foo").unwrap();
        assert_eq!(person.get("bar").unwrap(), yaml("bar bar bar"));
        // Repeated reads keep computing from the untouched raw value.
        assert_eq!(person.get("bar").unwrap(), yaml("bar bar bar"));
        // And serialization sees the raw value, not the computed one.
        let doc = person.serialize();
        assert_eq!(doc.get("bar").unwrap(), &yaml("foo foo foo"));
    }

    #[tokio::test]
    async fn test_create_from_values() {
        let model = person_model().await;
        let person = model
            .create_from(&yaml(
                "name: Jane\nage: 18\nsex: F\ndog:\n  name: Ribs\n  age: 2\n  is_programmer: true",
            ))
            .unwrap();

        assert_eq!(person.id(), None);
        assert_eq!(person.get("name").unwrap(), yaml("Jane"));
        assert_eq!(person.get("age").unwrap().as_f64(), Some(18.0));
        assert_eq!(person.get("sex").unwrap(), yaml("F"));
        assert_eq!(person.get("dog.name").unwrap(), yaml("Ribs"));
        assert_eq!(person.get("dog.age").unwrap().as_f64(), Some(2.0));
        // Forced false by the set hook even during construction.
        assert_eq!(person.get("dog.is_programmer").unwrap(), yaml("false"));
        // Unsupplied fields keep their defaults.
        assert_eq!(person.get("is_programmer").unwrap(), yaml("false"));
    }

    #[tokio::test]
    async fn test_create_from_invalid_value_fails() {
        let model = person_model().await;
        let err = model.create_from(&yaml("age: eighteen")).unwrap_err();
        assert_eq!(
            err,
            BurrowError::validation("age", "expected number, got string")
        );
    }

    #[tokio::test]
    async fn test_deserialize_applies_load_hooks_without_validation() {
        let model = person_model().await;
        let person = model.deserialize(&yaml(
            "_id: '123'\nname: Jane\nage: '18'\nsex: F\ndog:\n  name: Ribs\n  age: 14\n  is_programmer: true",
        ));

        assert_eq!(person.id(), Some(&yaml("'123'")));
        // "18" would fail validation, but the load hook coerces it.
        assert_eq!(person.get("age").unwrap().as_f64(), Some(18.0));
        assert_eq!(person.get("sex").unwrap(), yaml("F"));
        // Stored dog years divide back down on load.
        assert_eq!(person.get("dog.age").unwrap().as_f64(), Some(2.0));
        // No load hook on this leaf, so the stored value survives as-is.
        assert_eq!(person.get("dog.is_programmer").unwrap(), yaml("true"));
    }

    #[tokio::test]
    async fn test_deserialize_coerces_unknown_marker() {
        let model = person_model().await;
        let mystery = model.deserialize(&yaml("sex: unknown"));
        assert_eq!(mystery.get("sex").unwrap(), yaml("'?'"));
    }

    #[tokio::test]
    async fn test_serialize_runs_store_hooks() {
        let model = person_model().await;
        let mut person = model.create();
        person.set("name", "John").unwrap();
        person.set("dog.age", 3).unwrap();

        let doc = person.serialize();
        assert_eq!(doc.get("name").unwrap(), &yaml("John"));
        // Store hook multiplies by 7 on the way out.
        assert_eq!(doc.get("dog").unwrap().get("age").unwrap().as_f64(), Some(21.0));
    }

    #[tokio::test]
    async fn test_inverse_store_load_round_trip() {
        let model = person_model().await;
        let mut person = model.create();
        person.set("dog.age", 3).unwrap();

        let reloaded = model.deserialize(&person.serialize());
        assert_eq!(reloaded.get("dog.age").unwrap().as_f64(), Some(3.0));
    }

    #[tokio::test]
    async fn test_debug_output_names_model_and_identity() {
        let model = person_model().await;
        let person = model.create();
        let rendered = format!("{person:?}");
        assert!(rendered.contains("\"person\""));
        assert!(rendered.contains("id: None"));
    }

    #[tokio::test]
    async fn test_unknown_field_path() {
        let model = person_model().await;
        let mut person = model.create();
        assert_eq!(
            person.get("nope").unwrap_err(),
            BurrowError::UnknownField("nope".into())
        );
        assert_eq!(
            person.set("dog.nope", 1).unwrap_err(),
            BurrowError::UnknownField("dog.nope".into())
        );
    }
}
