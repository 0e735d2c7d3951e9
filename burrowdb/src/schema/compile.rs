use std::sync::Arc;

use crate::error::{BurrowError, Result};
use crate::schema::types::{CustomField, FieldSpec, ReadHook, SchemaSpec, SetHook};

/// A compiled schema tree node. Built once per model name, immutable after.
#[derive(Clone, Debug)]
pub enum SchemaNode {
    Leaf(LeafNode),
    /// Children in declaration order.
    Branch(Vec<(String, SchemaNode)>),
}

/// A compiled terminal field: the four hooks plus the declared default.
#[derive(Clone)]
pub struct LeafNode {
    set: Option<SetHook>,
    get: Option<ReadHook>,
    load: Option<ReadHook>,
    store: Option<ReadHook>,
    pub(crate) default: serde_yaml::Value,
}

impl std::fmt::Debug for LeafNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafNode")
            .field("set", &self.set.is_some())
            .field("get", &self.get.is_some())
            .field("load", &self.load.is_some())
            .field("store", &self.store.is_some())
            .field("default", &self.default)
            .finish()
    }
}

impl LeafNode {
    /// Run the validate/transform-on-write hook. Returns the value to store,
    /// or the hook's rejection.
    pub fn apply_set(&self, candidate: &serde_yaml::Value) -> Result<serde_yaml::Value> {
        match &self.set {
            Some(hook) => Ok(hook(candidate)?.unwrap_or_else(|| candidate.clone())),
            None => Ok(candidate.clone()),
        }
    }

    /// Run the transform-on-read hook against the raw value. The raw value is
    /// never replaced by a read.
    pub fn apply_get(&self, raw: &serde_yaml::Value) -> serde_yaml::Value {
        match &self.get {
            Some(hook) => hook(raw).unwrap_or_else(|| raw.clone()),
            None => raw.clone(),
        }
    }

    /// Run the load hook on an incoming stored representation.
    pub fn apply_load(&self, stored: &serde_yaml::Value) -> serde_yaml::Value {
        match &self.load {
            Some(hook) => hook(stored).unwrap_or_else(|| stored.clone()),
            None => stored.clone(),
        }
    }

    /// Run the store hook to produce the representation to persist.
    pub fn apply_store(&self, raw: &serde_yaml::Value) -> serde_yaml::Value {
        match &self.store {
            Some(hook) => hook(raw).unwrap_or_else(|| raw.clone()),
            None => raw.clone(),
        }
    }
}

/// Compile a declarative spec into its immutable node tree.
pub fn compile(spec: &SchemaSpec) -> Result<SchemaNode> {
    compile_branch(spec, "")
}

fn compile_branch(spec: &SchemaSpec, prefix: &str) -> Result<SchemaNode> {
    let mut children = Vec::with_capacity(spec.fields.len());
    for (name, field) in &spec.fields {
        let path = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}.{name}")
        };
        let node = match field {
            FieldSpec::String => SchemaNode::Leaf(string_leaf(name)),
            FieldSpec::Number => SchemaNode::Leaf(number_leaf(name)),
            FieldSpec::Boolean => SchemaNode::Leaf(boolean_leaf(name)),
            FieldSpec::Custom(custom) => SchemaNode::Leaf(custom_leaf(custom)),
            FieldSpec::Nested(nested) => compile_branch(nested, &path)?,
            FieldSpec::Model(_) => return Err(BurrowError::UnsupportedSchema(path)),
        };
        children.push((name.clone(), node));
    }
    Ok(SchemaNode::Branch(children))
}

fn custom_leaf(custom: &CustomField) -> LeafNode {
    LeafNode {
        set: custom.set.clone(),
        get: custom.get.clone(),
        load: custom.load.clone(),
        store: custom.store.clone(),
        default: custom.default.clone(),
    }
}

fn string_leaf(field: &str) -> LeafNode {
    let name = field.to_string();
    LeafNode {
        set: Some(Arc::new(move |value| {
            if value.is_string() {
                Ok(None)
            } else {
                Err(BurrowError::validation(
                    &name,
                    format!("expected string, got {}", type_name(value)),
                ))
            }
        })),
        get: None,
        load: Some(Arc::new(|value| match value {
            serde_yaml::Value::String(_) => None,
            other => Some(serde_yaml::Value::String(stringify(other))),
        })),
        store: None,
        default: serde_yaml::Value::String(String::new()),
    }
}

fn number_leaf(field: &str) -> LeafNode {
    let name = field.to_string();
    LeafNode {
        set: Some(Arc::new(move |value| {
            if value.is_number() {
                Ok(None)
            } else {
                Err(BurrowError::validation(
                    &name,
                    format!("expected number, got {}", type_name(value)),
                ))
            }
        })),
        get: None,
        load: Some(Arc::new(|value| match value {
            serde_yaml::Value::Number(_) => None,
            other => Some(serde_yaml::Value::Number(numberish(other).into())),
        })),
        store: None,
        default: serde_yaml::Value::Number(f64::NAN.into()),
    }
}

fn boolean_leaf(field: &str) -> LeafNode {
    let name = field.to_string();
    LeafNode {
        set: Some(Arc::new(move |value| {
            if value.is_bool() {
                Ok(None)
            } else {
                Err(BurrowError::validation(
                    &name,
                    format!("expected boolean, got {}", type_name(value)),
                ))
            }
        })),
        get: None,
        load: Some(Arc::new(|value| match value {
            serde_yaml::Value::Bool(_) => None,
            other => Some(serde_yaml::Value::Bool(truthy(other))),
        })),
        store: None,
        default: serde_yaml::Value::Bool(false),
    }
}

/// Scalar-to-text coercion for string loads. Non-scalar input loads as `""`.
fn stringify(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        _ => String::new(),
    }
}

/// Loose numeric coercion for number loads. Unparseable input loads as NaN.
fn numberish(value: &serde_yaml::Value) -> f64 {
    match value {
        serde_yaml::Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        serde_yaml::Value::String(s) => s.trim().parse::<f64>().unwrap_or(f64::NAN),
        serde_yaml::Value::Bool(true) => 1.0,
        serde_yaml::Value::Bool(false) => 0.0,
        _ => f64::NAN,
    }
}

/// Loose boolean coercion for boolean loads: numeric 1 and textual
/// "true"/"1" load as true, everything else as false.
fn truthy(value: &serde_yaml::Value) -> bool {
    match value {
        serde_yaml::Value::Bool(b) => *b,
        serde_yaml::Value::Number(n) => n.as_f64() == Some(1.0),
        serde_yaml::Value::String(s) => s == "true" || s == "1",
        _ => false,
    }
}

fn type_name(value: &serde_yaml::Value) -> &'static str {
    match value {
        serde_yaml::Value::Null => "null",
        serde_yaml::Value::Bool(_) => "boolean",
        serde_yaml::Value::Number(_) => "number",
        serde_yaml::Value::String(_) => "string",
        serde_yaml::Value::Sequence(_) => "list",
        serde_yaml::Value::Mapping(_) => "object",
        serde_yaml::Value::Tagged(_) => "tagged",
    }
}
