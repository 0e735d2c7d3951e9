use std::fmt;
use std::sync::Arc;

use crate::error::Result;

/// Hook run when a value is assigned to a field (validate/transform-on-write).
/// May reject the candidate; `Ok(None)` keeps the candidate unchanged,
/// `Ok(Some(v))` stores `v` instead.
pub type SetHook = Arc<dyn Fn(&serde_yaml::Value) -> Result<Option<serde_yaml::Value>> + Send + Sync>;

/// Hook shape shared by transform-on-read, load, and store: `None` means
/// identity, `Some(v)` replaces the value being read, loaded, or persisted.
pub type ReadHook = Arc<dyn Fn(&serde_yaml::Value) -> Option<serde_yaml::Value> + Send + Sync>;

/// A terminal field with caller-supplied hooks and an explicit default.
/// Unset hooks behave as identity transforms.
#[derive(Clone)]
pub struct CustomField {
    pub(crate) set: Option<SetHook>,
    pub(crate) get: Option<ReadHook>,
    pub(crate) load: Option<ReadHook>,
    pub(crate) store: Option<ReadHook>,
    pub(crate) default: serde_yaml::Value,
}

impl CustomField {
    pub fn new(default: impl Into<serde_yaml::Value>) -> Self {
        CustomField {
            set: None,
            get: None,
            load: None,
            store: None,
            default: default.into(),
        }
    }

    /// Validate/transform a candidate value on assignment.
    pub fn on_set(
        mut self,
        hook: impl Fn(&serde_yaml::Value) -> Result<Option<serde_yaml::Value>> + Send + Sync + 'static,
    ) -> Self {
        self.set = Some(Arc::new(hook));
        self
    }

    /// Compute the surfaced value on read. Never mutates stored state.
    pub fn on_get(
        mut self,
        hook: impl Fn(&serde_yaml::Value) -> Option<serde_yaml::Value> + Send + Sync + 'static,
    ) -> Self {
        self.get = Some(Arc::new(hook));
        self
    }

    /// Coerce a stored representation when a document is deserialized.
    pub fn on_load(
        mut self,
        hook: impl Fn(&serde_yaml::Value) -> Option<serde_yaml::Value> + Send + Sync + 'static,
    ) -> Self {
        self.load = Some(Arc::new(hook));
        self
    }

    /// Produce the representation to persist when a document is serialized.
    pub fn on_store(
        mut self,
        hook: impl Fn(&serde_yaml::Value) -> Option<serde_yaml::Value> + Send + Sync + 'static,
    ) -> Self {
        self.store = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for CustomField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomField")
            .field("set", &self.set.is_some())
            .field("get", &self.get.is_some())
            .field("load", &self.load.is_some())
            .field("store", &self.store.is_some())
            .field("default", &self.default)
            .finish()
    }
}

/// One entry in a schema: an explicit discriminated variant, so there is no
/// shape sniffing to decide primitive vs. custom vs. nested.
#[derive(Debug, Clone)]
pub enum FieldSpec {
    /// Text field: validates string-ness, loads by scalar stringification,
    /// defaults to `""`.
    String,
    /// Numeric field: validates number-ness, loads with loose numeric
    /// coercion, defaults to NaN.
    Number,
    /// Flag field: validates boolean-ness, loads `1`/`"true"`-style values
    /// as `true`, defaults to `false`.
    Boolean,
    /// Caller-supplied hooks and default.
    Custom(CustomField),
    /// A nested group of fields.
    Nested(SchemaSpec),
    /// A reference to another model's constructor. Explicitly unimplemented;
    /// compilation rejects it loudly.
    Model(String),
}

impl FieldSpec {
    pub fn custom(field: CustomField) -> Self {
        FieldSpec::Custom(field)
    }

    pub fn nested(spec: SchemaSpec) -> Self {
        FieldSpec::Nested(spec)
    }
}

/// An ordered mapping from field name to [`FieldSpec`]. Declaration order is
/// preserved through compilation and serialization.
#[derive(Debug, Clone, Default)]
pub struct SchemaSpec {
    pub(crate) fields: Vec<(String, FieldSpec)>,
}

impl SchemaSpec {
    pub fn new() -> Self {
        SchemaSpec::default()
    }

    /// Append a field. Re-declaring a name replaces the earlier entry.
    pub fn field(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        let name = name.into();
        self.fields.retain(|(existing, _)| *existing != name);
        self.fields.push((name, spec));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }
}
