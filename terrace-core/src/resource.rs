//! Resource - Representing resources and their state

use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Unique identifier for a resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId {
    /// Resource type (e.g., "aws.iam.role", "aws.lambda.function")
    pub resource_type: String,
    /// Local name (the binding name in the DSL)
    pub name: String,
}

impl ResourceId {
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
        }
    }

    /// Provider name, taken from the first segment of the type (e.g., "aws")
    pub fn provider(&self) -> &str {
        self.resource_type
            .split('.')
            .next()
            .unwrap_or(&self.resource_type)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource_type, self.name)
    }
}

/// A value that must never show up in logs, plan output or persisted state
#[derive(Clone, PartialEq)]
pub struct Sensitive(Box<Value>);

impl Sensitive {
    pub fn new(value: Value) -> Self {
        match value {
            // Avoid nesting wrappers
            Value::Sensitive(inner) => inner,
            other => Self(Box::new(other)),
        }
    }

    pub fn expose(&self) -> &Value {
        &self.0
    }

    pub fn into_inner(self) -> Value {
        *self.0
    }
}

impl fmt::Debug for Sensitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sensitive(***)")
    }
}

/// Attribute value of a resource
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Int(i64),
    Bool(bool),
    List(Vec<Value>),
    Map(HashMap<String, Value>),
    /// Reference to another resource's attribute (binding_name, attribute_name)
    ResourceRef(String, String),
    /// String assembled from literal and reference parts, e.g. `"${bucket.arn}/*"`
    Interpolation(Vec<Value>),
    /// Value derived from a sensitive variable
    Sensitive(Sensitive),
}

/// Error raised while substituting references with concrete values
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ResolveError {
    #[error("reference {binding}.{attribute} cannot be resolved")]
    Unresolved { binding: String, attribute: String },

    #[error("{type_name} value cannot be interpolated into a string")]
    NotInterpolable { type_name: String },
}

impl Value {
    /// Wrap a value so it is treated as sensitive
    pub fn sensitive(value: Value) -> Self {
        Value::Sensitive(Sensitive::new(value))
    }

    /// Collect every `(binding, attribute)` pair referenced by this value
    pub fn collect_references(&self, refs: &mut Vec<(String, String)>) {
        match self {
            Value::ResourceRef(binding, attr) => refs.push((binding.clone(), attr.clone())),
            Value::List(items) | Value::Interpolation(items) => {
                for item in items {
                    item.collect_references(refs);
                }
            }
            Value::Map(map) => {
                for v in map.values() {
                    v.collect_references(refs);
                }
            }
            Value::Sensitive(inner) => inner.expose().collect_references(refs),
            Value::String(_) | Value::Int(_) | Value::Bool(_) => {}
        }
    }

    /// Returns the references of this value as a list
    pub fn references(&self) -> Vec<(String, String)> {
        let mut refs = Vec::new();
        self.collect_references(&mut refs);
        refs
    }

    /// Whether any part of this value is sensitive
    pub fn is_sensitive(&self) -> bool {
        match self {
            Value::Sensitive(_) => true,
            Value::List(items) | Value::Interpolation(items) => {
                items.iter().any(Value::is_sensitive)
            }
            Value::Map(map) => map.values().any(Value::is_sensitive),
            _ => false,
        }
    }

    /// Whether this value is free of references
    pub fn is_resolved(&self) -> bool {
        self.references().is_empty()
    }

    /// Strip sensitivity wrappers, producing the plain value sent to providers
    pub fn expose(&self) -> Value {
        match self {
            Value::Sensitive(inner) => inner.expose().expose(),
            Value::List(items) => Value::List(items.iter().map(Value::expose).collect()),
            Value::Interpolation(parts) => {
                Value::Interpolation(parts.iter().map(Value::expose).collect())
            }
            Value::Map(map) => Value::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.expose()))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Substitute references using `lookup`.
    ///
    /// `lookup` returns `Ok(Some(v))` for a known value, `Ok(None)` when the
    /// value only becomes known after apply, and an error when the reference
    /// cannot be satisfied at all. The whole value is unknown (`None`) if any
    /// of its parts is.
    pub fn resolve<F>(&self, lookup: &F) -> Result<Option<Value>, ResolveError>
    where
        F: Fn(&str, &str) -> Result<Option<Value>, ResolveError>,
    {
        match self {
            Value::ResourceRef(binding, attr) => lookup(binding, attr),
            Value::List(items) => {
                let mut resolved = Vec::with_capacity(items.len());
                for item in items {
                    match item.resolve(lookup)? {
                        Some(v) => resolved.push(v),
                        None => return Ok(None),
                    }
                }
                Ok(Some(Value::List(resolved)))
            }
            Value::Map(map) => {
                let mut resolved = HashMap::with_capacity(map.len());
                for (k, v) in map {
                    match v.resolve(lookup)? {
                        Some(v) => {
                            resolved.insert(k.clone(), v);
                        }
                        None => return Ok(None),
                    }
                }
                Ok(Some(Value::Map(resolved)))
            }
            Value::Interpolation(parts) => {
                let mut out = String::new();
                let mut sensitive = false;
                for part in parts {
                    let Some(resolved) = part.resolve(lookup)? else {
                        return Ok(None);
                    };
                    sensitive |= resolved.is_sensitive();
                    append_interpolated(&mut out, &resolved.expose())?;
                }
                let value = Value::String(out);
                Ok(Some(if sensitive {
                    Value::sensitive(value)
                } else {
                    value
                }))
            }
            Value::Sensitive(inner) => Ok(inner.expose().resolve(lookup)?.map(Value::sensitive)),
            other => Ok(Some(other.clone())),
        }
    }

    /// Convert to JSON. Sensitive values are exposed, references are rendered
    /// as `${binding.attribute}` placeholders.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Int(n) => serde_json::Value::Number((*n).into()),
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Map(map) => {
                let obj: serde_json::Map<_, _> = map
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect();
                serde_json::Value::Object(obj)
            }
            Value::ResourceRef(binding, attr) => {
                serde_json::Value::String(format!("${{{}.{}}}", binding, attr))
            }
            Value::Interpolation(parts) => {
                let mut s = String::new();
                for part in parts {
                    match part {
                        Value::String(text) => s.push_str(text),
                        other => s.push_str(&other.to_string()),
                    }
                }
                serde_json::Value::String(s)
            }
            Value::Sensitive(inner) => inner.expose().to_json(),
        }
    }

    /// Convert from JSON. `null` has no counterpart and yields `None`.
    pub fn from_json(json: &serde_json::Value) -> Option<Value> {
        match json {
            serde_json::Value::String(s) => Some(Value::String(s.clone())),
            serde_json::Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .map(Value::Int),
            serde_json::Value::Bool(b) => Some(Value::Bool(*b)),
            serde_json::Value::Array(items) => Some(Value::List(
                items.iter().filter_map(Value::from_json).collect(),
            )),
            serde_json::Value::Object(map) => Some(Value::Map(
                map.iter()
                    .filter_map(|(k, v)| Value::from_json(v).map(|v| (k.clone(), v)))
                    .collect(),
            )),
            serde_json::Value::Null => None,
        }
    }

    /// Content hash of this value (blake3 over canonical JSON).
    ///
    /// JSON objects are rendered with sorted keys, so map ordering does not
    /// affect the hash.
    pub fn content_hash(&self) -> String {
        let canonical = self.to_json().to_string();
        blake3::hash(canonical.as_bytes()).to_hex().to_string()
    }
}

fn append_interpolated(out: &mut String, value: &Value) -> Result<(), ResolveError> {
    match value {
        Value::String(s) => out.push_str(s),
        Value::Int(n) => out.push_str(&n.to_string()),
        Value::Bool(b) => out.push_str(&b.to_string()),
        other => {
            return Err(ResolveError::NotInterpolable {
                type_name: other.type_name(),
            });
        }
    }
    Ok(())
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "\"{}\"", s),
            Value::Int(n) => write!(f, "{}", n),
            Value::Bool(b) => write!(f, "{}", b),
            Value::List(items) => {
                let strs: Vec<_> = items.iter().map(|v| v.to_string()).collect();
                write!(f, "[{}]", strs.join(", "))
            }
            Value::Map(map) => {
                let mut keys: Vec<_> = map.keys().collect();
                keys.sort();
                let strs: Vec<_> = keys
                    .into_iter()
                    .map(|k| format!("{}: {}", k, map[k]))
                    .collect();
                write!(f, "{{{}}}", strs.join(", "))
            }
            Value::ResourceRef(binding, attr) => write!(f, "{}.{}", binding, attr),
            Value::Interpolation(parts) => {
                write!(f, "\"")?;
                for part in parts {
                    match part {
                        Value::String(s) => write!(f, "{}", s)?,
                        other => write!(f, "${{{}}}", other)?,
                    }
                }
                write!(f, "\"")
            }
            Value::Sensitive(_) => write!(f, "(sensitive)"),
        }
    }
}

/// Desired state declared in DSL
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    pub id: ResourceId,
    pub attributes: HashMap<String, Value>,
    /// Explicit ordering hints (binding names from `depends_on`)
    pub depends_on: Vec<String>,
}

impl Resource {
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: ResourceId::new(resource_type, name),
            attributes: HashMap::new(),
            depends_on: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn with_dependency(mut self, binding: impl Into<String>) -> Self {
        self.depends_on.push(binding.into());
        self
    }

    /// Binding name used by other resources to reference this one
    pub fn binding(&self) -> &str {
        &self.id.name
    }

    /// Binding names this resource depends on, implicitly or explicitly
    pub fn dependency_bindings(&self) -> BTreeSet<String> {
        let mut deps: BTreeSet<String> = self.depends_on.iter().cloned().collect();
        for value in self.attributes.values() {
            for (binding, _) in value.references() {
                deps.insert(binding);
            }
        }
        deps
    }
}

/// Persisted state of a resource, as last recorded after a confirmed operation
#[derive(Debug, Clone, PartialEq)]
pub struct State {
    pub id: ResourceId,
    /// Provider-side identifier (e.g., a role name or function name)
    pub identifier: Option<String>,
    /// Last-known attributes: non-sensitive arguments plus computed attributes
    pub attributes: HashMap<String, Value>,
    /// Per-argument content hashes of the values used for the last operation
    pub argument_hashes: HashMap<String, String>,
    /// Resources this one depended on when it was last applied
    pub dependencies: Vec<ResourceId>,
    /// Last operation did not confirm success
    pub tainted: bool,
    /// Identifier of an old object left behind by a create-before-destroy replacement
    pub deposed: Option<String>,
    /// Whether this state exists
    pub exists: bool,
}

impl State {
    pub fn not_found(id: ResourceId) -> Self {
        Self {
            id,
            identifier: None,
            attributes: HashMap::new(),
            argument_hashes: HashMap::new(),
            dependencies: Vec::new(),
            tainted: false,
            deposed: None,
            exists: false,
        }
    }

    pub fn existing(id: ResourceId, attributes: HashMap<String, Value>) -> Self {
        Self {
            attributes,
            exists: true,
            ..Self::not_found(id)
        }
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    pub fn with_argument_hashes(mut self, hashes: HashMap<String, String>) -> Self {
        self.argument_hashes = hashes;
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<ResourceId>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_tainted(mut self, tainted: bool) -> Self {
        self.tainted = tainted;
        self
    }

    /// Combined hash over all argument hashes
    pub fn arguments_hash(&self) -> String {
        let mut entries: Vec<_> = self.argument_hashes.iter().collect();
        entries.sort();
        let mut hasher = blake3::Hasher::new();
        for (name, hash) in entries {
            hasher.update(name.as_bytes());
            hasher.update(b"=");
            hasher.update(hash.as_bytes());
            hasher.update(b"\n");
        }
        hasher.finalize().to_hex().to_string()
    }
}

/// Hash each resolved argument. Internal attributes (starting with `_`) are skipped.
pub fn argument_hashes(attributes: &HashMap<String, Value>) -> HashMap<String, String> {
    attributes
        .iter()
        .filter(|(k, _)| !k.starts_with('_'))
        .map(|(k, v)| (k.clone(), v.content_hash()))
        .collect()
}

/// Attributes that may be written to persisted state (sensitive ones dropped)
pub fn persistable_attributes(attributes: &HashMap<String, Value>) -> HashMap<String, Value> {
    attributes
        .iter()
        .filter(|(_, v)| !v.is_sensitive())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
