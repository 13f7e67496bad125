//! State file structures for persisting resource records

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use terrace_core::resource::{ResourceId, State, Value};

/// The main state file structure that persists to the backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateFile {
    /// State file format version
    pub version: u32,
    /// Monotonically increasing number for each state modification
    pub serial: u64,
    /// Unique identifier for this state lineage (prevents accidental overwrites)
    pub lineage: String,
    /// Version of Terrace that last modified this state
    pub terrace_version: String,
    /// All managed resources and their current state
    pub resources: Vec<ResourceState>,
}

impl StateFile {
    /// Current state file format version
    pub const CURRENT_VERSION: u32 = 1;

    /// Create a new empty state file
    pub fn new() -> Self {
        Self::with_lineage(uuid::Uuid::new_v4().to_string())
    }

    /// Create a new state file with a specific lineage
    pub fn with_lineage(lineage: String) -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            serial: 0,
            lineage,
            terrace_version: env!("CARGO_PKG_VERSION").to_string(),
            resources: Vec::new(),
        }
    }

    /// Increment serial and update terrace version for a new state write
    pub fn increment_serial(&mut self) {
        self.serial += 1;
        self.terrace_version = env!("CARGO_PKG_VERSION").to_string();
    }

    /// Find a resource by type and name
    pub fn find_resource(&self, resource_type: &str, name: &str) -> Option<&ResourceState> {
        self.resources
            .iter()
            .find(|r| r.resource_type == resource_type && r.name == name)
    }

    /// Find a resource mutably by type and name
    pub fn find_resource_mut(
        &mut self,
        resource_type: &str,
        name: &str,
    ) -> Option<&mut ResourceState> {
        self.resources
            .iter_mut()
            .find(|r| r.resource_type == resource_type && r.name == name)
    }

    /// Add or update a resource in the state
    pub fn upsert_resource(&mut self, resource: ResourceState) {
        if let Some(existing) = self.find_resource_mut(&resource.resource_type, &resource.name) {
            *existing = resource;
        } else {
            self.resources.push(resource);
        }
    }

    /// Remove a resource from the state
    pub fn remove_resource(&mut self, resource_type: &str, name: &str) -> Option<ResourceState> {
        let pos = self
            .resources
            .iter()
            .position(|r| r.resource_type == resource_type && r.name == name)?;
        Some(self.resources.remove(pos))
    }

    /// All records as engine states, keyed by resource id
    pub fn states(&self) -> HashMap<ResourceId, State> {
        self.resources
            .iter()
            .map(|r| {
                let state = r.to_state();
                (state.id.clone(), state)
            })
            .collect()
    }
}

impl Default for StateFile {
    fn default() -> Self {
        Self::new()
    }
}

/// State of a single managed resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    /// Resource type (e.g., "aws.lambda.function")
    pub resource_type: String,
    /// Binding name from the DSL
    pub name: String,
    /// Provider name (e.g., "aws")
    pub provider: String,
    /// Platform identifier of the object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    /// Last-known attributes; sensitive values are never written
    pub attributes: HashMap<String, serde_json::Value>,
    /// Content hash of each argument the object was last applied with
    #[serde(default)]
    pub argument_hashes: BTreeMap<String, String>,
    /// Resources this one depended on, as `type.name`
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub tainted: bool,
    /// Identifier of a replaced object whose deletion is still pending
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deposed: Option<String>,
}

impl ResourceState {
    /// Create a new resource state
    pub fn new(
        resource_type: impl Into<String>,
        name: impl Into<String>,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
            provider: provider.into(),
            identifier: None,
            attributes: HashMap::new(),
            argument_hashes: BTreeMap::new(),
            dependencies: Vec::new(),
            tainted: false,
            deposed: None,
        }
    }

    /// Set an attribute value
    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    pub fn id(&self) -> ResourceId {
        ResourceId::new(&self.resource_type, &self.name)
    }

    /// Persistable form of an engine state
    pub fn from_state(state: &State) -> Self {
        let attributes = state
            .attributes
            .iter()
            .filter(|(_, v)| !v.is_sensitive())
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();

        Self {
            resource_type: state.id.resource_type.clone(),
            name: state.id.name.clone(),
            provider: state.id.provider().to_string(),
            identifier: state.identifier.clone(),
            attributes,
            argument_hashes: state
                .argument_hashes
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            dependencies: state.dependencies.iter().map(|d| d.to_string()).collect(),
            tainted: state.tainted,
            deposed: state.deposed.clone(),
        }
    }

    /// Engine state of this record
    pub fn to_state(&self) -> State {
        let attributes = self
            .attributes
            .iter()
            .filter_map(|(k, v)| Value::from_json(v).map(|v| (k.clone(), v)))
            .collect();

        let mut state = State::existing(self.id(), attributes)
            .with_argument_hashes(
                self.argument_hashes
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            )
            .with_dependencies(self.dependencies.iter().filter_map(|d| parse_id(d)).collect())
            .with_tainted(self.tainted);
        state.identifier = self.identifier.clone();
        state.deposed = self.deposed.clone();
        state
    }
}

/// Parse `type.name`; the name is the final segment
fn parse_id(value: &str) -> Option<ResourceId> {
    let (resource_type, name) = value.rsplit_once('.')?;
    Some(ResourceId::new(resource_type, name))
}
