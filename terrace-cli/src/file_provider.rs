//! File-based local Provider
//!
//! Stands in for a cloud platform when no `provider` block is configured or
//! `--offline` is given. Objects are kept in a JSON file keyed by resource
//! type and identifier; computed attributes are synthesized from the
//! identifier.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use terrace_core::provider::{BoxFuture, Provider, ProviderError, ProviderResult};
use terrace_core::resource::{Resource, ResourceId, State, Value};
use terrace_core::schema::SchemaRegistry;

/// resource type -> identifier -> attributes
type Objects = BTreeMap<String, BTreeMap<String, serde_json::Map<String, serde_json::Value>>>;

pub struct FileProvider {
    objects_file: PathBuf,
    schemas: SchemaRegistry,
    guard: Mutex<()>,
}

impl FileProvider {
    pub const DEFAULT_FILE: &'static str = ".terrace/objects.json";

    pub fn new(schemas: SchemaRegistry) -> Self {
        Self::with_path(PathBuf::from(Self::DEFAULT_FILE), schemas)
    }

    pub fn with_path(objects_file: PathBuf, schemas: SchemaRegistry) -> Self {
        Self {
            objects_file,
            schemas,
            guard: Mutex::new(()),
        }
    }

    fn load(&self) -> ProviderResult<Objects> {
        match fs::read_to_string(&self.objects_file) {
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                ProviderError::new(format!(
                    "Failed to parse {}: {}",
                    self.objects_file.display(),
                    e
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Objects::new()),
            Err(e) => Err(ProviderError::new(format!(
                "Failed to read {}: {}",
                self.objects_file.display(),
                e
            ))
            .with_cause(e)),
        }
    }

    fn save(&self, objects: &Objects) -> ProviderResult<()> {
        let write = || -> std::io::Result<()> {
            if let Some(parent) = self.objects_file.parent()
                && !parent.as_os_str().is_empty()
            {
                fs::create_dir_all(parent)?;
            }
            let content = serde_json::to_string_pretty(objects)?;
            fs::write(&self.objects_file, content)
        };
        write().map_err(|e| ProviderError::new(format!("Failed to save objects: {}", e)))
    }

    /// Run `f` on the object file while holding the file guard
    fn with_objects<T>(
        &self,
        f: impl FnOnce(&mut Objects) -> ProviderResult<(T, bool)>,
    ) -> ProviderResult<T> {
        let _guard = self
            .guard
            .lock()
            .map_err(|_| ProviderError::new("object file guard poisoned"))?;
        let mut objects = self.load()?;
        let (result, changed) = f(&mut objects)?;
        if changed {
            self.save(&objects)?;
        }
        Ok(result)
    }

    fn identifier_for(resource: &Resource) -> String {
        match resource.attributes.get("name").map(Value::expose) {
            Some(Value::String(name)) => name,
            _ => resource.id.name.clone(),
        }
    }

    /// Attributes as the platform would report them, computed ones included
    fn materialize(
        &self,
        resource: &Resource,
        identifier: &str,
    ) -> serde_json::Map<String, serde_json::Value> {
        let mut attrs: serde_json::Map<String, serde_json::Value> = resource
            .attributes
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        if let Some(schema) = self.schemas.get(&resource.id.resource_type) {
            for (name, attr) in &schema.attributes {
                if !attr.computed {
                    continue;
                }
                let value = if name == "arn" {
                    format!("arn:terrace:local:{}/{}", resource.id.resource_type, identifier)
                } else {
                    format!("{}-{}", identifier, name)
                };
                attrs.insert(name.clone(), serde_json::Value::String(value));
            }
        }
        attrs
    }

    fn to_state(
        id: ResourceId,
        identifier: &str,
        attrs: &serde_json::Map<String, serde_json::Value>,
    ) -> State {
        let attributes: HashMap<String, Value> = attrs
            .iter()
            .filter_map(|(k, v)| Value::from_json(v).map(|v| (k.clone(), v)))
            .collect();
        State::existing(id, attributes).with_identifier(identifier)
    }
}

impl Provider for FileProvider {
    fn name(&self) -> &'static str {
        "file"
    }

    fn read(
        &self,
        id: &ResourceId,
        identifier: Option<&str>,
    ) -> BoxFuture<'_, ProviderResult<State>> {
        let id = id.clone();
        let identifier = identifier.map(str::to_string);
        Box::pin(async move {
            let Some(identifier) = identifier else {
                return Ok(State::not_found(id));
            };
            self.with_objects(|objects| {
                let state = match objects
                    .get(&id.resource_type)
                    .and_then(|of_type| of_type.get(&identifier))
                {
                    Some(attrs) => Self::to_state(id.clone(), &identifier, attrs),
                    None => State::not_found(id.clone()),
                };
                Ok((state, false))
            })
        })
    }

    fn create(&self, resource: &Resource) -> BoxFuture<'_, ProviderResult<State>> {
        let resource = resource.clone();
        Box::pin(async move {
            let identifier = Self::identifier_for(&resource);
            let attrs = self.materialize(&resource, &identifier);
            self.with_objects(|objects| {
                let of_type = objects.entry(resource.id.resource_type.clone()).or_default();
                if of_type.contains_key(&identifier) {
                    return Err(ProviderError::new(format!(
                        "{} {} already exists",
                        resource.id.resource_type, identifier
                    ))
                    .for_resource(resource.id.clone()));
                }
                of_type.insert(identifier.clone(), attrs.clone());
                Ok((Self::to_state(resource.id.clone(), &identifier, &attrs), true))
            })
        })
    }

    fn update(
        &self,
        id: &ResourceId,
        identifier: &str,
        _from: &State,
        to: &Resource,
    ) -> BoxFuture<'_, ProviderResult<State>> {
        let id = id.clone();
        let identifier = identifier.to_string();
        let to = to.clone();
        Box::pin(async move {
            let attrs = self.materialize(&to, &identifier);
            self.with_objects(|objects| {
                let Some(existing) = objects
                    .get_mut(&id.resource_type)
                    .and_then(|of_type| of_type.get_mut(&identifier))
                else {
                    return Err(ProviderError::new(format!("{} does not exist", identifier))
                        .for_resource(id.clone()));
                };
                *existing = attrs.clone();
                Ok((Self::to_state(id.clone(), &identifier, &attrs), true))
            })
        })
    }

    fn delete(&self, id: &ResourceId, identifier: &str) -> BoxFuture<'_, ProviderResult<()>> {
        let id = id.clone();
        let identifier = identifier.to_string();
        Box::pin(async move {
            self.with_objects(|objects| {
                let removed = objects
                    .get_mut(&id.resource_type)
                    .and_then(|of_type| of_type.remove(&identifier))
                    .is_some();
                Ok(((), removed))
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn provider(dir: &tempfile::TempDir) -> FileProvider {
        FileProvider::with_path(
            dir.path().join("objects.json"),
            terrace_provider_aws::schemas(),
        )
    }

    fn role() -> Resource {
        Resource::new("aws.iam.role", "role")
            .with_attribute("name", Value::String("github-issue-extractor".to_string()))
    }

    #[tokio::test]
    async fn create_read_delete() {
        let dir = tempdir().unwrap();
        let provider = provider(&dir);

        let state = provider.create(&role()).await.unwrap();
        assert_eq!(state.identifier.as_deref(), Some("github-issue-extractor"));
        assert_eq!(
            state.attributes.get("arn"),
            Some(&Value::String(
                "arn:terrace:local:aws.iam.role/github-issue-extractor".to_string()
            ))
        );

        let id = ResourceId::new("aws.iam.role", "role");
        let read = provider
            .read(&id, Some("github-issue-extractor"))
            .await
            .unwrap();
        assert!(read.exists);

        provider.delete(&id, "github-issue-extractor").await.unwrap();
        let read = provider
            .read(&id, Some("github-issue-extractor"))
            .await
            .unwrap();
        assert!(!read.exists);

        // Deleting again succeeds
        provider.delete(&id, "github-issue-extractor").await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let dir = tempdir().unwrap();
        let provider = provider(&dir);
        provider.create(&role()).await.unwrap();
        assert!(provider.create(&role()).await.is_err());
    }

    #[tokio::test]
    async fn demo_applies_and_converges() {
        use std::sync::Arc;
        use terrace_core::differ::create_plan;
        use terrace_core::interpreter::Interpreter;
        use terrace_core::loader::{LoadOptions, Loader};
        use terrace_core::output::bind_outputs;
        use terrace_core::store::{MemoryStore, StateStore};

        let dir = tempdir().unwrap();
        let schemas = terrace_provider_aws::schemas();
        let demo = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../demos/issue-extractor");
        let config = Loader::new(&schemas, LoadOptions::default())
            .load_path(&demo)
            .unwrap();

        let store = Arc::new(MemoryStore::new());
        let interpreter = Interpreter::new(provider(&dir));
        let plan = create_plan(&config.resources, &HashMap::new(), &schemas).unwrap();
        let result = interpreter.apply(&plan, store.clone()).await;
        assert!(result.is_success());
        assert_eq!(result.success_count(), 5);

        let states = store.snapshot().await.unwrap();
        let replan = create_plan(&config.resources, &states, &schemas).unwrap();
        assert!(!replan.summary().has_changes());

        let outputs = bind_outputs(&config.outputs, &config.resources, &states).unwrap();
        assert_eq!(
            outputs["function_arn"].display_value(),
            "arn:terrace:local:aws.lambda.function/github-issue-extractor"
        );
        assert_eq!(
            outputs["bucket_name"].display_value(),
            "github-api-extraction-bucket"
        );
    }
}
