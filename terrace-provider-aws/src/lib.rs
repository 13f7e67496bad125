//! Terrace AWS Provider
//!
//! Manages AWS resources through the Cloud Control API.
//!
//! ## Module Structure
//!
//! - `provider` - AwsProvider and the Cloud Control calls
//! - `convert` - DSL attributes to CloudFormation properties and back
//! - `schemas` - Resource schemas of the supported types

pub mod convert;
pub mod provider;
pub mod schemas;

pub use provider::{AwsProvider, PollConfig};
pub use schemas::types::normalize_region;

use terrace_core::loader::ProviderSettings;
use terrace_core::provider::{BoxFuture, Provider, ProviderResult};
use terrace_core::resource::{Resource, ResourceId, State, Value};
use terrace_core::schema::SchemaRegistry;

/// Region used when the provider block does not name one
pub const DEFAULT_REGION: &str = "ap-southeast-2";

/// Schemas of every resource type this provider manages
pub fn schemas() -> SchemaRegistry {
    schemas::registry()
}

/// Region from a `provider aws { region = ... }` block
pub fn region_from_settings(settings: Option<&ProviderSettings>) -> String {
    match settings.and_then(|s| s.attributes.get("region")) {
        Some(Value::String(region)) => normalize_region(region),
        _ => DEFAULT_REGION.to_string(),
    }
}

// =============================================================================
// Provider Trait Implementation
// =============================================================================

impl Provider for AwsProvider {
    fn name(&self) -> &'static str {
        "aws"
    }

    fn read(
        &self,
        id: &ResourceId,
        identifier: Option<&str>,
    ) -> BoxFuture<'_, ProviderResult<State>> {
        let id = id.clone();
        let identifier = identifier.map(|s| s.to_string());
        Box::pin(async move { self.read_resource(&id, identifier.as_deref()).await })
    }

    fn create(&self, resource: &Resource) -> BoxFuture<'_, ProviderResult<State>> {
        let resource = resource.clone();
        Box::pin(async move { self.create_resource(&resource).await })
    }

    fn update(
        &self,
        id: &ResourceId,
        identifier: &str,
        from: &State,
        to: &Resource,
    ) -> BoxFuture<'_, ProviderResult<State>> {
        let id = id.clone();
        let identifier = identifier.to_string();
        let from = from.clone();
        let to = to.clone();
        Box::pin(async move { self.update_resource(&id, &identifier, &from, &to).await })
    }

    fn delete(&self, id: &ResourceId, identifier: &str) -> BoxFuture<'_, ProviderResult<()>> {
        let id = id.clone();
        let identifier = identifier.to_string();
        Box::pin(async move { self.delete_resource(&id, &identifier).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn region_defaults_and_normalizes() {
        assert_eq!(region_from_settings(None), "ap-southeast-2");

        let mut attributes = HashMap::new();
        attributes.insert(
            "region".to_string(),
            Value::String("aws.Region.us_east_1".to_string()),
        );
        let settings = ProviderSettings {
            name: "aws".to_string(),
            attributes,
        };
        assert_eq!(region_from_settings(Some(&settings)), "us-east-1");
    }

    mod issue_extractor {
        use super::super::*;
        use std::collections::HashMap;
        use std::path::PathBuf;

        use crate::convert::to_properties;
        use crate::schemas::config_for;
        use terrace_core::dependency::sort_resources;
        use terrace_core::differ::create_plan;
        use terrace_core::effect::Effect;
        use terrace_core::loader::{Config, LoadOptions, Loader};

        fn load(options: LoadOptions) -> Config {
            let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../demos/issue-extractor");
            let schemas = schemas();
            Loader::new(&schemas, options).load_path(&path).unwrap()
        }

        #[test]
        fn loads_and_orders_dependencies_first() {
            let config = load(LoadOptions::default());
            assert_eq!(config.resources.len(), 5);
            assert_eq!(config.outputs.len(), 5);
            assert_eq!(region_from_settings(config.provider("aws")), "ap-southeast-2");
            assert_eq!(
                config.backend.as_ref().map(|b| b.backend_type.as_str()),
                Some("local")
            );

            let order: Vec<String> = sort_resources(config.resources)
                .unwrap()
                .into_iter()
                .map(|r| r.binding().to_string())
                .collect();
            let position = |binding: &str| order.iter().position(|b| b == binding).unwrap();

            assert!(position("role") < position("policy"));
            assert!(position("bucket") < position("policy"));
            assert!(position("logs") < position("policy"));
            assert!(position("policy") < position("function"));
            assert!(position("logs") < position("function"));
        }

        #[test]
        fn plans_five_creates_against_empty_state() {
            let config = load(LoadOptions::default());
            let plan = create_plan(&config.resources, &HashMap::new(), &schemas()).unwrap();

            let summary = plan.summary();
            assert_eq!(summary.create, 5);
            assert!(summary.has_changes());
            assert!(plan.effects().all(|e| matches!(e, Effect::Create(_))));
        }

        #[test]
        fn secret_name_stays_sensitive() {
            let config = load(
                LoadOptions::default()
                    .with_override("github_token_secret_name", "prod/github-token")
                    .with_override("repo_owner", "rust-lang"),
            );
            let function = config.resource("function").unwrap();
            let Some(Value::Map(env)) = function.attributes.get("environment") else {
                panic!("environment is not a map");
            };

            let secret = &env["GITHUB_TOKEN_SECRET_NAME"];
            assert!(secret.is_sensitive());
            assert_eq!(secret.to_string(), "(sensitive)");
            assert_eq!(secret.expose(), Value::String("prod/github-token".to_string()));
            assert_eq!(env["REPO_OWNER"], Value::String("rust-lang".to_string()));
            assert_eq!(
                env["S3_BUCKET"],
                Value::ResourceRef("bucket".to_string(), "name".to_string())
            );
        }

        #[test]
        fn function_properties_nest_code_and_environment() {
            let config = load(LoadOptions::default());
            let function = config.resource("function").unwrap();
            assert_eq!(function.id, ResourceId::new("aws.lambda.function", "function"));

            let config = config_for("aws.lambda.function").unwrap();
            let props = to_properties(&config, &function.attributes);
            assert_eq!(
                props["Code"]["S3Bucket"],
                serde_json::json!("github-api-extraction-artifacts")
            );
            assert_eq!(
                props["Environment"]["Variables"]["REPO_NAME"],
                serde_json::json!("pandas")
            );
            assert_eq!(props["Timeout"], serde_json::json!(300));
        }
    }
}
