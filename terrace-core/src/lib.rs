//! Terrace Core
//!
//! Core library for a declarative provisioning engine: documents are loaded
//! into a desired-state graph, ordered, reconciled against persisted state into
//! a Plan of Effects, and the Plan is executed through a Provider.

pub mod dependency;
pub mod differ;
pub mod effect;
pub mod interpreter;
pub mod loader;
pub mod output;
pub mod parser;
pub mod plan;
pub mod provider;
pub mod refresh;
pub mod resource;
pub mod schema;
pub mod store;

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use crate::differ::{PlanError, create_plan, destroy_plan};
    use crate::interpreter::Interpreter;
    use crate::loader::{LoadOptions, Loader};
    use crate::output::bind_outputs;
    use crate::provider::{BoxFuture, Provider, ProviderResult};
    use crate::resource::{Resource, ResourceId, State, Value};
    use crate::schema::{AttributeSchema, AttributeType, ResourceSchema, SchemaRegistry};
    use crate::store::{MemoryStore, StateStore};

    /// Keeps created objects in a map keyed by identifier
    #[derive(Default)]
    struct InMemoryProvider {
        objects: Mutex<HashMap<String, HashMap<String, Value>>>,
        next: AtomicUsize,
    }

    impl Provider for InMemoryProvider {
        fn name(&self) -> &'static str {
            "memory"
        }

        fn read(
            &self,
            id: &ResourceId,
            identifier: Option<&str>,
        ) -> BoxFuture<'_, ProviderResult<State>> {
            let found = identifier.and_then(|i| self.objects.lock().unwrap().get(i).cloned());
            let state = match (found, identifier) {
                (Some(attrs), Some(i)) => State::existing(id.clone(), attrs).with_identifier(i),
                _ => State::not_found(id.clone()),
            };
            Box::pin(async move { Ok(state) })
        }

        fn create(&self, resource: &Resource) -> BoxFuture<'_, ProviderResult<State>> {
            let serial = self.next.fetch_add(1, Ordering::SeqCst);
            let identifier = format!("{}-{}", resource.id.name, serial);
            let mut attrs = resource.attributes.clone();
            attrs.insert(
                "arn".to_string(),
                Value::String(format!("arn:memory:{}", resource.id.name)),
            );
            self.objects
                .lock()
                .unwrap()
                .insert(identifier.clone(), attrs.clone());
            let state = State::existing(resource.id.clone(), attrs).with_identifier(identifier);
            Box::pin(async move { Ok(state) })
        }

        fn update(
            &self,
            id: &ResourceId,
            identifier: &str,
            _from: &State,
            to: &Resource,
        ) -> BoxFuture<'_, ProviderResult<State>> {
            self.objects
                .lock()
                .unwrap()
                .insert(identifier.to_string(), to.attributes.clone());
            let state = State::existing(id.clone(), to.attributes.clone()).with_identifier(identifier);
            Box::pin(async move { Ok(state) })
        }

        fn delete(&self, _id: &ResourceId, identifier: &str) -> BoxFuture<'_, ProviderResult<()>> {
            self.objects.lock().unwrap().remove(identifier);
            Box::pin(async move { Ok(()) })
        }
    }

    fn registry() -> SchemaRegistry {
        let thing = |resource_type: &str| {
            ResourceSchema::new(resource_type)
                .attribute(AttributeSchema::new("name", AttributeType::String).force_new())
                .attribute(AttributeSchema::new("peer", AttributeType::String))
                .attribute(AttributeSchema::new("arn", AttributeType::String).computed())
        };
        SchemaRegistry::new()
            .with(thing("memory.role"))
            .with(thing("memory.function"))
    }

    const DOCUMENT: &str = r#"
        variable prefix: string { default = "extractor" }

        let role = memory.role {
            name = "${var.prefix}-role"
        }

        let function = memory.function {
            name = var.prefix
            peer = role.arn
        }

        output function_arn { value = function.arn }
        output role_name { value = role.name }
    "#;

    #[tokio::test]
    async fn load_plan_apply_and_bind_outputs() {
        let schemas = registry();
        let config = Loader::new(&schemas, LoadOptions::default())
            .load_str(DOCUMENT)
            .unwrap();
        let store = Arc::new(MemoryStore::new());
        let interpreter = Interpreter::new(InMemoryProvider::default());

        let plan = create_plan(&config.resources, &HashMap::new(), &schemas).unwrap();
        assert_eq!(plan.summary().create, 2);

        let result = interpreter.apply(&plan, store.clone()).await;
        assert!(result.is_success());
        assert_eq!(result.success_count(), 2);

        let states = store.snapshot().await.unwrap();
        let function = &states[&ResourceId::new("memory.function", "function")];
        assert_eq!(
            function.attributes.get("peer"),
            Some(&Value::String("arn:memory:role".to_string()))
        );

        let replan = create_plan(&config.resources, &states, &schemas).unwrap();
        assert!(!replan.summary().has_changes());

        let outputs = bind_outputs(&config.outputs, &config.resources, &states).unwrap();
        assert_eq!(outputs["function_arn"].display_value(), "arn:memory:function");
        assert_eq!(outputs["role_name"].display_value(), "extractor-role");
    }

    #[tokio::test]
    async fn changed_variable_replaces_and_destroy_empties_store() {
        let schemas = registry();
        let store = Arc::new(MemoryStore::new());
        let interpreter = Interpreter::new(InMemoryProvider::default());

        let first = Loader::new(&schemas, LoadOptions::default())
            .load_str(DOCUMENT)
            .unwrap();
        let plan = create_plan(&first.resources, &HashMap::new(), &schemas).unwrap();
        assert!(interpreter.apply(&plan, store.clone()).await.is_success());

        let renamed = Loader::new(&schemas, LoadOptions::default().with_override("prefix", "scraper"))
            .load_str(DOCUMENT)
            .unwrap();
        let states = store.snapshot().await.unwrap();
        let plan = create_plan(&renamed.resources, &states, &schemas).unwrap();
        assert_eq!(plan.summary().replace, 2);
        assert!(interpreter.apply(&plan, store.clone()).await.is_success());

        let states = store.snapshot().await.unwrap();
        let plan = destroy_plan(&states).unwrap();
        assert_eq!(plan.summary().delete, 2);
        assert!(interpreter.apply(&plan, store.clone()).await.is_success());
        assert!(store.snapshot().await.unwrap().is_empty());
    }

    #[test]
    fn reference_cycle_is_rejected_with_members() {
        let schemas = registry();
        let config = Loader::new(&schemas, LoadOptions::default())
            .load_str(
                r#"
                let role = memory.role { peer = function.arn }
                let function = memory.function { peer = role.arn }
                "#,
            )
            .unwrap();

        let Err(PlanError::Cycle(error)) = create_plan(&config.resources, &HashMap::new(), &schemas)
        else {
            panic!("cycle was not detected");
        };
        let members: Vec<String> = error.members().into_iter().map(|id| id.to_string()).collect();
        assert_eq!(members, vec!["memory.function.function", "memory.role.role"]);
    }
}
