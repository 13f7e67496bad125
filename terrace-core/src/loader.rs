//! Loader - Turn parsed documents into a validated desired-state configuration
//!
//! Binds variables (CLI override, then `TERRACE_VAR_<name>`, then default),
//! evaluates `env()` calls, validates every resource against its schema and
//! checks that every reference points at a declared binding.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::parser::{self, Expr, ParseError, ParsedFile, TypeExpr, VariableDecl};
use crate::resource::{Resource, ResourceId, Value};
use crate::schema::{SchemaRegistry, TypeError};

/// Prefix of environment variables that set DSL variables
pub const VARIABLE_ENV_PREFIX: &str = "TERRACE_VAR_";

/// File extension of declaration documents
pub const FILE_EXTENSION: &str = "trc";

/// Load error
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("{}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: ParseError,
    },

    #[error("Failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No .trc files found in {}", .0.display())]
    NoDocuments(PathBuf),

    #[error("Type error in {context}: {}", errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))]
    Type {
        context: String,
        errors: Vec<TypeError>,
    },

    #[error("Unknown variable '{name}' ({context})")]
    UnknownVariable { name: String, context: String },

    #[error("Variable '{name}' has no default and no value was supplied")]
    MissingRequiredVariable { name: String },

    #[error("Duplicate resource {0}")]
    DuplicateResource(String),

    #[error("Duplicate {kind} '{name}'")]
    DuplicateDeclaration { kind: &'static str, name: String },

    #[error("Unknown resource type '{resource_type}' for binding '{binding}'")]
    UnknownResourceType {
        binding: String,
        resource_type: String,
    },

    #[error("Dangling reference {reference} in {context}: {reason}")]
    DanglingReference {
        context: String,
        reference: String,
        reason: String,
    },

    #[error("Environment variable not set: {0}")]
    EnvVarNotSet(String),

    #[error("Invalid expression in {context}: {message}")]
    InvalidExpression { context: String, message: String },
}

/// Provider block with evaluated attributes
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub name: String,
    pub attributes: HashMap<String, Value>,
}

/// Backend block with evaluated attributes
#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub backend_type: String,
    pub attributes: HashMap<String, Value>,
}

impl BackendSettings {
    /// Get a string attribute
    pub fn get_string(&self, key: &str) -> Option<&str> {
        match self.attributes.get(key) {
            Some(Value::String(s)) => Some(s),
            _ => None,
        }
    }

    /// Get a boolean attribute
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.attributes.get(key) {
            Some(Value::Bool(b)) => Some(*b),
            _ => None,
        }
    }
}

impl ProviderSettings {
    /// Get a string attribute
    pub fn get_string(&self, key: &str) -> Option<&str> {
        match self.attributes.get(key) {
            Some(Value::String(s)) => Some(s),
            _ => None,
        }
    }
}

/// A variable bound for this run
#[derive(Debug, Clone, PartialEq)]
pub struct BoundVariable {
    pub type_expr: TypeExpr,
    /// Bound value; wrapped in `Value::Sensitive` when the variable is sensitive
    pub value: Value,
    pub sensitive: bool,
}

/// Declared output
#[derive(Debug, Clone, PartialEq)]
pub struct Output {
    pub name: String,
    pub value: Value,
    pub sensitive: bool,
    pub description: Option<String>,
}

/// Validated desired state
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub providers: Vec<ProviderSettings>,
    pub backend: Option<BackendSettings>,
    pub variables: BTreeMap<String, BoundVariable>,
    pub resources: Vec<Resource>,
    pub outputs: Vec<Output>,
}

impl Config {
    pub fn provider(&self, name: &str) -> Option<&ProviderSettings> {
        self.providers.iter().find(|p| p.name == name)
    }

    pub fn resource(&self, binding: &str) -> Option<&Resource> {
        self.resources.iter().find(|r| r.binding() == binding)
    }

    pub fn output(&self, name: &str) -> Option<&Output> {
        self.outputs.iter().find(|o| o.name == name)
    }
}

/// Caller-supplied inputs to loading
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// `--var name=value` overrides
    pub overrides: HashMap<String, String>,
    /// Environment used for `TERRACE_VAR_*` and `env()`
    pub environment: HashMap<String, String>,
}

impl LoadOptions {
    /// Options using the process environment
    pub fn from_process_env() -> Self {
        Self {
            overrides: HashMap::new(),
            environment: std::env::vars().collect(),
        }
    }

    pub fn with_override(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.insert(name.into(), value.into());
        self
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(name.into(), value.into());
        self
    }
}

/// Loads declaration documents against a schema registry
pub struct Loader<'a> {
    schemas: &'a SchemaRegistry,
    options: LoadOptions,
}

impl<'a> Loader<'a> {
    pub fn new(schemas: &'a SchemaRegistry, options: LoadOptions) -> Self {
        Self { schemas, options }
    }

    /// Load a single document or every `.trc` document in a directory
    pub fn load_path(&self, path: &Path) -> Result<Config, LoadError> {
        let files = if path.is_dir() {
            let entries = fs::read_dir(path).map_err(|source| LoadError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            let mut files: Vec<PathBuf> = entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.extension().is_some_and(|ext| ext == FILE_EXTENSION))
                .collect();
            files.sort();
            if files.is_empty() {
                return Err(LoadError::NoDocuments(path.to_path_buf()));
            }
            files
        } else {
            vec![path.to_path_buf()]
        };

        let mut merged = ParsedFile::default();
        for file in &files {
            let content = fs::read_to_string(file).map_err(|source| LoadError::Io {
                path: file.clone(),
                source,
            })?;
            let parsed = parser::parse(&content).map_err(|source| LoadError::Parse {
                path: file.clone(),
                source,
            })?;
            merged.merge(parsed).map_err(|source| LoadError::Parse {
                path: file.clone(),
                source,
            })?;
        }
        log::debug!("Parsed {} document(s) from {}", files.len(), path.display());

        self.load_parsed(merged)
    }

    /// Load a document held in memory
    pub fn load_str(&self, input: &str) -> Result<Config, LoadError> {
        let parsed = parser::parse(input).map_err(|source| LoadError::Parse {
            path: PathBuf::from("<input>"),
            source,
        })?;
        self.load_parsed(parsed)
    }

    /// Validate a parsed (possibly merged) document set
    pub fn load_parsed(&self, parsed: ParsedFile) -> Result<Config, LoadError> {
        let variables = self.bind_variables(&parsed.variables)?;
        let scope = Scope {
            variables: &variables,
            environment: &self.options.environment,
        };

        let mut providers: Vec<ProviderSettings> = Vec::new();
        for provider in &parsed.providers {
            if providers.iter().any(|p| p.name == provider.name) {
                return Err(LoadError::DuplicateDeclaration {
                    kind: "provider",
                    name: provider.name.clone(),
                });
            }
            let context = format!("provider {}", provider.name);
            providers.push(ProviderSettings {
                name: provider.name.clone(),
                attributes: scope.eval_concrete_map(&provider.attributes, &context)?,
            });
        }

        let backend = match &parsed.backend {
            Some(b) => {
                let context = format!("backend {}", b.backend_type);
                Some(BackendSettings {
                    backend_type: b.backend_type.clone(),
                    attributes: scope.eval_concrete_map(&b.attributes, &context)?,
                })
            }
            None => None,
        };

        let resources = self.load_resources(&parsed, &scope)?;
        let outputs = self.load_outputs(&parsed, &scope, &resources)?;

        log::info!(
            "Loaded {} resource(s), {} variable(s), {} output(s)",
            resources.len(),
            variables.len(),
            outputs.len()
        );

        Ok(Config {
            providers,
            backend,
            variables,
            resources,
            outputs,
        })
    }

    fn bind_variables(
        &self,
        decls: &[VariableDecl],
    ) -> Result<BTreeMap<String, BoundVariable>, LoadError> {
        let declared: HashSet<&str> = decls.iter().map(|d| d.name.as_str()).collect();
        let mut unknown: Vec<&String> = self
            .options
            .overrides
            .keys()
            .filter(|name| !declared.contains(name.as_str()))
            .collect();
        unknown.sort();
        if let Some(name) = unknown.first() {
            return Err(LoadError::UnknownVariable {
                name: (*name).clone(),
                context: "--var override".to_string(),
            });
        }

        let empty = BTreeMap::new();
        let default_scope = Scope {
            variables: &empty,
            environment: &self.options.environment,
        };

        let mut bound = BTreeMap::new();
        for decl in decls {
            if bound.contains_key(&decl.name) {
                return Err(LoadError::DuplicateDeclaration {
                    kind: "variable",
                    name: decl.name.clone(),
                });
            }
            let context = format!("variable {}", decl.name);
            let env_key = format!("{}{}", VARIABLE_ENV_PREFIX, decl.name);

            let value = if let Some(raw) = self.options.overrides.get(&decl.name) {
                convert_raw(raw, &decl.type_expr, &context)?
            } else if let Some(raw) = self.options.environment.get(&env_key) {
                convert_raw(raw, &decl.type_expr, &context)?
            } else if let Some(default) = &decl.default {
                default_scope.eval_concrete(default, &context)?
            } else {
                return Err(LoadError::MissingRequiredVariable {
                    name: decl.name.clone(),
                });
            };

            check_type(&decl.type_expr, &value).map_err(|e| LoadError::Type {
                context: context.clone(),
                errors: vec![e],
            })?;

            let value = if decl.sensitive {
                Value::sensitive(value)
            } else {
                value
            };
            bound.insert(
                decl.name.clone(),
                BoundVariable {
                    type_expr: decl.type_expr.clone(),
                    value,
                    sensitive: decl.sensitive,
                },
            );
        }
        Ok(bound)
    }

    fn load_resources(
        &self,
        parsed: &ParsedFile,
        scope: &Scope<'_>,
    ) -> Result<Vec<Resource>, LoadError> {
        let mut bindings: HashMap<&str, &str> = HashMap::new();
        for decl in &parsed.resources {
            if let Some(existing_type) = bindings.insert(&decl.binding, &decl.resource_type) {
                let first = ResourceId::new(existing_type, decl.binding.clone());
                let second = ResourceId::new(decl.resource_type.clone(), decl.binding.clone());
                let id = if first == second {
                    first.to_string()
                } else {
                    format!("{} (also declared as {})", second, first)
                };
                return Err(LoadError::DuplicateResource(id));
            }
            if self.schemas.get(&decl.resource_type).is_none() {
                return Err(LoadError::UnknownResourceType {
                    binding: decl.binding.clone(),
                    resource_type: decl.resource_type.clone(),
                });
            }
        }

        let mut resources = Vec::with_capacity(parsed.resources.len());
        for decl in &parsed.resources {
            let id = ResourceId::new(decl.resource_type.clone(), decl.binding.clone());
            let context = id.to_string();

            let mut attributes = HashMap::new();
            for (key, expr) in &decl.attributes {
                attributes.insert(key.clone(), scope.eval(expr, &context)?);
            }

            if let Some(schema) = self.schemas.get(&decl.resource_type) {
                schema
                    .validate(&attributes)
                    .map_err(|errors| LoadError::Type {
                        context: context.clone(),
                        errors,
                    })?;
            }

            for value in attributes.values() {
                for (binding, attribute) in value.references() {
                    self.check_reference(&bindings, &binding, &attribute, &context)?;
                }
            }
            for dep in &decl.depends_on {
                if !bindings.contains_key(dep.as_str()) {
                    return Err(LoadError::DanglingReference {
                        context: context.clone(),
                        reference: dep.clone(),
                        reason: "depends_on names an undeclared binding".to_string(),
                    });
                }
            }

            resources.push(Resource {
                id,
                attributes,
                depends_on: decl.depends_on.clone(),
            });
        }
        Ok(resources)
    }

    fn load_outputs(
        &self,
        parsed: &ParsedFile,
        scope: &Scope<'_>,
        resources: &[Resource],
    ) -> Result<Vec<Output>, LoadError> {
        let bindings: HashMap<&str, &str> = resources
            .iter()
            .map(|r| (r.binding(), r.id.resource_type.as_str()))
            .collect();

        let mut outputs: Vec<Output> = Vec::new();
        for decl in &parsed.outputs {
            if outputs.iter().any(|o| o.name == decl.name) {
                return Err(LoadError::DuplicateDeclaration {
                    kind: "output",
                    name: decl.name.clone(),
                });
            }
            let context = format!("output {}", decl.name);
            let value = scope.eval(&decl.value, &context)?;
            for (binding, attribute) in value.references() {
                self.check_reference(&bindings, &binding, &attribute, &context)?;
            }
            // A sensitive input makes the whole output sensitive
            let sensitive = decl.sensitive || value.is_sensitive();
            outputs.push(Output {
                name: decl.name.clone(),
                value,
                sensitive,
                description: decl.description.clone(),
            });
        }
        Ok(outputs)
    }

    fn check_reference(
        &self,
        bindings: &HashMap<&str, &str>,
        binding: &str,
        attribute: &str,
        context: &str,
    ) -> Result<(), LoadError> {
        let reference = format!("{}.{}", binding, attribute);
        let Some(resource_type) = bindings.get(binding) else {
            return Err(LoadError::DanglingReference {
                context: context.to_string(),
                reference,
                reason: format!("no resource is bound to '{}'", binding),
            });
        };
        let known = self
            .schemas
            .get(resource_type)
            .is_some_and(|schema| schema.has_attribute(attribute));
        if !known {
            return Err(LoadError::DanglingReference {
                context: context.to_string(),
                reference,
                reason: format!("{} has no attribute '{}'", resource_type, attribute),
            });
        }
        Ok(())
    }
}

/// Evaluation scope for expressions
struct Scope<'s> {
    variables: &'s BTreeMap<String, BoundVariable>,
    environment: &'s HashMap<String, String>,
}

impl Scope<'_> {
    fn eval(&self, expr: &Expr, context: &str) -> Result<Value, LoadError> {
        match expr {
            Expr::String(s) => Ok(Value::String(s.clone())),
            Expr::Int(n) => Ok(Value::Int(*n)),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::List(items) => {
                let values: Result<Vec<_>, _> =
                    items.iter().map(|item| self.eval(item, context)).collect();
                Ok(Value::List(values?))
            }
            Expr::Map(entries) => {
                let mut map = HashMap::with_capacity(entries.len());
                for (k, v) in entries {
                    map.insert(k.clone(), self.eval(v, context)?);
                }
                Ok(Value::Map(map))
            }
            Expr::Variable(name) => self
                .variables
                .get(name)
                .map(|v| v.value.clone())
                .ok_or_else(|| LoadError::UnknownVariable {
                    name: name.clone(),
                    context: context.to_string(),
                }),
            Expr::Reference { binding, attribute } => {
                Ok(Value::ResourceRef(binding.clone(), attribute.clone()))
            }
            Expr::Binding(name) => Err(LoadError::InvalidExpression {
                context: context.to_string(),
                message: format!(
                    "bare name '{}' is not a value; reference an attribute such as {}.arn",
                    name, name
                ),
            }),
            Expr::Env(name) => self
                .environment
                .get(name)
                .map(|v| Value::String(v.clone()))
                .ok_or_else(|| LoadError::EnvVarNotSet(name.clone())),
            Expr::Template(parts) => {
                let parts: Result<Vec<_>, _> =
                    parts.iter().map(|p| self.eval(p, context)).collect();
                let template = Value::Interpolation(parts?);
                if !template.is_resolved() {
                    return Ok(template);
                }
                // No references left: fold into a plain string now
                let folded = template
                    .resolve(&|_, _| Ok(None))
                    .map_err(|e| LoadError::InvalidExpression {
                        context: context.to_string(),
                        message: e.to_string(),
                    })?;
                Ok(folded.unwrap_or(template))
            }
        }
    }

    /// Evaluate an expression that must not reference resources
    fn eval_concrete(&self, expr: &Expr, context: &str) -> Result<Value, LoadError> {
        let value = self.eval(expr, context)?;
        if let Some((binding, attribute)) = value.references().into_iter().next() {
            return Err(LoadError::InvalidExpression {
                context: context.to_string(),
                message: format!(
                    "resource reference {}.{} is not allowed here",
                    binding, attribute
                ),
            });
        }
        Ok(value)
    }

    fn eval_concrete_map(
        &self,
        attributes: &HashMap<String, Expr>,
        context: &str,
    ) -> Result<HashMap<String, Value>, LoadError> {
        attributes
            .iter()
            .map(|(k, v)| Ok((k.clone(), self.eval_concrete(v, context)?)))
            .collect()
    }
}

/// Convert a raw override string according to the declared type
fn convert_raw(raw: &str, type_expr: &TypeExpr, context: &str) -> Result<Value, LoadError> {
    let mismatch = |got: &str| LoadError::Type {
        context: context.to_string(),
        errors: vec![TypeError::TypeMismatch {
            expected: type_expr.to_string(),
            got: got.to_string(),
        }],
    };
    match type_expr {
        TypeExpr::String => Ok(Value::String(raw.to_string())),
        TypeExpr::Int => raw
            .trim()
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| mismatch(raw)),
        TypeExpr::Bool => match raw.trim() {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            other => Err(mismatch(other)),
        },
        TypeExpr::List(_) | TypeExpr::Map(_) => {
            let json: serde_json::Value =
                serde_json::from_str(raw).map_err(|_| mismatch("invalid JSON"))?;
            Value::from_json(&json).ok_or_else(|| mismatch("null"))
        }
    }
}

/// Check a bound variable value against its declared type
fn check_type(type_expr: &TypeExpr, value: &Value) -> Result<(), TypeError> {
    let mismatch = || TypeError::TypeMismatch {
        expected: type_expr.to_string(),
        got: value.type_name(),
    };
    match (type_expr, value) {
        (_, Value::Sensitive(inner)) => check_type(type_expr, inner.expose()),
        (TypeExpr::String, Value::String(_)) => Ok(()),
        (TypeExpr::Int, Value::Int(_)) => Ok(()),
        (TypeExpr::Bool, Value::Bool(_)) => Ok(()),
        (TypeExpr::List(inner), Value::List(items)) => {
            for (index, item) in items.iter().enumerate() {
                check_type(inner, item).map_err(|e| TypeError::ListItemError {
                    index,
                    inner: Box::new(e),
                })?;
            }
            Ok(())
        }
        (TypeExpr::Map(inner), Value::Map(map)) => {
            for (key, item) in map {
                check_type(inner, item).map_err(|e| TypeError::MapValueError {
                    key: key.clone(),
                    inner: Box::new(e),
                })?;
            }
            Ok(())
        }
        _ => Err(mismatch()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{AttributeSchema, AttributeType, ResourceSchema, types};

    fn registry() -> SchemaRegistry {
        SchemaRegistry::new()
            .with(
                ResourceSchema::new("aws.iam.role")
                    .attribute(AttributeSchema::new("name", AttributeType::String).required())
                    .attribute(AttributeSchema::new("arn", AttributeType::String).computed()),
            )
            .with(
                ResourceSchema::new("aws.lambda.function")
                    .attribute(AttributeSchema::new("name", AttributeType::String).required())
                    .attribute(AttributeSchema::new("role", AttributeType::String).required())
                    .attribute(AttributeSchema::new("timeout", types::positive_int()))
                    .attribute(AttributeSchema::new("environment", types::string_map()))
                    .attribute(AttributeSchema::new("arn", AttributeType::String).computed()),
            )
    }

    fn load(input: &str, options: LoadOptions) -> Result<Config, LoadError> {
        let schemas = registry();
        Loader::new(&schemas, options).load_str(input)
    }

    const CONFIG: &str = r#"
        variable function_name: string { default = "github-issue-extractor" }
        variable token_secret: string { sensitive = true }
        variable timeout: int { default = 300 }

        let role = aws.iam.role {
            name = "${var.function_name}-role"
        }

        let function = aws.lambda.function {
            name = var.function_name
            role = role.arn
            timeout = var.timeout
            environment = { GITHUB_TOKEN_SECRET_NAME = var.token_secret }
        }

        output function_arn { value = function.arn }
    "#;

    #[test]
    fn load_binds_defaults_and_references() {
        let config = load(CONFIG, LoadOptions::default().with_override("token_secret", "gh/token"))
            .unwrap();

        assert_eq!(config.resources.len(), 2);
        let role = config.resource("role").unwrap();
        assert_eq!(
            role.attributes.get("name"),
            Some(&Value::String("github-issue-extractor-role".to_string()))
        );

        let function = config.resource("function").unwrap();
        assert_eq!(
            function.attributes.get("role"),
            Some(&Value::ResourceRef("role".to_string(), "arn".to_string()))
        );
        assert_eq!(function.attributes.get("timeout"), Some(&Value::Int(300)));
        assert!(function.attributes["environment"].is_sensitive());
    }

    #[test]
    fn override_precedence() {
        let options = LoadOptions::default()
            .with_override("token_secret", "x")
            .with_override("timeout", "60")
            .with_env("TERRACE_VAR_timeout", "120")
            .with_env("TERRACE_VAR_function_name", "from-env");
        let config = load(CONFIG, options).unwrap();

        assert_eq!(config.variables["timeout"].value, Value::Int(60));
        assert_eq!(
            config.variables["function_name"].value,
            Value::String("from-env".to_string())
        );
    }

    #[test]
    fn missing_sensitive_variable_fails() {
        let err = load(CONFIG, LoadOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            LoadError::MissingRequiredVariable { ref name } if name == "token_secret"
        ));
    }

    #[test]
    fn sensitive_variable_is_wrapped() {
        let config =
            load(CONFIG, LoadOptions::default().with_override("token_secret", "gh/token"))
                .unwrap();
        let var = &config.variables["token_secret"];
        assert!(var.sensitive);
        assert_eq!(var.value.to_string(), "(sensitive)");
        assert!(!format!("{:?}", var).contains("gh/token"));
    }

    #[test]
    fn override_for_undeclared_variable_fails() {
        let options = LoadOptions::default()
            .with_override("token_secret", "x")
            .with_override("colour", "red");
        assert!(matches!(
            load(CONFIG, options),
            Err(LoadError::UnknownVariable { .. })
        ));
    }

    #[test]
    fn override_with_wrong_type_fails() {
        let options = LoadOptions::default()
            .with_override("token_secret", "x")
            .with_override("timeout", "soon");
        assert!(matches!(load(CONFIG, options), Err(LoadError::Type { .. })));
    }

    #[test]
    fn list_and_map_overrides_are_json() {
        let input = r#"
            variable names: list(string) { default = [] }
            variable tags: map(string) { default = {} }
        "#;
        let options = LoadOptions::default()
            .with_override("names", r#"["a", "b"]"#)
            .with_override("tags", r#"{"team": "data"}"#);
        let config = load(input, options).unwrap();
        assert_eq!(
            config.variables["names"].value,
            Value::List(vec![
                Value::String("a".to_string()),
                Value::String("b".to_string())
            ])
        );

        let bad = LoadOptions::default().with_override("names", r#"[1, 2]"#);
        assert!(matches!(load(input, bad), Err(LoadError::Type { .. })));
    }

    #[test]
    fn undeclared_variable_reference_fails() {
        let input = r#"
            let role = aws.iam.role { name = var.missing }
        "#;
        assert!(matches!(
            load(input, LoadOptions::default()),
            Err(LoadError::UnknownVariable { .. })
        ));
    }

    #[test]
    fn duplicate_binding_fails() {
        let input = r#"
            let role = aws.iam.role { name = "a" }
            let role = aws.iam.role { name = "b" }
        "#;
        assert!(matches!(
            load(input, LoadOptions::default()),
            Err(LoadError::DuplicateResource(_))
        ));
    }

    #[test]
    fn dangling_reference_fails() {
        let input = r#"
            let function = aws.lambda.function {
                name = "f"
                role = ghost.arn
            }
        "#;
        assert!(matches!(
            load(input, LoadOptions::default()),
            Err(LoadError::DanglingReference { .. })
        ));
    }

    #[test]
    fn reference_to_unknown_attribute_fails() {
        let input = r#"
            let role = aws.iam.role { name = "r" }
            let function = aws.lambda.function {
                name = "f"
                role = role.colour
            }
        "#;
        assert!(matches!(
            load(input, LoadOptions::default()),
            Err(LoadError::DanglingReference { .. })
        ));
    }

    #[test]
    fn dangling_output_reference_fails() {
        let input = r#"
            output arn { value = ghost.arn }
        "#;
        assert!(matches!(
            load(input, LoadOptions::default()),
            Err(LoadError::DanglingReference { .. })
        ));
    }

    #[test]
    fn dangling_depends_on_fails() {
        let input = r#"
            let role = aws.iam.role {
                name = "r"
                depends_on = [ghost]
            }
        "#;
        assert!(matches!(
            load(input, LoadOptions::default()),
            Err(LoadError::DanglingReference { .. })
        ));
    }

    #[test]
    fn schema_violations_are_type_errors() {
        let input = r#"
            let role = aws.iam.role {
                name = 42
            }
        "#;
        assert!(matches!(
            load(input, LoadOptions::default()),
            Err(LoadError::Type { .. })
        ));

        let computed = r#"
            let role = aws.iam.role {
                name = "r"
                arn = "arn:aws:iam::123:role/r"
            }
        "#;
        assert!(matches!(
            load(computed, LoadOptions::default()),
            Err(LoadError::Type { .. })
        ));
    }

    #[test]
    fn unknown_resource_type_fails() {
        let input = r#"let vpc = aws.ec2.vpc { cidr = "10.0.0.0/16" }"#;
        assert!(matches!(
            load(input, LoadOptions::default()),
            Err(LoadError::UnknownResourceType { .. })
        ));
    }

    #[test]
    fn env_call_reads_environment() {
        let input = r#"provider aws { region = env("AWS_REGION") }"#;
        let config = load(
            input,
            LoadOptions::default().with_env("AWS_REGION", "ap-southeast-2"),
        )
        .unwrap();
        assert_eq!(
            config.provider("aws").and_then(|p| p.get_string("region")),
            Some("ap-southeast-2")
        );

        assert!(matches!(
            load(input, LoadOptions::default()),
            Err(LoadError::EnvVarNotSet(_))
        ));
    }

    #[test]
    fn sensitive_output_marked() {
        let input = r#"
            variable secret: string { sensitive = true default = "s" }
            output secret { value = var.secret }
        "#;
        let config = load(input, LoadOptions::default()).unwrap();
        assert!(config.output("secret").unwrap().sensitive);
    }

    #[test]
    fn load_directory_merges_documents() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("role.trc"),
            r#"let role = aws.iam.role { name = "r" }"#,
        )
        .unwrap();
        fs::write(
            dir.path().join("function.trc"),
            r#"
            let function = aws.lambda.function {
                name = "f"
                role = role.arn
            }
            "#,
        )
        .unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let schemas = registry();
        let config = Loader::new(&schemas, LoadOptions::default())
            .load_path(dir.path())
            .unwrap();
        assert_eq!(config.resources.len(), 2);
    }

    #[test]
    fn load_directory_rejects_duplicates_across_documents() {
        let dir = tempfile::tempdir().unwrap();
        for file in ["a.trc", "b.trc"] {
            fs::write(
                dir.path().join(file),
                r#"let role = aws.iam.role { name = "r" }"#,
            )
            .unwrap();
        }
        let schemas = registry();
        let result = Loader::new(&schemas, LoadOptions::default()).load_path(dir.path());
        assert!(matches!(result, Err(LoadError::DuplicateResource(_))));
    }

    #[test]
    fn parse_error_carries_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.trc");
        fs::write(&path, "let = {").unwrap();
        let schemas = registry();
        let err = Loader::new(&schemas, LoadOptions::default())
            .load_path(&path)
            .unwrap_err();
        assert!(matches!(err, LoadError::Parse { .. }));
        assert!(err.to_string().contains("broken.trc"));
    }
}
