//! Output binder - Evaluate declared outputs against persisted state
//!
//! Outputs are recomputed on every call from the records the executor wrote.
//! A reference to a resource that is absent or tainted leaves the output
//! unresolved.

use std::collections::{BTreeMap, HashMap};

use crate::loader::Output;
use crate::resource::{ResolveError, Resource, ResourceId, State, Value};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OutputError {
    #[error("Output '{output}' is unresolved: {reference} {reason}")]
    Unresolved {
        output: String,
        reference: String,
        reason: String,
    },

    #[error("Output '{0}' is not declared")]
    UnknownOutput(String),
}

/// A resolved output value
#[derive(Debug, Clone, PartialEq)]
pub struct BoundOutput {
    pub value: Value,
    pub sensitive: bool,
}

impl BoundOutput {
    /// Text for display; sensitive values are masked
    pub fn display_value(&self) -> String {
        if self.sensitive {
            "(sensitive)".to_string()
        } else {
            render(&self.value)
        }
    }

    /// JSON for machine consumption; sensitive values are included
    pub fn to_json(&self) -> serde_json::Value {
        self.value.to_json()
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_json().to_string(),
    }
}

/// Resolves references against the desired resources and their records
struct Binder<'a> {
    resources: HashMap<&'a str, &'a Resource>,
    states: &'a HashMap<ResourceId, State>,
}

impl<'a> Binder<'a> {
    fn new(resources: &'a [Resource], states: &'a HashMap<ResourceId, State>) -> Self {
        Self {
            resources: resources.iter().map(|r| (r.binding(), r)).collect(),
            states,
        }
    }

    fn bind(&self, output: &Output) -> Result<BoundOutput, OutputError> {
        let value = self
            .evaluate(&output.value, 0)
            .map_err(|(reference, reason)| OutputError::Unresolved {
                output: output.name.clone(),
                reference,
                reason,
            })?;
        let sensitive = output.sensitive || value.is_sensitive();
        Ok(BoundOutput {
            value: value.expose(),
            sensitive,
        })
    }

    fn evaluate(&self, value: &Value, depth: usize) -> Result<Value, (String, String)> {
        let lookup = |binding: &str, attr: &str| -> Result<Option<Value>, ResolveError> {
            self.lookup(binding, attr, depth)
                .map(Some)
                .map_err(|_| ResolveError::Unresolved {
                    binding: binding.to_string(),
                    attribute: attr.to_string(),
                })
        };

        match value.resolve(&lookup) {
            Ok(Some(v)) => Ok(v),
            Ok(None) => Err(first_reference(value, "has no known value")),
            Err(ResolveError::Unresolved { binding, attribute }) => {
                let reason = self
                    .lookup(&binding, &attribute, depth)
                    .err()
                    .unwrap_or_else(|| "has no known value".to_string());
                Err((format!("{}.{}", binding, attribute), reason))
            }
            Err(e) => Err(first_reference(value, &e.to_string())),
        }
    }

    fn lookup(&self, binding: &str, attr: &str, depth: usize) -> Result<Value, String> {
        let resource = self
            .resources
            .get(binding)
            .ok_or_else(|| "refers to an undeclared resource".to_string())?;
        let state = match self.states.get(&resource.id) {
            Some(state) if state.exists => state,
            _ => return Err(format!("({}) has not been created", resource.id)),
        };
        if state.tainted {
            return Err(format!("({}) is tainted", resource.id));
        }

        if let Some(value) = state.attributes.get(attr) {
            return Ok(value.clone());
        }
        // Arguments that were not persisted (e.g. references) are re-derived
        match resource.attributes.get(attr) {
            Some(argument) if depth < self.resources.len() => self
                .evaluate(argument, depth + 1)
                .map_err(|(_, reason)| reason),
            _ => Err(format!("({}) has no attribute '{}'", resource.id, attr)),
        }
    }
}

fn first_reference(value: &Value, reason: &str) -> (String, String) {
    let reference = value
        .references()
        .into_iter()
        .next()
        .map(|(b, a)| format!("{}.{}", b, a))
        .unwrap_or_default();
    (reference, reason.to_string())
}

/// Resolve every declared output
pub fn bind_outputs(
    outputs: &[Output],
    resources: &[Resource],
    states: &HashMap<ResourceId, State>,
) -> Result<BTreeMap<String, BoundOutput>, OutputError> {
    let binder = Binder::new(resources, states);
    outputs
        .iter()
        .map(|output| Ok((output.name.clone(), binder.bind(output)?)))
        .collect()
}

/// Resolve a single declared output by name
pub fn bind_output(
    name: &str,
    outputs: &[Output],
    resources: &[Resource],
    states: &HashMap<ResourceId, State>,
) -> Result<BoundOutput, OutputError> {
    let output = outputs
        .iter()
        .find(|o| o.name == name)
        .ok_or_else(|| OutputError::UnknownOutput(name.to_string()))?;
    Binder::new(resources, states).bind(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: &str) -> Value {
        Value::String(v.to_string())
    }

    fn reference(binding: &str, attr: &str) -> Value {
        Value::ResourceRef(binding.to_string(), attr.to_string())
    }

    fn output(name: &str, value: Value) -> Output {
        Output {
            name: name.to_string(),
            value,
            sensitive: false,
            description: None,
        }
    }

    fn resources() -> Vec<Resource> {
        vec![
            Resource::new("aws.s3.bucket", "bucket").with_attribute("bucket_name", s("issues")),
            Resource::new("aws.lambda.function", "function")
                .with_attribute("function_name", s("extractor"))
                .with_attribute("bucket", reference("bucket", "bucket_name")),
        ]
    }

    fn states() -> HashMap<ResourceId, State> {
        let mut attrs = HashMap::new();
        attrs.insert("arn".to_string(), s("arn:aws:lambda:fn"));
        attrs.insert("function_name".to_string(), s("extractor"));
        let function = State::existing(ResourceId::new("aws.lambda.function", "function"), attrs)
            .with_identifier("extractor");

        let mut attrs = HashMap::new();
        attrs.insert("bucket_name".to_string(), s("issues"));
        let bucket = State::existing(ResourceId::new("aws.s3.bucket", "bucket"), attrs)
            .with_identifier("issues");

        [function, bucket]
            .into_iter()
            .map(|s| (s.id.clone(), s))
            .collect()
    }

    #[test]
    fn binds_computed_attributes() {
        let outputs = vec![
            output("function_arn", reference("function", "arn")),
            output(
                "summary",
                Value::Interpolation(vec![
                    reference("function", "function_name"),
                    s(" writes to "),
                    reference("bucket", "bucket_name"),
                ]),
            ),
        ];
        let bound = bind_outputs(&outputs, &resources(), &states()).unwrap();

        assert_eq!(bound["function_arn"].value, s("arn:aws:lambda:fn"));
        assert_eq!(bound["summary"].display_value(), "extractor writes to issues");
    }

    #[test]
    fn falls_back_to_arguments_missing_from_state() {
        let outputs = vec![output("target", reference("function", "bucket"))];
        let bound = bind_outputs(&outputs, &resources(), &states()).unwrap();
        assert_eq!(bound["target"].value, s("issues"));
    }

    #[test]
    fn tainted_resource_is_unresolved() {
        let mut states = states();
        let id = ResourceId::new("aws.lambda.function", "function");
        let tainted = states.remove(&id).unwrap().with_tainted(true);
        states.insert(id, tainted);

        let outputs = vec![output("function_arn", reference("function", "arn"))];
        let err = bind_outputs(&outputs, &resources(), &states).unwrap_err();
        assert!(matches!(
            &err,
            OutputError::Unresolved { output, reference, .. }
                if output == "function_arn" && reference == "function.arn"
        ));
        assert!(err.to_string().contains("tainted"));
    }

    #[test]
    fn absent_resource_is_unresolved() {
        let outputs = vec![output("function_arn", reference("function", "arn"))];
        let err = bind_outputs(&outputs, &resources(), &HashMap::new()).unwrap_err();
        assert!(err.to_string().contains("has not been created"));
    }

    #[test]
    fn sensitive_outputs_are_masked() {
        let mut secret = output("token", Value::sensitive(s("ghp_x")));
        secret.sensitive = false;
        let bound = bind_output("token", &[secret], &resources(), &states()).unwrap();
        assert!(bound.sensitive);
        assert_eq!(bound.display_value(), "(sensitive)");
        assert_eq!(bound.to_json(), serde_json::json!("ghp_x"));
    }

    #[test]
    fn unknown_output() {
        let err = bind_output("missing", &[], &resources(), &states()).unwrap_err();
        assert_eq!(err, OutputError::UnknownOutput("missing".to_string()));
    }
}
