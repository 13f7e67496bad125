//! Conversion between DSL attributes and Cloud Control properties

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::{Map, json};
use terrace_core::provider::ErrorKind;
use terrace_core::resource::Value;

use crate::schemas::AwsSchemaConfig;

/// CloudFormation tag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "Value")]
    pub value: String,
}

/// Error-code fragments of failures worth retrying
const TRANSIENT_MARKERS: &[&str] = &[
    "throttl",
    "rate exceeded",
    "toomanyrequests",
    "too many requests",
    "requestlimitexceeded",
    "timeout",
    "timed out",
    "serviceunavailable",
    "service unavailable",
    "internalfailure",
    "serviceinternalerror",
    "internalerror",
    "networkfailure",
    "dispatchfailure",
    "notstabilized",
    "concurrentoperation",
    "resourceconflict",
];

/// Classify an AWS failure from its error text
pub fn classify(detail: &str) -> ErrorKind {
    let detail = detail.to_ascii_lowercase();
    if TRANSIENT_MARKERS.iter().any(|m| detail.contains(m)) {
        ErrorKind::Transient
    } else {
        ErrorKind::Permanent
    }
}

fn insert_path(props: &mut Map<String, serde_json::Value>, path: &str, value: serde_json::Value) {
    match path.split_once('.') {
        None => {
            props.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let entry = props
                .entry(head.to_string())
                .or_insert_with(|| serde_json::Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = serde_json::Value::Object(Map::new());
            }
            if let serde_json::Value::Object(inner) = entry {
                insert_path(inner, rest, value);
            }
        }
    }
}

fn lookup_path<'a>(props: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    path.split('.').try_fold(props, |node, key| node.get(key))
}

fn tags_to_json(tags: &HashMap<String, Value>) -> serde_json::Value {
    let mut tags: Vec<Tag> = tags
        .iter()
        .map(|(key, value)| Tag {
            key: key.clone(),
            value: match value.expose() {
                Value::String(s) => s,
                other => other.to_json().to_string(),
            },
        })
        .collect();
    tags.sort_by(|a, b| a.key.cmp(&b.key));
    json!(tags)
}

fn tags_from_json(value: &serde_json::Value) -> Option<Value> {
    let tags: Vec<Tag> = serde_json::from_value(value.clone()).ok()?;
    if tags.is_empty() {
        return None;
    }
    Some(Value::Map(
        tags.into_iter()
            .map(|t| (t.key, Value::String(t.value)))
            .collect(),
    ))
}

/// Build the Cloud Control desired state from resolved DSL attributes.
/// Computed and local-only attributes are left out.
pub fn to_properties(
    config: &AwsSchemaConfig,
    attributes: &HashMap<String, Value>,
) -> Map<String, serde_json::Value> {
    let mut props = Map::new();
    for (name, schema) in &config.schema.attributes {
        if schema.computed {
            continue;
        }
        let (Some(path), Some(value)) = (&schema.provider_name, attributes.get(name)) else {
            continue;
        };
        let json = match value {
            Value::Map(tags) if config.has_tags && name == "tags" => tags_to_json(tags),
            other => other.to_json(),
        };
        insert_path(&mut props, path, json);
    }
    props
}

/// Map Cloud Control properties back to DSL attributes
pub fn from_properties(
    config: &AwsSchemaConfig,
    props: &serde_json::Value,
) -> HashMap<String, Value> {
    let mut attributes = HashMap::new();
    for (name, schema) in &config.schema.attributes {
        let Some(json) = schema
            .provider_name
            .as_deref()
            .and_then(|path| lookup_path(props, path))
        else {
            continue;
        };
        let value = if config.has_tags && name == "tags" {
            tags_from_json(json)
        } else {
            Value::from_json(json)
        };
        if let Some(value) = value {
            attributes.insert(name.clone(), value);
        }
    }
    attributes
}

/// Top-level properties that can only be set on create
pub fn create_only_properties(config: &AwsSchemaConfig) -> BTreeSet<String> {
    config
        .schema
        .attributes
        .values()
        .filter(|a| a.force_new)
        .filter_map(|a| a.provider_name.as_deref())
        .map(|path| path.split('.').next().unwrap_or(path).to_string())
        .collect()
}

/// RFC 6902 operations turning `current` into `desired` at the top level
pub fn patch_operations(
    current: &Map<String, serde_json::Value>,
    desired: &Map<String, serde_json::Value>,
    create_only: &BTreeSet<String>,
) -> Vec<serde_json::Value> {
    let mut ops = Vec::new();
    for (key, value) in desired {
        if create_only.contains(key) {
            continue;
        }
        match current.get(key) {
            Some(existing) if existing == value => {}
            Some(_) => ops.push(json!({"op": "replace", "path": format!("/{}", key), "value": value})),
            None => ops.push(json!({"op": "add", "path": format!("/{}", key), "value": value})),
        }
    }
    for key in current.keys() {
        if !desired.contains_key(key) && !create_only.contains(key) {
            ops.push(json!({"op": "remove", "path": format!("/{}", key)}));
        }
    }
    ops
}
