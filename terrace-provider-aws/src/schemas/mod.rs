//! AWS Cloud Control resource schema definitions
//!
//! Each resource type pairs a `ResourceSchema` (what the loader validates and
//! the differ classifies) with the CloudFormation type name Cloud Control
//! manages it as. Attribute `provider_name`s are CloudFormation property
//! paths; a dotted path such as `Code.S3Bucket` nests the value.

pub mod iam;
pub mod lambda;
pub mod logs;
pub mod s3;
pub mod types;

use terrace_core::schema::{AttributeType, ResourceSchema, SchemaRegistry};

/// AWS Cloud Control schema configuration
pub struct AwsSchemaConfig {
    /// AWS CloudFormation type name (e.g., "AWS::Lambda::Function")
    pub aws_type_name: &'static str,
    /// Whether `tags` is sent as a CloudFormation `[{Key, Value}]` list
    pub has_tags: bool,
    /// The resource schema with attribute definitions
    pub schema: ResourceSchema,
}

/// Tags type for AWS resources (Terraform-style map)
pub fn tags_type() -> AttributeType {
    AttributeType::Map(Box::new(AttributeType::String))
}

/// Returns every supported schema config
pub fn configs() -> Vec<AwsSchemaConfig> {
    vec![
        iam::role_config(),
        iam::role_policy_config(),
        logs::log_group_config(),
        lambda::function_config(),
        s3::bucket_config(),
    ]
}

/// Look up the config of a DSL resource type (e.g., "aws.iam.role")
pub fn config_for(resource_type: &str) -> Option<AwsSchemaConfig> {
    configs()
        .into_iter()
        .find(|c| c.schema.resource_type == resource_type)
}

/// Registry of every AWS resource schema, for the loader and the differ
pub fn registry() -> SchemaRegistry {
    configs().into_iter().map(|c| c.schema).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_type_is_registered_under_aws() {
        let registry = registry();
        let mut types: Vec<&str> = registry.resource_types().collect();
        types.sort();
        assert_eq!(
            types,
            vec![
                "aws.iam.role",
                "aws.iam.role_policy",
                "aws.lambda.function",
                "aws.logs.log_group",
                "aws.s3.bucket",
            ]
        );
    }

    #[test]
    fn provider_names_cover_non_local_attributes() {
        for config in configs() {
            for (name, attr) in &config.schema.attributes {
                if name == "source_code_hash" {
                    continue;
                }
                assert!(
                    attr.provider_name.is_some(),
                    "{}.{} has no property name",
                    config.schema.resource_type,
                    name
                );
            }
        }
    }

    #[test]
    fn config_lookup() {
        assert_eq!(
            config_for("aws.lambda.function").map(|c| c.aws_type_name),
            Some("AWS::Lambda::Function")
        );
        assert!(config_for("aws.ec2.vpc").is_none());
    }
}
