//! CloudWatch Logs schema definitions

use super::types::log_retention_days;
use super::{AwsSchemaConfig, tags_type};
use terrace_core::schema::{AttributeSchema, AttributeType, ResourceSchema};

/// aws.logs.log_group (AWS::Logs::LogGroup), identified by its name
pub fn log_group_config() -> AwsSchemaConfig {
    AwsSchemaConfig {
        aws_type_name: "AWS::Logs::LogGroup",
        has_tags: true,
        schema: ResourceSchema::new("aws.logs.log_group")
            .with_description("Log destination, e.g. /aws/lambda/<function>")
            .attribute(
                AttributeSchema::new("name", AttributeType::String)
                    .required()
                    .force_new()
                    .with_provider_name("LogGroupName"),
            )
            .attribute(
                AttributeSchema::new("retention_in_days", log_retention_days())
                    .with_provider_name("RetentionInDays"),
            )
            .attribute(
                AttributeSchema::new("kms_key_id", AttributeType::String)
                    .with_provider_name("KmsKeyId"),
            )
            .attribute(AttributeSchema::new("tags", tags_type()).with_provider_name("Tags"))
            .attribute(
                AttributeSchema::new("arn", AttributeType::String)
                    .computed()
                    .with_provider_name("Arn"),
            ),
    }
}
