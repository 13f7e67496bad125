//! S3 schema definitions

use super::types::bucket_name;
use super::{AwsSchemaConfig, tags_type};
use terrace_core::schema::{AttributeSchema, AttributeType, ResourceSchema};

/// aws.s3.bucket (AWS::S3::Bucket), identified by its name
pub fn bucket_config() -> AwsSchemaConfig {
    AwsSchemaConfig {
        aws_type_name: "AWS::S3::Bucket",
        has_tags: true,
        schema: ResourceSchema::new("aws.s3.bucket")
            .with_description("Object storage for extracted data and deployment artifacts")
            .attribute(
                AttributeSchema::new("name", bucket_name())
                    .required()
                    .force_new()
                    .with_provider_name("BucketName"),
            )
            .attribute(
                AttributeSchema::new(
                    "versioning",
                    AttributeType::Enum(vec!["Enabled".to_string(), "Suspended".to_string()]),
                )
                .with_provider_name("VersioningConfiguration.Status"),
            )
            .attribute(AttributeSchema::new("tags", tags_type()).with_provider_name("Tags"))
            .attribute(
                AttributeSchema::new("arn", AttributeType::String)
                    .computed()
                    .with_provider_name("Arn"),
            )
            .attribute(
                AttributeSchema::new("domain_name", AttributeType::String)
                    .computed()
                    .with_provider_name("DomainName"),
            ),
    }
}
