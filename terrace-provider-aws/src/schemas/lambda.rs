//! Lambda schema definitions

use super::types::{function_name, lambda_memory_size, lambda_runtime, lambda_timeout};
use super::{AwsSchemaConfig, tags_type};
use terrace_core::schema::{AttributeSchema, AttributeType, ResourceSchema, types};

/// aws.lambda.function (AWS::Lambda::Function), identified by its name
///
/// The deployment package is an object in S3. `source_code_hash` is never
/// sent to AWS; changing it redeploys the same object key.
pub fn function_config() -> AwsSchemaConfig {
    AwsSchemaConfig {
        aws_type_name: "AWS::Lambda::Function",
        has_tags: true,
        schema: ResourceSchema::new("aws.lambda.function")
            .with_description("Serverless function deployed from an S3 artifact")
            .attribute(
                AttributeSchema::new("name", function_name())
                    .required()
                    .force_new()
                    .with_provider_name("FunctionName"),
            )
            .attribute(
                AttributeSchema::new("role", AttributeType::String)
                    .required()
                    .with_description("ARN of the execution role")
                    .with_provider_name("Role"),
            )
            .attribute(
                AttributeSchema::new("runtime", lambda_runtime())
                    .required()
                    .with_provider_name("Runtime"),
            )
            .attribute(
                AttributeSchema::new("handler", AttributeType::String)
                    .required()
                    .with_description("Entry point, e.g. lambda_handler.lambda_handler")
                    .with_provider_name("Handler"),
            )
            .attribute(
                AttributeSchema::new("s3_bucket", AttributeType::String)
                    .required()
                    .with_provider_name("Code.S3Bucket"),
            )
            .attribute(
                AttributeSchema::new("s3_key", AttributeType::String)
                    .required()
                    .with_provider_name("Code.S3Key"),
            )
            .attribute(
                AttributeSchema::new("s3_object_version", AttributeType::String)
                    .with_provider_name("Code.S3ObjectVersion"),
            )
            .attribute(
                AttributeSchema::new("source_code_hash", AttributeType::String)
                    .with_description("Artifact checksum; a change triggers redeployment"),
            )
            .attribute(
                AttributeSchema::new("description", AttributeType::String)
                    .with_provider_name("Description"),
            )
            .attribute(
                AttributeSchema::new("timeout", lambda_timeout()).with_provider_name("Timeout"),
            )
            .attribute(
                AttributeSchema::new("memory_size", lambda_memory_size())
                    .with_provider_name("MemorySize"),
            )
            .attribute(
                AttributeSchema::new("environment", types::string_map())
                    .with_provider_name("Environment.Variables"),
            )
            .attribute(
                AttributeSchema::new("architectures", types::string_list())
                    .with_provider_name("Architectures"),
            )
            .attribute(AttributeSchema::new("tags", tags_type()).with_provider_name("Tags"))
            .attribute(
                AttributeSchema::new("arn", AttributeType::String)
                    .computed()
                    .with_provider_name("Arn"),
            ),
    }
}
