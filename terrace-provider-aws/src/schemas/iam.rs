//! IAM schema definitions: roles and inline role policies

use super::types::iam_name;
use super::{AwsSchemaConfig, tags_type};
use terrace_core::schema::{
    AttributeSchema, AttributeType, ReplacementPolicy, ResourceSchema, types,
};

/// aws.iam.role (AWS::IAM::Role), identified by its name
pub fn role_config() -> AwsSchemaConfig {
    AwsSchemaConfig {
        aws_type_name: "AWS::IAM::Role",
        has_tags: true,
        schema: ResourceSchema::new("aws.iam.role")
            .with_description("Execution identity assumed by a service")
            .attribute(
                AttributeSchema::new("name", iam_name())
                    .required()
                    .force_new()
                    .with_provider_name("RoleName"),
            )
            .attribute(
                AttributeSchema::new("assume_role_policy", AttributeType::Document)
                    .required()
                    .with_description("Trust policy naming who may assume the role")
                    .with_provider_name("AssumeRolePolicyDocument"),
            )
            .attribute(
                AttributeSchema::new("description", AttributeType::String)
                    .with_provider_name("Description"),
            )
            .attribute(
                AttributeSchema::new("path", AttributeType::String)
                    .force_new()
                    .with_provider_name("Path"),
            )
            .attribute(
                AttributeSchema::new("managed_policy_arns", types::string_list())
                    .with_provider_name("ManagedPolicyArns"),
            )
            .attribute(
                AttributeSchema::new("max_session_duration", types::positive_int())
                    .with_provider_name("MaxSessionDuration"),
            )
            .attribute(AttributeSchema::new("tags", tags_type()).with_provider_name("Tags"))
            .attribute(
                AttributeSchema::new("arn", AttributeType::String)
                    .computed()
                    .with_provider_name("Arn"),
            )
            .attribute(
                AttributeSchema::new("role_id", AttributeType::String)
                    .computed()
                    .with_provider_name("RoleId"),
            ),
    }
}

/// aws.iam.role_policy (AWS::IAM::RolePolicy)
///
/// Cloud Control identifies inline policies as `PolicyName|RoleName`. A new
/// policy is attached before the old one is removed so the role never runs
/// without permissions.
pub fn role_policy_config() -> AwsSchemaConfig {
    AwsSchemaConfig {
        aws_type_name: "AWS::IAM::RolePolicy",
        has_tags: false,
        schema: ResourceSchema::new("aws.iam.role_policy")
            .with_description("Inline permissions policy embedded in a role")
            .with_replacement(ReplacementPolicy::CreateBeforeDestroy)
            .attribute(
                AttributeSchema::new("name", iam_name())
                    .required()
                    .force_new()
                    .with_provider_name("PolicyName"),
            )
            .attribute(
                AttributeSchema::new("role", AttributeType::String)
                    .required()
                    .force_new()
                    .with_description("Name of the role the policy is embedded in")
                    .with_provider_name("RoleName"),
            )
            .attribute(
                AttributeSchema::new("policy", AttributeType::Document)
                    .required()
                    .with_provider_name("PolicyDocument"),
            ),
    }
}
