//! AWS-specific attribute types

use std::sync::LazyLock;

use regex::Regex;
use terrace_core::resource::Value;
use terrace_core::schema::AttributeType;

/// Valid AWS regions (in AWS format with hyphens)
const VALID_REGIONS: &[&str] = &[
    "ap-northeast-1",
    "ap-northeast-2",
    "ap-northeast-3",
    "ap-southeast-1",
    "ap-southeast-2",
    "ap-south-1",
    "us-east-1",
    "us-east-2",
    "us-west-1",
    "us-west-2",
    "eu-west-1",
    "eu-west-2",
    "eu-west-3",
    "eu-central-1",
    "eu-north-1",
    "ca-central-1",
    "sa-east-1",
];

/// Retention periods CloudWatch Logs accepts
const VALID_RETENTION_DAYS: &[i64] = &[
    1, 3, 5, 7, 14, 30, 60, 90, 120, 150, 180, 365, 400, 545, 731, 1096, 1827, 2192, 2557, 2922,
    3288, 3653,
];

static BUCKET_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9.-]{1,61}[a-z0-9]$").expect("valid regex"));

static FUNCTION_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("valid regex"));

static IAM_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\w+=,.@-]{1,64}$").expect("valid regex"));

static RUNTIME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(python3\.\d+|nodejs\d+\.x|java\d+|dotnet\d+|ruby\d\.\d+|provided(\.al20\d\d)?)$")
        .expect("valid regex")
});

/// Normalize a region to AWS format
/// - "aws.Region.ap_southeast_2" -> "ap-southeast-2"
/// - "ap-southeast-2" -> "ap-southeast-2"
pub fn normalize_region(s: &str) -> String {
    s.strip_prefix("aws.Region.").unwrap_or(s).replace('_', "-")
}

/// AWS region, in AWS or DSL (`aws.Region.ap_southeast_2`) format
pub fn region() -> AttributeType {
    AttributeType::Custom {
        name: "Region".to_string(),
        base: Box::new(AttributeType::String),
        validate: |value| match value {
            Value::String(s) if VALID_REGIONS.contains(&normalize_region(s).as_str()) => Ok(()),
            Value::String(s) => Err(format!(
                "Invalid region '{}', expected one of: {}",
                s,
                VALID_REGIONS.join(", ")
            )),
            _ => Err("Expected string".to_string()),
        },
    }
}

fn matching(value: &Value, pattern: &Regex, what: &str) -> Result<(), String> {
    match value {
        Value::String(s) if pattern.is_match(s) => Ok(()),
        Value::String(s) => Err(format!("'{}' is not a valid {}", s, what)),
        _ => Err("Expected string".to_string()),
    }
}

/// S3 bucket name: 3-63 lowercase letters, digits, dots and hyphens
pub fn bucket_name() -> AttributeType {
    AttributeType::Custom {
        name: "BucketName".to_string(),
        base: Box::new(AttributeType::String),
        validate: |value| matching(value, &BUCKET_NAME, "bucket name"),
    }
}

pub fn function_name() -> AttributeType {
    AttributeType::Custom {
        name: "FunctionName".to_string(),
        base: Box::new(AttributeType::String),
        validate: |value| matching(value, &FUNCTION_NAME, "function name"),
    }
}

/// IAM role or policy name
pub fn iam_name() -> AttributeType {
    AttributeType::Custom {
        name: "IamName".to_string(),
        base: Box::new(AttributeType::String),
        validate: |value| matching(value, &IAM_NAME, "IAM name"),
    }
}

pub fn lambda_runtime() -> AttributeType {
    AttributeType::Custom {
        name: "Runtime".to_string(),
        base: Box::new(AttributeType::String),
        validate: |value| matching(value, &RUNTIME, "Lambda runtime"),
    }
}

/// Integer within an inclusive range
macro_rules! int_range {
    ($name:expr, $min:expr, $max:expr) => {
        AttributeType::Custom {
            name: $name.to_string(),
            base: Box::new(AttributeType::Int),
            validate: |value| match value {
                Value::Int(n) if ($min..=$max).contains(n) => Ok(()),
                Value::Int(n) => Err(format!(
                    "{} is out of range, expected {}..={}",
                    n, $min, $max
                )),
                _ => Err("Expected integer".to_string()),
            },
        }
    };
}

/// Lambda timeout in seconds
pub fn lambda_timeout() -> AttributeType {
    int_range!("Timeout", 1, 900)
}

/// Lambda memory in MB
pub fn lambda_memory_size() -> AttributeType {
    int_range!("MemorySize", 128, 10240)
}

pub fn log_retention_days() -> AttributeType {
    AttributeType::Custom {
        name: "RetentionInDays".to_string(),
        base: Box::new(AttributeType::Int),
        validate: |value| match value {
            Value::Int(n) if VALID_RETENTION_DAYS.contains(n) => Ok(()),
            Value::Int(n) => Err(format!("{} is not a supported retention period", n)),
            _ => Err("Expected integer".to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: &str) -> Value {
        Value::String(v.to_string())
    }

    #[test]
    fn test_normalize_region() {
        assert_eq!(normalize_region("aws.Region.ap_southeast_2"), "ap-southeast-2");
        assert_eq!(normalize_region("ap-southeast-2"), "ap-southeast-2");
        assert!(region().validate(&s("aws.Region.ap_southeast_2")).is_ok());
        assert!(region().validate(&s("mars-north-1")).is_err());
    }

    #[test]
    fn test_bucket_name() {
        assert!(bucket_name().validate(&s("github-api-extraction-bucket")).is_ok());
        assert!(bucket_name().validate(&s("Upper_Case")).is_err());
        assert!(bucket_name().validate(&s("ab")).is_err());
    }

    #[test]
    fn test_names_and_runtime() {
        assert!(function_name().validate(&s("github-issue-extractor")).is_ok());
        assert!(function_name().validate(&s("has space")).is_err());
        assert!(iam_name().validate(&s("github-issue-extractor-role")).is_ok());
        assert!(lambda_runtime().validate(&s("python3.12")).is_ok());
        assert!(lambda_runtime().validate(&s("cobol85")).is_err());
    }

    #[test]
    fn test_ranges() {
        assert!(lambda_timeout().validate(&Value::Int(300)).is_ok());
        assert!(lambda_timeout().validate(&Value::Int(0)).is_err());
        assert!(lambda_memory_size().validate(&Value::Int(64)).is_err());
        assert!(log_retention_days().validate(&Value::Int(14)).is_ok());
        assert!(log_retention_days().validate(&Value::Int(15)).is_err());
    }
}
