//! Parser - Parse .trc files
//!
//! Convert DSL to AST using pest. The parser only builds expressions;
//! variables, `env()` calls and references are evaluated by the loader.

use pest::Parser;
use pest::iterators::{Pair, Pairs};
use pest_derive::Parser;
use std::collections::HashMap;
use std::fmt;

#[derive(Parser)]
#[grammar = "parser/terrace.pest"]
struct TerraceParser;

/// Parse error
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Syntax error: {0}")]
    Syntax(#[from] Box<pest::error::Error<Rule>>),

    #[error("Invalid expression at line {line}: {message}")]
    InvalidExpression { line: usize, message: String },

    #[error("Duplicate attribute '{name}' at line {line}")]
    DuplicateAttribute { name: String, line: usize },

    #[error("Duplicate {kind} block: {name}")]
    DuplicateBlock { kind: &'static str, name: String },
}

/// Expression as written in the DSL
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    String(String),
    Int(i64),
    Bool(bool),
    List(Vec<Expr>),
    /// Map entries in source order
    Map(Vec<(String, Expr)>),
    /// `var.name`
    Variable(String),
    /// `binding.attribute`
    Reference { binding: String, attribute: String },
    /// Bare binding name (only meaningful inside `depends_on`)
    Binding(String),
    /// `env("NAME")`
    Env(String),
    /// String with `${...}` interpolation; literal parts are `Expr::String`
    Template(Vec<Expr>),
}

impl Expr {
    /// Visit every `binding.attribute` reference in this expression
    pub fn references(&self) -> Vec<(&str, &str)> {
        let mut refs = Vec::new();
        self.collect_references(&mut refs);
        refs
    }

    fn collect_references<'a>(&'a self, refs: &mut Vec<(&'a str, &'a str)>) {
        match self {
            Expr::Reference { binding, attribute } => refs.push((binding, attribute)),
            Expr::List(items) | Expr::Template(items) => {
                for item in items {
                    item.collect_references(refs);
                }
            }
            Expr::Map(entries) => {
                for (_, v) in entries {
                    v.collect_references(refs);
                }
            }
            _ => {}
        }
    }
}

/// Type expression for variables
#[derive(Debug, Clone, PartialEq)]
pub enum TypeExpr {
    String,
    Bool,
    Int,
    List(Box<TypeExpr>),
    Map(Box<TypeExpr>),
}

impl fmt::Display for TypeExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeExpr::String => write!(f, "string"),
            TypeExpr::Bool => write!(f, "bool"),
            TypeExpr::Int => write!(f, "int"),
            TypeExpr::List(inner) => write!(f, "list({})", inner),
            TypeExpr::Map(inner) => write!(f, "map({})", inner),
        }
    }
}

/// Provider configuration
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub name: String,
    pub attributes: HashMap<String, Expr>,
}

/// Backend configuration for state storage
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Backend type (e.g., "s3", "local")
    pub backend_type: String,
    /// Backend-specific attributes
    pub attributes: HashMap<String, Expr>,
}

/// `variable name: type { ... }`
#[derive(Debug, Clone)]
pub struct VariableDecl {
    pub name: String,
    pub type_expr: TypeExpr,
    pub default: Option<Expr>,
    pub sensitive: bool,
    pub description: Option<String>,
    pub line: usize,
}

/// `let binding = provider.service.kind { ... }`
#[derive(Debug, Clone)]
pub struct ResourceDecl {
    pub binding: String,
    pub resource_type: String,
    pub attributes: HashMap<String, Expr>,
    pub depends_on: Vec<String>,
    pub line: usize,
}

/// `output name { value = ... }`
#[derive(Debug, Clone)]
pub struct OutputDecl {
    pub name: String,
    pub value: Expr,
    pub sensitive: bool,
    pub description: Option<String>,
    pub line: usize,
}

/// Parse result
#[derive(Debug, Clone, Default)]
pub struct ParsedFile {
    pub providers: Vec<ProviderConfig>,
    pub backend: Option<BackendConfig>,
    pub variables: Vec<VariableDecl>,
    pub resources: Vec<ResourceDecl>,
    pub outputs: Vec<OutputDecl>,
}

impl ParsedFile {
    /// Merge another document into this one. Duplicate declarations are
    /// left for the loader to report, except a second backend block.
    pub fn merge(&mut self, other: ParsedFile) -> Result<(), ParseError> {
        if let Some(backend) = other.backend {
            if self.backend.is_some() {
                return Err(ParseError::DuplicateBlock {
                    kind: "backend",
                    name: backend.backend_type,
                });
            }
            self.backend = Some(backend);
        }
        self.providers.extend(other.providers);
        self.variables.extend(other.variables);
        self.resources.extend(other.resources);
        self.outputs.extend(other.outputs);
        Ok(())
    }
}

/// Parse a .trc document
pub fn parse(input: &str) -> Result<ParsedFile, ParseError> {
    let pairs = TerraceParser::parse(Rule::file, input).map_err(Box::new)?;

    let mut parsed = ParsedFile::default();

    for pair in pairs {
        if pair.as_rule() != Rule::file {
            continue;
        }
        for stmt in pair.into_inner() {
            match stmt.as_rule() {
                Rule::provider_block => {
                    let (name, attributes) = parse_named_block(stmt)?;
                    parsed.providers.push(ProviderConfig { name, attributes });
                }
                Rule::backend_block => {
                    let (backend_type, attributes) = parse_named_block(stmt)?;
                    if parsed.backend.is_some() {
                        return Err(ParseError::DuplicateBlock {
                            kind: "backend",
                            name: backend_type,
                        });
                    }
                    parsed.backend = Some(BackendConfig {
                        backend_type,
                        attributes,
                    });
                }
                Rule::variable_block => parsed.variables.push(parse_variable_block(stmt)?),
                Rule::output_block => parsed.outputs.push(parse_output_block(stmt)?),
                Rule::let_binding => parsed.resources.push(parse_let_binding(stmt)?),
                _ => {}
            }
        }
    }

    Ok(parsed)
}

fn line_of(pair: &Pair<Rule>) -> usize {
    pair.as_span().start_pos().line_col().0
}

/// Take the next pair, which the grammar guarantees to exist
fn next_pair<'a>(pairs: &mut Pairs<'a, Rule>, line: usize) -> Result<Pair<'a, Rule>, ParseError> {
    pairs.next().ok_or_else(|| ParseError::InvalidExpression {
        line,
        message: "unexpected end of block".to_string(),
    })
}

/// Parse `keyword name { attributes }`
fn parse_named_block(pair: Pair<Rule>) -> Result<(String, HashMap<String, Expr>), ParseError> {
    let line = line_of(&pair);
    let mut inner = pair.into_inner();
    let name = next_pair(&mut inner, line)?.as_str().to_string();
    let attributes = parse_attributes(inner)?;
    Ok((name, attributes))
}

fn parse_variable_block(pair: Pair<Rule>) -> Result<VariableDecl, ParseError> {
    let line = line_of(&pair);
    let mut inner = pair.into_inner().peekable();
    let name = inner
        .next()
        .ok_or_else(|| ParseError::InvalidExpression {
            line,
            message: "variable without a name".to_string(),
        })?
        .as_str()
        .to_string();

    let type_expr = match inner.peek() {
        Some(p) if p.as_rule() == Rule::type_expr => match inner.next() {
            Some(p) => parse_type_expr(p)?,
            None => TypeExpr::String,
        },
        _ => TypeExpr::String,
    };

    let mut attributes = parse_attributes(inner)?;
    let default = attributes.remove("default");
    let sensitive = take_bool(&mut attributes, "sensitive", line)?.unwrap_or(false);
    let description = take_string(&mut attributes, "description", line)?;
    reject_unknown(&attributes, "variable", line)?;

    Ok(VariableDecl {
        name,
        type_expr,
        default,
        sensitive,
        description,
        line,
    })
}

fn parse_attributes<'a, I>(pairs: I) -> Result<HashMap<String, Expr>, ParseError>
where
    I: Iterator<Item = Pair<'a, Rule>>,
{
    let mut attributes = HashMap::new();
    for attr_pair in pairs {
        if attr_pair.as_rule() != Rule::attribute {
            continue;
        }
        let line = line_of(&attr_pair);
        let mut attr_inner = attr_pair.into_inner();
        let key = next_pair(&mut attr_inner, line)?.as_str().to_string();
        let value = parse_expression(next_pair(&mut attr_inner, line)?)?;
        if attributes.insert(key.clone(), value).is_some() {
            return Err(ParseError::DuplicateAttribute { name: key, line });
        }
    }
    Ok(attributes)
}

fn parse_output_block(pair: Pair<Rule>) -> Result<OutputDecl, ParseError> {
    let (name, mut attributes) = parse_named_block(pair.clone())?;
    let line = line_of(&pair);
    let value = attributes
        .remove("value")
        .ok_or_else(|| ParseError::InvalidExpression {
            line,
            message: format!("output '{}' must have a 'value' attribute", name),
        })?;
    let sensitive = take_bool(&mut attributes, "sensitive", line)?.unwrap_or(false);
    let description = take_string(&mut attributes, "description", line)?;
    reject_unknown(&attributes, "output", line)?;

    Ok(OutputDecl {
        name,
        value,
        sensitive,
        description,
        line,
    })
}

fn parse_let_binding(pair: Pair<Rule>) -> Result<ResourceDecl, ParseError> {
    let line = line_of(&pair);
    let mut inner = pair.into_inner();
    let binding = next_pair(&mut inner, line)?.as_str().to_string();
    let resource_type = next_pair(&mut inner, line)?.as_str().to_string();
    let mut attributes = parse_attributes(inner)?;

    let depends_on = match attributes.remove("depends_on") {
        None => Vec::new(),
        Some(Expr::List(items)) => items
            .into_iter()
            .map(|item| match item {
                Expr::Binding(name) => Ok(name),
                other => Err(ParseError::InvalidExpression {
                    line,
                    message: format!(
                        "depends_on entries must be binding names, got {:?}",
                        other
                    ),
                }),
            })
            .collect::<Result<Vec<_>, _>>()?,
        Some(_) => {
            return Err(ParseError::InvalidExpression {
                line,
                message: "depends_on must be a list of binding names".to_string(),
            });
        }
    };

    Ok(ResourceDecl {
        binding,
        resource_type,
        attributes,
        depends_on,
        line,
    })
}

fn take_bool(
    attributes: &mut HashMap<String, Expr>,
    key: &str,
    line: usize,
) -> Result<Option<bool>, ParseError> {
    match attributes.remove(key) {
        None => Ok(None),
        Some(Expr::Bool(b)) => Ok(Some(b)),
        Some(_) => Err(ParseError::InvalidExpression {
            line,
            message: format!("'{}' must be true or false", key),
        }),
    }
}

fn take_string(
    attributes: &mut HashMap<String, Expr>,
    key: &str,
    line: usize,
) -> Result<Option<String>, ParseError> {
    match attributes.remove(key) {
        None => Ok(None),
        Some(Expr::String(s)) => Ok(Some(s)),
        Some(_) => Err(ParseError::InvalidExpression {
            line,
            message: format!("'{}' must be a string literal", key),
        }),
    }
}

fn reject_unknown(
    attributes: &HashMap<String, Expr>,
    kind: &str,
    line: usize,
) -> Result<(), ParseError> {
    let mut keys: Vec<_> = attributes.keys().collect();
    keys.sort();
    match keys.first() {
        None => Ok(()),
        Some(key) => Err(ParseError::InvalidExpression {
            line,
            message: format!("unknown {} attribute '{}'", kind, key),
        }),
    }
}

/// Parse type expression
fn parse_type_expr(pair: Pair<Rule>) -> Result<TypeExpr, ParseError> {
    let line = line_of(&pair);
    let inner = next_pair(&mut pair.into_inner(), line)?;
    match inner.as_rule() {
        Rule::type_simple => match inner.as_str() {
            "int" => Ok(TypeExpr::Int),
            "bool" => Ok(TypeExpr::Bool),
            _ => Ok(TypeExpr::String),
        },
        Rule::type_list => {
            let element = parse_type_expr(next_pair(&mut inner.into_inner(), line)?)?;
            Ok(TypeExpr::List(Box::new(element)))
        }
        Rule::type_map => {
            let element = parse_type_expr(next_pair(&mut inner.into_inner(), line)?)?;
            Ok(TypeExpr::Map(Box::new(element)))
        }
        _ => Err(ParseError::InvalidExpression {
            line,
            message: format!("unknown type '{}'", inner.as_str()),
        }),
    }
}

fn parse_expression(pair: Pair<Rule>) -> Result<Expr, ParseError> {
    let line = line_of(&pair);
    let inner = if pair.as_rule() == Rule::expression {
        next_pair(&mut pair.into_inner(), line)?
    } else {
        pair
    };

    match inner.as_rule() {
        Rule::env_call => {
            let name_pair = next_pair(&mut inner.into_inner(), line)?;
            match parse_string(name_pair)? {
                Expr::String(name) => Ok(Expr::Env(name)),
                _ => Err(ParseError::InvalidExpression {
                    line,
                    message: "env() takes a plain string".to_string(),
                }),
            }
        }
        Rule::list => {
            let items: Result<Vec<Expr>, ParseError> =
                inner.into_inner().map(parse_expression).collect();
            Ok(Expr::List(items?))
        }
        Rule::map => {
            let mut entries: Vec<(String, Expr)> = Vec::new();
            for entry in inner.into_inner() {
                let entry_line = line_of(&entry);
                let mut entry_inner = entry.into_inner();
                let key_pair = next_pair(&mut entry_inner, entry_line)?;
                let key = match key_pair.as_rule() {
                    Rule::string => match parse_string(key_pair)? {
                        Expr::String(s) => s,
                        _ => {
                            return Err(ParseError::InvalidExpression {
                                line: entry_line,
                                message: "map keys cannot be interpolated".to_string(),
                            });
                        }
                    },
                    _ => key_pair.as_str().to_string(),
                };
                let value = parse_expression(next_pair(&mut entry_inner, entry_line)?)?;
                if entries.iter().any(|(k, _)| *k == key) {
                    return Err(ParseError::DuplicateAttribute {
                        name: key,
                        line: entry_line,
                    });
                }
                entries.push((key, value));
            }
            Ok(Expr::Map(entries))
        }
        Rule::boolean => Ok(Expr::Bool(inner.as_str() == "true")),
        Rule::number => {
            inner
                .as_str()
                .parse::<i64>()
                .map(Expr::Int)
                .map_err(|e| ParseError::InvalidExpression {
                    line,
                    message: format!("invalid integer '{}': {}", inner.as_str(), e),
                })
        }
        Rule::string => parse_string(inner),
        Rule::reference => parse_reference(inner.as_str(), line),
        _ => Err(ParseError::InvalidExpression {
            line,
            message: format!("unexpected expression '{}'", inner.as_str()),
        }),
    }
}

fn parse_reference(text: &str, line: usize) -> Result<Expr, ParseError> {
    let parts: Vec<&str> = text.split('.').collect();
    match parts.as_slice() {
        [name] => Ok(Expr::Binding(name.to_string())),
        ["var", name] => Ok(Expr::Variable(name.to_string())),
        [binding, attribute] => Ok(Expr::Reference {
            binding: binding.to_string(),
            attribute: attribute.to_string(),
        }),
        _ => Err(ParseError::InvalidExpression {
            line,
            message: format!(
                "'{}' is not a valid reference, expected binding.attribute or var.name",
                text
            ),
        }),
    }
}

/// Parse a string literal, producing a template when it interpolates
fn parse_string(pair: Pair<Rule>) -> Result<Expr, ParseError> {
    let line = line_of(&pair);
    let mut parts = Vec::new();
    let mut literal = String::new();

    for part in pair.into_inner() {
        match part.as_rule() {
            Rule::literal_chars => literal.push_str(part.as_str()),
            Rule::escape => literal.push(match part.as_str() {
                "\\n" => '\n',
                "\\t" => '\t',
                "\\r" => '\r',
                "\\$" => '$',
                "\\\"" => '"',
                _ => '\\',
            }),
            Rule::interpolation => {
                if !literal.is_empty() {
                    parts.push(Expr::String(std::mem::take(&mut literal)));
                }
                let reference = next_pair(&mut part.into_inner(), line)?;
                let expr = parse_reference(reference.as_str(), line)?;
                if let Expr::Binding(name) = &expr {
                    return Err(ParseError::InvalidExpression {
                        line,
                        message: format!(
                            "'${{{}}}' must reference an attribute or variable",
                            name
                        ),
                    });
                }
                parts.push(expr);
            }
            _ => {}
        }
    }

    if parts.is_empty() {
        return Ok(Expr::String(literal));
    }
    if !literal.is_empty() {
        parts.push(Expr::String(literal));
    }
    Ok(Expr::Template(parts))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_provider_block() {
        let input = r#"
            provider aws {
                region = "ap-southeast-2"
            }
        "#;

        let result = parse(input).unwrap();
        assert_eq!(result.providers.len(), 1);
        assert_eq!(result.providers[0].name, "aws");
        assert_eq!(
            result.providers[0].attributes.get("region"),
            Some(&Expr::String("ap-southeast-2".to_string()))
        );
    }

    #[test]
    fn parse_backend_block() {
        let input = r#"
            backend s3 {
                bucket = "my-state"
                key    = "issue-extractor/terrace.state.json"
                region = "ap-southeast-2"
            }
        "#;

        let result = parse(input).unwrap();
        let backend = result.backend.unwrap();
        assert_eq!(backend.backend_type, "s3");
        assert_eq!(backend.attributes.len(), 3);
    }

    #[test]
    fn parse_duplicate_backend_fails() {
        let input = r#"
            backend local { path = "a.json" }
            backend local { path = "b.json" }
        "#;
        assert!(matches!(
            parse(input),
            Err(ParseError::DuplicateBlock { kind: "backend", .. })
        ));
    }

    #[test]
    fn parse_resource_binding() {
        let input = r#"
            let logs = aws.logs.log_group {
                name = "/aws/lambda/github-issue-extractor"
                retention_in_days = 14
            }
        "#;

        let result = parse(input).unwrap();
        assert_eq!(result.resources.len(), 1);

        let resource = &result.resources[0];
        assert_eq!(resource.binding, "logs");
        assert_eq!(resource.resource_type, "aws.logs.log_group");
        assert_eq!(
            resource.attributes.get("retention_in_days"),
            Some(&Expr::Int(14))
        );
    }

    #[test]
    fn parse_variables() {
        let input = r#"
            variable repo_owner: string {
                default = "pandas-dev"
                description = "Owner of the repository to extract"
            }
            variable github_token_secret_name { sensitive = true }
            variable tags: map(string) { default = {} }
            variable subnets: list(string) { default = ["a", "b"] }
        "#;

        let result = parse(input).unwrap();
        assert_eq!(result.variables.len(), 4);

        let owner = &result.variables[0];
        assert_eq!(owner.name, "repo_owner");
        assert_eq!(owner.type_expr, TypeExpr::String);
        assert_eq!(owner.default, Some(Expr::String("pandas-dev".to_string())));
        assert!(!owner.sensitive);

        let token = &result.variables[1];
        assert!(token.sensitive);
        assert!(token.default.is_none());

        assert_eq!(
            result.variables[2].type_expr,
            TypeExpr::Map(Box::new(TypeExpr::String))
        );
        assert_eq!(result.variables[3].type_expr.to_string(), "list(string)");
    }

    #[test]
    fn parse_unknown_variable_attribute_fails() {
        let input = r#"variable x: string { colour = "red" }"#;
        assert!(parse(input).is_err());
    }

    #[test]
    fn parse_references_and_variables() {
        let input = r#"
            let function = aws.lambda.function {
                name = var.function_name
                role = role.arn
                depends_on = [logs, policy]
            }
        "#;

        let result = parse(input).unwrap();
        let resource = &result.resources[0];
        assert_eq!(
            resource.attributes.get("name"),
            Some(&Expr::Variable("function_name".to_string()))
        );
        assert_eq!(
            resource.attributes.get("role"),
            Some(&Expr::Reference {
                binding: "role".to_string(),
                attribute: "arn".to_string()
            })
        );
        assert_eq!(resource.depends_on, vec!["logs", "policy"]);
        assert!(!resource.attributes.contains_key("depends_on"));
    }

    #[test]
    fn parse_interpolation() {
        let input = r#"
            let policy = aws.iam.role_policy {
                name = "access"
                document = { Resource = "${bucket.arn}/*" }
            }
        "#;

        let result = parse(input).unwrap();
        let Some(Expr::Map(entries)) = result.resources[0].attributes.get("document") else {
            panic!("expected map");
        };
        assert_eq!(
            entries[0].1,
            Expr::Template(vec![
                Expr::Reference {
                    binding: "bucket".to_string(),
                    attribute: "arn".to_string()
                },
                Expr::String("/*".to_string()),
            ])
        );
    }

    #[test]
    fn parse_escapes() {
        let input = r#"
            output greeting { value = "line\n\"quoted\" \${not_a_ref}" }
        "#;
        let result = parse(input).unwrap();
        assert_eq!(
            result.outputs[0].value,
            Expr::String("line\n\"quoted\" ${not_a_ref}".to_string())
        );
    }

    #[test]
    fn parse_json_style_map() {
        let input = r#"
            let role = aws.iam.role {
                name = "r"
                assume_role_policy = {
                    "Version": "2012-10-17",
                    "Statement": [{
                        "Effect": "Allow",
                        "Principal": { "Service": "lambda.amazonaws.com" },
                        "Action": "sts:AssumeRole",
                    }],
                }
            }
        "#;

        let result = parse(input).unwrap();
        let Some(Expr::Map(entries)) = result.resources[0].attributes.get("assume_role_policy")
        else {
            panic!("expected map");
        };
        assert_eq!(entries[0].0, "Version");
        assert!(matches!(entries[1].1, Expr::List(_)));
    }

    #[test]
    fn parse_env_call() {
        let input = r#"provider aws { region = env("AWS_REGION") }"#;
        let result = parse(input).unwrap();
        assert_eq!(
            result.providers[0].attributes.get("region"),
            Some(&Expr::Env("AWS_REGION".to_string()))
        );
    }

    #[test]
    fn parse_outputs() {
        let input = r#"
            output function_arn {
                value = function.arn
                description = "ARN of the extractor function"
            }
            output token { value = var.token sensitive = true }
        "#;

        let result = parse(input).unwrap();
        assert_eq!(result.outputs.len(), 2);
        assert_eq!(result.outputs[0].name, "function_arn");
        assert!(result.outputs[1].sensitive);
    }

    #[test]
    fn parse_output_without_value_fails() {
        let input = r#"output empty { description = "nothing" }"#;
        assert!(matches!(
            parse(input),
            Err(ParseError::InvalidExpression { .. })
        ));
    }

    #[test]
    fn parse_comments() {
        let input = r#"
            # hash comment
            // slash comment
            let bucket = aws.s3.bucket { # trailing
                name = "data" // trailing
            }
        "#;
        assert_eq!(parse(input).unwrap().resources.len(), 1);
    }

    #[test]
    fn parse_duplicate_attribute_fails() {
        let input = r#"
            let bucket = aws.s3.bucket {
                name = "a"
                name = "b"
            }
        "#;
        assert!(matches!(
            parse(input),
            Err(ParseError::DuplicateAttribute { .. })
        ));
    }

    #[test]
    fn parse_syntax_error() {
        let input = "let bucket = aws.s3.bucket { name = }";
        assert!(matches!(parse(input), Err(ParseError::Syntax(_))));
    }

    #[test]
    fn parse_invalid_depends_on_fails() {
        let input = r#"
            let bucket = aws.s3.bucket {
                name = "a"
                depends_on = ["role"]
            }
        "#;
        assert!(parse(input).is_err());
    }

    #[test]
    fn merge_documents() {
        let mut a = parse(r#"backend local { path = "x.json" }"#).unwrap();
        let b = parse(r#"let bucket = aws.s3.bucket { name = "a" }"#).unwrap();
        a.merge(b).unwrap();
        assert_eq!(a.resources.len(), 1);

        let c = parse(r#"backend local { path = "y.json" }"#).unwrap();
        assert!(a.merge(c).is_err());
    }
}
