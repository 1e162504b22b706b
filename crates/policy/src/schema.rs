use std::collections::BTreeMap;
use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Argument value types the schema language understands. A deliberate
/// subset of JSON Schema: enough to gate what reaches a command line,
/// nothing more.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl PropType {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            PropType::String => value.is_string(),
            PropType::Integer => value.is_i64() || value.is_u64(),
            PropType::Number => value.is_number(),
            PropType::Boolean => value.is_boolean(),
            PropType::Array => value.is_array(),
            PropType::Object => value.is_object(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PropType::String => "string",
            PropType::Integer => "integer",
            PropType::Number => "number",
            PropType::Boolean => "boolean",
            PropType::Array => "array",
            PropType::Object => "object",
        }
    }
}

/// A regex constraint kept alongside its source text so it can be
/// echoed back in violation messages and in `list_tools` output.
#[derive(Debug, Clone)]
pub struct Pattern {
    pub source: String,
    pub regex: Regex,
}

#[derive(Debug, Clone)]
pub struct PropertySpec {
    pub prop_type: PropType,
    pub description: Option<String>,
    pub enum_values: Option<Vec<Value>>,
    pub pattern: Option<Pattern>,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
}

/// Compiled argument schema for one tool. Patterns are compiled when the
/// policy loads, so validation never pays a compile and never hits a
/// late regex syntax error.
#[derive(Debug, Clone, Default)]
pub struct ArgsSchema {
    pub properties: BTreeMap<String, PropertySpec>,
    pub required: Vec<String>,
    pub additional_properties: bool,
}

impl ArgsSchema {
    /// Renders the schema in JSON-Schema style for `list_tools`
    /// consumers. Output is deterministic: properties are held in a
    /// sorted map and serde_json keeps object keys ordered.
    pub fn to_json(&self) -> Value {
        let mut props = Map::new();
        for (name, spec) in &self.properties {
            let mut p = Map::new();
            p.insert("type".into(), Value::String(spec.prop_type.name().into()));
            if let Some(desc) = &spec.description {
                p.insert("description".into(), Value::String(desc.clone()));
            }
            if let Some(values) = &spec.enum_values {
                p.insert("enum".into(), Value::Array(values.clone()));
            }
            if let Some(pattern) = &spec.pattern {
                p.insert("pattern".into(), Value::String(pattern.source.clone()));
            }
            if let Some(min) = spec.min_length {
                p.insert("minLength".into(), Value::from(min));
            }
            if let Some(max) = spec.max_length {
                p.insert("maxLength".into(), Value::from(max));
            }
            props.insert(name.clone(), Value::Object(p));
        }
        let mut schema = Map::new();
        schema.insert("type".into(), Value::String("object".into()));
        schema.insert("properties".into(), Value::Object(props));
        schema.insert(
            "required".into(),
            Value::Array(self.required.iter().cloned().map(Value::String).collect()),
        );
        schema.insert(
            "additionalProperties".into(),
            Value::Bool(self.additional_properties),
        );
        Value::Object(schema)
    }
}

/// One reason a set of arguments was rejected.
#[derive(Debug, Clone, PartialEq)]
pub enum Violation {
    MissingRequired { field: String },
    WrongType { field: String, expected: PropType, actual: &'static str },
    NotInEnum { field: String, allowed: String },
    PatternMismatch { field: String, pattern: String },
    TooShort { field: String, length: usize, min: usize },
    TooLong { field: String, length: usize, max: usize },
    UnexpectedProperty { field: String },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::MissingRequired { field } => {
                write!(f, "'{field}' is required but missing")
            }
            Violation::WrongType { field, expected, actual } => {
                write!(f, "'{field}' must be a {}, got {actual}", expected.name())
            }
            Violation::NotInEnum { field, allowed } => {
                write!(f, "'{field}' must be one of [{allowed}]")
            }
            Violation::PatternMismatch { field, pattern } => {
                write!(f, "'{field}' does not match pattern '{pattern}'")
            }
            Violation::TooShort { field, length, min } => {
                write!(f, "'{field}' is {length} characters, minimum is {min}")
            }
            Violation::TooLong { field, length, max } => {
                write!(f, "'{field}' is {length} characters, maximum is {max}")
            }
            Violation::UnexpectedProperty { field } => {
                write!(f, "'{field}' is not an accepted argument")
            }
        }
    }
}

/// All the ways one call's arguments failed its tool's schema,
/// reported together so the caller can fix everything in one pass.
#[derive(Debug, Clone)]
pub struct SchemaError {
    pub tool: String,
    pub violations: Vec<Violation>,
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid arguments for tool '{}': ", self.tool)?;
        for (i, violation) in self.violations.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{violation}")?;
        }
        Ok(())
    }
}

impl std::error::Error for SchemaError {}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn render_enum(values: &[Value]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Checks `args` against `schema`, collecting every violation rather
/// than stopping at the first. Violation order is stable: missing
/// required fields in schema order, then per-argument problems in
/// argument key order.
pub fn validate_args(
    schema: &ArgsSchema,
    args: &Map<String, Value>,
    tool: &str,
) -> Result<(), SchemaError> {
    let mut violations = Vec::new();

    for name in &schema.required {
        if !args.contains_key(name) {
            violations.push(Violation::MissingRequired { field: name.clone() });
        }
    }

    for (name, value) in args {
        let Some(spec) = schema.properties.get(name) else {
            if !schema.additional_properties {
                violations.push(Violation::UnexpectedProperty { field: name.clone() });
            }
            continue;
        };
        if !spec.prop_type.matches(value) {
            violations.push(Violation::WrongType {
                field: name.clone(),
                expected: spec.prop_type,
                actual: json_type_name(value),
            });
            continue;
        }
        if let Some(values) = &spec.enum_values {
            if !values.contains(value) {
                violations.push(Violation::NotInEnum {
                    field: name.clone(),
                    allowed: render_enum(values),
                });
            }
        }
        if let Some(text) = value.as_str() {
            let length = text.chars().count();
            if let Some(min) = spec.min_length {
                if length < min {
                    violations.push(Violation::TooShort { field: name.clone(), length, min });
                }
            }
            if let Some(max) = spec.max_length {
                if length > max {
                    violations.push(Violation::TooLong { field: name.clone(), length, max });
                }
            }
            if let Some(pattern) = &spec.pattern {
                if !pattern.regex.is_match(text) {
                    violations.push(Violation::PatternMismatch {
                        field: name.clone(),
                        pattern: pattern.source.clone(),
                    });
                }
            }
        }
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(SchemaError { tool: tool.to_string(), violations })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> ArgsSchema {
        let mut properties = BTreeMap::new();
        properties.insert(
            "message".to_string(),
            PropertySpec {
                prop_type: PropType::String,
                description: Some("what to say".to_string()),
                enum_values: None,
                pattern: None,
                min_length: Some(1),
                max_length: Some(10),
            },
        );
        properties.insert(
            "level".to_string(),
            PropertySpec {
                prop_type: PropType::String,
                description: None,
                enum_values: Some(vec![json!("info"), json!("warn")]),
                pattern: None,
                min_length: None,
                max_length: None,
            },
        );
        properties.insert(
            "count".to_string(),
            PropertySpec {
                prop_type: PropType::Integer,
                description: None,
                enum_values: None,
                pattern: None,
                min_length: None,
                max_length: None,
            },
        );
        ArgsSchema {
            properties,
            required: vec!["message".to_string()],
            additional_properties: false,
        }
    }

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_valid_args_pass() {
        let result = validate_args(&schema(), &args(json!({"message": "hi", "count": 3})), "t");
        assert!(result.is_ok());
    }

    #[test]
    fn test_missing_required() {
        let err = validate_args(&schema(), &args(json!({})), "t").unwrap_err();
        assert_eq!(err.violations, vec![Violation::MissingRequired { field: "message".into() }]);
    }

    #[test]
    fn test_wrong_type() {
        let err = validate_args(&schema(), &args(json!({"message": 5})), "t").unwrap_err();
        assert!(matches!(err.violations[0], Violation::WrongType { .. }));
        assert!(err.to_string().contains("must be a string, got number"));
    }

    #[test]
    fn test_collects_all_violations() {
        let err = validate_args(
            &schema(),
            &args(json!({"count": "three", "level": "debug", "extra": 1})),
            "t",
        )
        .unwrap_err();
        // missing message, bad count type, level outside enum, unexpected extra
        assert_eq!(err.violations.len(), 4);
        assert!(matches!(err.violations[0], Violation::MissingRequired { .. }));
    }

    #[test]
    fn test_unexpected_property_rejected() {
        let err = validate_args(&schema(), &args(json!({"message": "hi", "bogus": true})), "t")
            .unwrap_err();
        assert_eq!(err.violations, vec![Violation::UnexpectedProperty { field: "bogus".into() }]);
    }

    #[test]
    fn test_additional_properties_allowed_when_open() {
        let mut open = schema();
        open.additional_properties = true;
        let result = validate_args(&open, &args(json!({"message": "hi", "bogus": true})), "t");
        assert!(result.is_ok());
    }

    #[test]
    fn test_length_bounds() {
        let err = validate_args(&schema(), &args(json!({"message": ""})), "t").unwrap_err();
        assert!(matches!(err.violations[0], Violation::TooShort { .. }));
        let err =
            validate_args(&schema(), &args(json!({"message": "well over ten"})), "t").unwrap_err();
        assert!(matches!(err.violations[0], Violation::TooLong { .. }));
    }

    #[test]
    fn test_pattern_constraint() {
        let mut with_pattern = schema();
        if let Some(spec) = with_pattern.properties.get_mut("message") {
            spec.pattern = Some(Pattern {
                source: "^[a-z]+$".to_string(),
                regex: Regex::new("^[a-z]+$").unwrap(),
            });
        }
        assert!(validate_args(&with_pattern, &args(json!({"message": "hello"})), "t").is_ok());
        let err =
            validate_args(&with_pattern, &args(json!({"message": "Hello"})), "t").unwrap_err();
        assert!(matches!(err.violations[0], Violation::PatternMismatch { .. }));
    }

    #[test]
    fn test_integer_rejects_float() {
        let err = validate_args(&schema(), &args(json!({"message": "hi", "count": 1.5})), "t")
            .unwrap_err();
        assert!(matches!(err.violations[0], Violation::WrongType { .. }));
    }

    #[test]
    fn test_schema_json_rendering() {
        let rendered = schema().to_json();
        assert_eq!(rendered["type"], "object");
        assert_eq!(rendered["properties"]["message"]["type"], "string");
        assert_eq!(rendered["properties"]["message"]["maxLength"], 10);
        assert_eq!(rendered["required"][0], "message");
        assert_eq!(rendered["additionalProperties"], false);
        // rendering is stable across calls
        assert_eq!(
            serde_json::to_string(&rendered).unwrap(),
            serde_json::to_string(&schema().to_json()).unwrap()
        );
    }
}
