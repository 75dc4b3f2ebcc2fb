//! JSON Schema validation for form submissions
//!
//! Supports the keyword subset forms use: `type` (string or list), `enum`,
//! `const`, `properties`, `required`, `additionalProperties`, `items`,
//! `minItems`/`maxItems`, `minLength`/`maxLength`, `pattern`, `format`
//! (`email`, `date`, `date-time`) and the numeric bounds including the
//! exclusive forms. Unknown keywords are ignored.
//!
//! Error paths are JSON pointers relative to the submitted document: `""`
//! for the root, `/amount`, `/lines/0/sku`.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One violation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub path: String,
    pub message: String,
}

/// Result of validating a document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<FieldError>,
}

impl ValidationReport {
    /// Error messages joined for logs and error values
    pub fn summary(&self) -> String {
        self.errors
            .iter()
            .map(|e| {
                if e.path.is_empty() {
                    e.message.clone()
                } else {
                    format!("{}: {}", e.path, e.message)
                }
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Validate a complete submission
pub fn validate(schema: &Value, data: &Value) -> ValidationReport {
    Validator::new(false).run(schema, data)
}

/// Validate a partial submission (drafts): `required` is not enforced
pub fn validate_partial(schema: &Value, data: &Value) -> ValidationReport {
    Validator::new(true).run(schema, data)
}

fn email_regex() -> &'static Regex {
    static EMAIL: OnceLock<Regex> = OnceLock::new();
    EMAIL.get_or_init(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("static regex"))
}

struct Validator {
    partial: bool,
    errors: Vec<FieldError>,
}

impl Validator {
    fn new(partial: bool) -> Self {
        Self {
            partial,
            errors: Vec::new(),
        }
    }

    fn run(mut self, schema: &Value, data: &Value) -> ValidationReport {
        self.check(schema, data, "");
        ValidationReport {
            valid: self.errors.is_empty(),
            errors: self.errors,
        }
    }

    fn fail(&mut self, path: &str, message: impl Into<String>) {
        self.errors.push(FieldError {
            path: path.to_string(),
            message: message.into(),
        });
    }

    fn check(&mut self, schema: &Value, data: &Value, path: &str) {
        let schema = match schema {
            Value::Bool(true) => return,
            Value::Bool(false) => {
                self.fail(path, "no value is allowed here");
                return;
            }
            Value::Object(schema) => schema,
            _ => return,
        };

        if let Some(expected) = schema.get("type") {
            if !type_matches(expected, data) {
                self.fail(
                    path,
                    format!("expected {}, got {}", describe_type(expected), type_name(data)),
                );
                return;
            }
        }

        if let Some(Value::Array(allowed)) = schema.get("enum") {
            if !allowed.contains(data) {
                self.fail(path, format!("must be one of {}", Value::Array(allowed.clone())));
            }
        }

        if let Some(expected) = schema.get("const") {
            if expected != data {
                self.fail(path, format!("must equal {expected}"));
            }
        }

        match data {
            Value::Object(object) => self.check_object(schema, object, path),
            Value::Array(items) => self.check_array(schema, items, path),
            Value::String(s) => self.check_string(schema, s, path),
            Value::Number(n) => {
                if let Some(n) = n.as_f64() {
                    self.check_number(schema, n, path);
                }
            }
            _ => {}
        }
    }

    fn check_object(&mut self, schema: &Map<String, Value>, object: &Map<String, Value>, path: &str) {
        if !self.partial {
            if let Some(Value::Array(required)) = schema.get("required") {
                for name in required.iter().filter_map(Value::as_str) {
                    if !object.contains_key(name) {
                        self.fail(&child_path(path, name), "is required");
                    }
                }
            }
        }

        let properties = schema.get("properties").and_then(Value::as_object);
        let additional = schema.get("additionalProperties");

        for (key, value) in object {
            let child = child_path(path, key);
            match properties.and_then(|p| p.get(key)) {
                Some(sub) => self.check(sub, value, &child),
                None => match additional {
                    Some(Value::Bool(false)) => self.fail(&child, "is not allowed"),
                    Some(sub @ Value::Object(_)) => self.check(sub, value, &child),
                    _ => {}
                },
            }
        }
    }

    fn check_array(&mut self, schema: &Map<String, Value>, items: &[Value], path: &str) {
        if let Some(min) = schema.get("minItems").and_then(Value::as_u64) {
            if (items.len() as u64) < min {
                self.fail(path, format!("must have at least {min} items"));
            }
        }
        if let Some(max) = schema.get("maxItems").and_then(Value::as_u64) {
            if (items.len() as u64) > max {
                self.fail(path, format!("must have at most {max} items"));
            }
        }
        if let Some(item_schema) = schema.get("items") {
            for (i, item) in items.iter().enumerate() {
                self.check(item_schema, item, &child_path(path, &i.to_string()));
            }
        }
    }

    fn check_string(&mut self, schema: &Map<String, Value>, s: &str, path: &str) {
        let len = s.chars().count() as u64;
        if let Some(min) = schema.get("minLength").and_then(Value::as_u64) {
            if len < min {
                self.fail(path, format!("must be at least {min} characters"));
            }
        }
        if let Some(max) = schema.get("maxLength").and_then(Value::as_u64) {
            if len > max {
                self.fail(path, format!("must be at most {max} characters"));
            }
        }
        if let Some(pattern) = schema.get("pattern").and_then(Value::as_str) {
            match Regex::new(pattern) {
                Ok(re) if !re.is_match(s) => {
                    self.fail(path, format!("does not match pattern {pattern}"))
                }
                Ok(_) => {}
                Err(_) => self.fail(path, format!("schema pattern {pattern} is invalid")),
            }
        }
        if let Some(format) = schema.get("format").and_then(Value::as_str) {
            let ok = match format {
                "email" => email_regex().is_match(s),
                "date" => chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok(),
                "date-time" => chrono::DateTime::parse_from_rfc3339(s).is_ok(),
                _ => true,
            };
            if !ok {
                self.fail(path, format!("is not a valid {format}"));
            }
        }
    }

    fn check_number(&mut self, schema: &Map<String, Value>, n: f64, path: &str) {
        let bound = |key: &str| schema.get(key).and_then(Value::as_f64);

        if let Some(min) = bound("minimum") {
            if n < min {
                self.fail(path, format!("must be >= {min}"));
            }
        }
        if let Some(max) = bound("maximum") {
            if n > max {
                self.fail(path, format!("must be <= {max}"));
            }
        }
        if let Some(min) = bound("exclusiveMinimum") {
            if n <= min {
                self.fail(path, format!("must be > {min}"));
            }
        }
        if let Some(max) = bound("exclusiveMaximum") {
            if n >= max {
                self.fail(path, format!("must be < {max}"));
            }
        }
    }
}

fn child_path(parent: &str, segment: &str) -> String {
    format!("{parent}/{}", segment.replace('~', "~0").replace('/', "~1"))
}

fn type_matches(expected: &Value, data: &Value) -> bool {
    match expected {
        Value::String(t) => single_type_matches(t, data),
        Value::Array(types) => types
            .iter()
            .filter_map(Value::as_str)
            .any(|t| single_type_matches(t, data)),
        _ => true,
    }
}

fn single_type_matches(t: &str, data: &Value) -> bool {
    match t {
        "string" => data.is_string(),
        "number" => data.is_number(),
        "integer" => match data {
            Value::Number(n) => n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0),
            _ => false,
        },
        "boolean" => data.is_boolean(),
        "object" => data.is_object(),
        "array" => data.is_array(),
        "null" => data.is_null(),
        _ => true,
    }
}

fn describe_type(expected: &Value) -> String {
    match expected {
        Value::Array(types) => types
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(" or "),
        Value::String(t) => t.clone(),
        other => other.to_string(),
    }
}

fn type_name(data: &Value) -> &'static str {
    match data {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn approval_schema() -> Value {
        json!({
            "type": "object",
            "required": ["decision", "amount"],
            "additionalProperties": false,
            "properties": {
                "decision": { "type": "string", "enum": ["approve", "reject"] },
                "amount": { "type": "number", "minimum": 0, "maximum": 100000 },
                "comment": { "type": "string", "maxLength": 10 },
                "approver_email": { "type": "string", "format": "email" },
                "effective": { "type": "string", "format": "date" },
                "code": { "type": "string", "pattern": "^[A-Z]{3}-\\d+$" },
                "lines": {
                    "type": "array",
                    "minItems": 1,
                    "items": {
                        "type": "object",
                        "required": ["sku"],
                        "properties": { "sku": { "type": "string", "minLength": 2 } }
                    }
                }
            }
        })
    }

    #[test]
    fn test_valid_document() {
        let report = validate(
            &approval_schema(),
            &json!({
                "decision": "approve",
                "amount": 250.5,
                "approver_email": "cfo@example.com",
                "effective": "2026-01-31",
                "code": "INV-42",
                "lines": [{"sku": "AB"}]
            }),
        );
        assert!(report.valid, "{:?}", report.errors);
    }

    #[test]
    fn test_reports_paths() {
        let report = validate(
            &approval_schema(),
            &json!({
                "decision": "maybe",
                "amount": -1,
                "comment": "far too long here",
                "extra": true,
                "lines": [{"sku": "A"}, {}]
            }),
        );

        assert!(!report.valid);
        let paths: Vec<_> = report.errors.iter().map(|e| e.path.as_str()).collect();
        assert!(paths.contains(&"/decision"));
        assert!(paths.contains(&"/amount"));
        assert!(paths.contains(&"/comment"));
        assert!(paths.contains(&"/extra"));
        assert!(paths.contains(&"/lines/0/sku"));
        assert!(paths.contains(&"/lines/1/sku"));
    }

    #[test]
    fn test_missing_required() {
        let report = validate(&approval_schema(), &json!({"decision": "approve"}));
        assert_eq!(
            report.errors,
            vec![FieldError {
                path: "/amount".into(),
                message: "is required".into()
            }]
        );
    }

    #[test]
    fn test_partial_skips_required_but_checks_types() {
        let schema = approval_schema();
        assert!(validate_partial(&schema, &json!({"comment": "draft"})).valid);

        let report = validate_partial(&schema, &json!({"amount": "lots"}));
        assert!(!report.valid);
        assert_eq!(report.errors[0].path, "/amount");
    }

    #[test]
    fn test_formats() {
        let schema = approval_schema();
        let report = validate_partial(
            &schema,
            &json!({"approver_email": "nope", "effective": "31/01/2026", "code": "inv-1"}),
        );
        assert_eq!(report.errors.len(), 3);
    }

    #[test]
    fn test_type_union_and_root() {
        let schema = json!({"type": ["string", "null"]});
        assert!(validate(&schema, &Value::Null).valid);
        let report = validate(&schema, &json!(3));
        assert_eq!(report.errors[0].path, "");
        assert_eq!(report.summary(), "expected string or null, got number");
    }

    #[test]
    fn test_pointer_escaping() {
        assert_eq!(child_path("", "a/b"), "/a~1b");
        assert_eq!(child_path("/x", "m~n"), "/x/m~0n");
    }
}
