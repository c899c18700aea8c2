//! Aspect payload validation against JSON schemas (draft-07 keywords).
//!
//! Assertion keywords are checked; annotation keywords (`title`, `$id`,
//! `definitions`, `x-*` extensions, ...) are skipped. Any other keyword is
//! reported as unsupported so that a schema the validator cannot fully
//! evaluate never lets a payload through.

use regex::Regex;
use serde_json::{Map, Value};

use irs_shared::{IrsError, Result};

use crate::ValidationService;

/// Nesting limit for `$ref` chains.
const MAX_REF_DEPTH: usize = 32;

/// Keywords that carry no assertion.
const ANNOTATIONS: &[&str] = &[
    "$schema",
    "$id",
    "id",
    "$comment",
    "title",
    "description",
    "default",
    "examples",
    "definitions",
    "$defs",
    "components",
    "readOnly",
    "writeOnly",
    "deprecated",
    "contentMediaType",
    "contentEncoding",
];

/// Keywords evaluated by [`check`] and its helpers.
const ASSERTIONS: &[&str] = &[
    "$ref",
    "type",
    "enum",
    "const",
    "allOf",
    "anyOf",
    "oneOf",
    "not",
    "if",
    "then",
    "else",
    "required",
    "properties",
    "patternProperties",
    "additionalProperties",
    "propertyNames",
    "minProperties",
    "maxProperties",
    "dependencies",
    "items",
    "additionalItems",
    "minItems",
    "maxItems",
    "uniqueItems",
    "contains",
    "minLength",
    "maxLength",
    "pattern",
    "format",
    "minimum",
    "maximum",
    "exclusiveMinimum",
    "exclusiveMaximum",
    "multipleOf",
];

/// Structural JSON schema validator.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSchemaValidator;

impl ValidationService for JsonSchemaValidator {
    fn validate(&self, payload: &Value, schema: &Value) -> Result<()> {
        let errors = errors_for(schema, schema, payload, "$", 0);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(IrsError::validation(errors.join("; ")))
        }
    }
}

fn errors_for(root: &Value, schema: &Value, value: &Value, path: &str, depth: usize) -> Vec<String> {
    let mut errors = Vec::new();
    check(root, schema, value, path, depth, &mut errors);
    errors
}

fn matches(root: &Value, schema: &Value, value: &Value, path: &str, depth: usize) -> bool {
    errors_for(root, schema, value, path, depth).is_empty()
}

fn check(root: &Value, schema: &Value, value: &Value, path: &str, depth: usize, errors: &mut Vec<String>) {
    let schema = match schema {
        Value::Bool(true) => return,
        Value::Bool(false) => {
            errors.push(format!("{path}: no value is allowed here"));
            return;
        }
        Value::Object(schema) => schema,
        other => {
            errors.push(format!("{path}: malformed schema {other}"));
            return;
        }
    };

    // Siblings of `$ref` are ignored in draft-07.
    if let Some(reference) = schema.get("$ref").and_then(Value::as_str) {
        if depth >= MAX_REF_DEPTH {
            errors.push(format!("{path}: $ref nesting too deep at '{reference}'"));
            return;
        }
        match resolve(root, reference) {
            Some(target) => check(root, target, value, path, depth + 1, errors),
            None => errors.push(format!("{path}: unresolvable $ref '{reference}'")),
        }
        return;
    }

    let unsupported: Vec<&str> = schema
        .keys()
        .map(String::as_str)
        .filter(|k| !k.starts_with("x-") && !ANNOTATIONS.contains(k) && !ASSERTIONS.contains(k))
        .collect();
    if !unsupported.is_empty() {
        errors.push(format!("{path}: unsupported schema keyword(s) {}", unsupported.join(", ")));
        return;
    }

    if let Some(expected) = schema.get("type") {
        if !type_matches(expected, value) {
            errors.push(format!("{path}: expected type {expected}, got {}", type_name(value)));
            return;
        }
    }

    if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
        if !allowed.iter().any(|candidate| json_eq(candidate, value)) {
            errors.push(format!("{path}: value {value} not in enum"));
        }
    }
    if let Some(expected) = schema.get("const") {
        if !json_eq(expected, value) {
            errors.push(format!("{path}: value {value} is not {expected}"));
        }
    }

    check_combinators(root, schema, value, path, depth, errors);

    match value {
        Value::Object(object) => check_object(root, schema, object, path, depth, errors),
        Value::Array(array) => check_array(root, schema, array, path, depth, errors),
        Value::String(text) => check_string(schema, text, path, errors),
        Value::Number(_) => check_number(schema, value, path, errors),
        _ => {}
    }
}

fn check_combinators(
    root: &Value,
    schema: &Map<String, Value>,
    value: &Value,
    path: &str,
    depth: usize,
    errors: &mut Vec<String>,
) {
    if let Some(all) = schema.get("allOf").and_then(Value::as_array) {
        for sub in all {
            check(root, sub, value, path, depth, errors);
        }
    }
    if let Some(any) = schema.get("anyOf").and_then(Value::as_array) {
        if !any.iter().any(|sub| matches(root, sub, value, path, depth)) {
            errors.push(format!("{path}: matches none of anyOf"));
        }
    }
    if let Some(one) = schema.get("oneOf").and_then(Value::as_array) {
        let hits = one.iter().filter(|sub| matches(root, sub, value, path, depth)).count();
        if hits != 1 {
            errors.push(format!("{path}: matches {hits} of oneOf, expected exactly 1"));
        }
    }
    if let Some(not) = schema.get("not") {
        if matches(root, not, value, path, depth) {
            errors.push(format!("{path}: must not match 'not' schema"));
        }
    }
    if let Some(condition) = schema.get("if") {
        let branch = if matches(root, condition, value, path, depth) {
            schema.get("then")
        } else {
            schema.get("else")
        };
        if let Some(branch) = branch {
            check(root, branch, value, path, depth, errors);
        }
    }
}

fn check_object(
    root: &Value,
    schema: &Map<String, Value>,
    object: &Map<String, Value>,
    path: &str,
    depth: usize,
    errors: &mut Vec<String>,
) {
    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
            if !object.contains_key(name) {
                errors.push(format!("{path}: missing required property '{name}'"));
            }
        }
    }

    if let Some(min) = schema.get("minProperties").and_then(Value::as_u64) {
        if (object.len() as u64) < min {
            errors.push(format!("{path}: expected at least {min} properties"));
        }
    }
    if let Some(max) = schema.get("maxProperties").and_then(Value::as_u64) {
        if object.len() as u64 > max {
            errors.push(format!("{path}: expected at most {max} properties"));
        }
    }

    let properties = schema.get("properties").and_then(Value::as_object);
    let mut patterns = Vec::new();
    if let Some(pattern_properties) = schema.get("patternProperties").and_then(Value::as_object) {
        for (pattern, sub) in pattern_properties {
            match Regex::new(pattern) {
                Ok(re) => patterns.push((re, sub)),
                Err(e) => errors.push(format!("{path}: invalid patternProperties regex '{pattern}': {e}")),
            }
        }
    }
    let additional = schema.get("additionalProperties");

    for (name, property) in object {
        let property_path = format!("{path}.{name}");
        let mut covered = false;
        if let Some(sub) = properties.and_then(|p| p.get(name)) {
            covered = true;
            check(root, sub, property, &property_path, depth, errors);
        }
        for (re, sub) in &patterns {
            if re.is_match(name) {
                covered = true;
                check(root, sub, property, &property_path, depth, errors);
            }
        }
        if !covered {
            match additional {
                Some(Value::Bool(false)) => {
                    errors.push(format!("{path}: additional property '{name}' is not allowed"));
                }
                Some(sub) => check(root, sub, property, &property_path, depth, errors),
                None => {}
            }
        }
        if let Some(names) = schema.get("propertyNames") {
            check(root, names, &Value::String(name.clone()), &property_path, depth, errors);
        }
    }

    if let Some(dependencies) = schema.get("dependencies").and_then(Value::as_object) {
        for (name, dependency) in dependencies {
            if !object.contains_key(name) {
                continue;
            }
            match dependency {
                Value::Array(needed) => {
                    for other in needed.iter().filter_map(Value::as_str) {
                        if !object.contains_key(other) {
                            errors.push(format!("{path}: property '{name}' requires '{other}'"));
                        }
                    }
                }
                sub => check(root, sub, &Value::Object(object.clone()), path, depth, errors),
            }
        }
    }
}

fn check_array(
    root: &Value,
    schema: &Map<String, Value>,
    array: &[Value],
    path: &str,
    depth: usize,
    errors: &mut Vec<String>,
) {
    if let Some(min) = schema.get("minItems").and_then(Value::as_u64) {
        if (array.len() as u64) < min {
            errors.push(format!("{path}: expected at least {min} items, got {}", array.len()));
        }
    }
    if let Some(max) = schema.get("maxItems").and_then(Value::as_u64) {
        if array.len() as u64 > max {
            errors.push(format!("{path}: expected at most {max} items, got {}", array.len()));
        }
    }
    if schema.get("uniqueItems").and_then(Value::as_bool) == Some(true) {
        let duplicate = array
            .iter()
            .enumerate()
            .any(|(i, a)| array[i + 1..].iter().any(|b| json_eq(a, b)));
        if duplicate {
            errors.push(format!("{path}: items are not unique"));
        }
    }

    match schema.get("items") {
        Some(Value::Array(tuple)) => {
            for (index, item) in array.iter().enumerate() {
                let item_path = format!("{path}[{index}]");
                match tuple.get(index) {
                    Some(sub) => check(root, sub, item, &item_path, depth, errors),
                    None => match schema.get("additionalItems") {
                        Some(Value::Bool(false)) => {
                            errors.push(format!("{item_path}: additional item is not allowed"));
                        }
                        Some(sub) => check(root, sub, item, &item_path, depth, errors),
                        None => {}
                    },
                }
            }
        }
        Some(items) => {
            for (index, item) in array.iter().enumerate() {
                check(root, items, item, &format!("{path}[{index}]"), depth, errors);
            }
        }
        None => {}
    }

    if let Some(contains) = schema.get("contains") {
        if !array.iter().any(|item| matches(root, contains, item, path, depth)) {
            errors.push(format!("{path}: no item matches 'contains'"));
        }
    }
}

fn check_string(schema: &Map<String, Value>, text: &str, path: &str, errors: &mut Vec<String>) {
    let length = text.chars().count() as u64;
    if let Some(min) = schema.get("minLength").and_then(Value::as_u64) {
        if length < min {
            errors.push(format!("{path}: shorter than {min} characters"));
        }
    }
    if let Some(max) = schema.get("maxLength").and_then(Value::as_u64) {
        if length > max {
            errors.push(format!("{path}: longer than {max} characters"));
        }
    }
    if let Some(pattern) = schema.get("pattern").and_then(Value::as_str) {
        match Regex::new(pattern) {
            Ok(re) if re.is_match(text) => {}
            Ok(_) => errors.push(format!("{path}: '{text}' does not match pattern '{pattern}'")),
            Err(e) => errors.push(format!("{path}: invalid pattern '{pattern}': {e}")),
        }
    }
    if let Some(format) = schema.get("format").and_then(Value::as_str) {
        match format_matches(format, text) {
            Some(true) => {}
            Some(false) => errors.push(format!("{path}: '{text}' is not a valid {format}")),
            None => errors.push(format!("{path}: unsupported format '{format}'")),
        }
    }
}

/// `None` for formats the validator does not know.
fn format_matches(format: &str, text: &str) -> Option<bool> {
    let valid = match format {
        "date-time" => chrono::DateTime::parse_from_rfc3339(text).is_ok(),
        "date" => chrono::NaiveDate::parse_from_str(text, "%Y-%m-%d").is_ok(),
        "time" => chrono::NaiveTime::parse_from_str(text.trim_end_matches('Z'), "%H:%M:%S%.f").is_ok(),
        "uri" | "iri" => url::Url::parse(text).is_ok(),
        "uri-reference" | "iri-reference" => !text.chars().any(char::is_whitespace),
        "uuid" => uuid::Uuid::parse_str(text).is_ok(),
        "email" | "idn-email" => text
            .split_once('@')
            .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.')),
        "regex" => Regex::new(text).is_ok(),
        _ => return None,
    };
    Some(valid)
}

fn check_number(schema: &Map<String, Value>, value: &Value, path: &str, errors: &mut Vec<String>) {
    let Some(number) = value.as_f64() else {
        return;
    };
    let bound = |key: &str| schema.get(key).and_then(Value::as_f64);

    // Draft-04 spelled exclusivity as a boolean next to minimum/maximum.
    let exclusive_flag = |key: &str| schema.get(key).and_then(Value::as_bool).unwrap_or(false);

    if let Some(min) = bound("minimum") {
        if number < min || (exclusive_flag("exclusiveMinimum") && number == min) {
            errors.push(format!("{path}: {number} is below minimum {min}"));
        }
    }
    if let Some(max) = bound("maximum") {
        if number > max || (exclusive_flag("exclusiveMaximum") && number == max) {
            errors.push(format!("{path}: {number} is above maximum {max}"));
        }
    }
    if let Some(min) = bound("exclusiveMinimum") {
        if number <= min {
            errors.push(format!("{path}: {number} must be greater than {min}"));
        }
    }
    if let Some(max) = bound("exclusiveMaximum") {
        if number >= max {
            errors.push(format!("{path}: {number} must be less than {max}"));
        }
    }
    if let Some(step) = bound("multipleOf") {
        let quotient = number / step;
        if step <= 0.0 || (quotient - quotient.round()).abs() > 1e-9 {
            errors.push(format!("{path}: {number} is not a multiple of {step}"));
        }
    }
}

/// JSON equality with numbers compared by value (`1` equals `1.0`).
fn json_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Array(x), Value::Array(y)) => x.len() == y.len() && x.iter().zip(y).all(|(a, b)| json_eq(a, b)),
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len() && x.iter().all(|(k, v)| y.get(k).is_some_and(|w| json_eq(v, w)))
        }
        _ => a == b,
    }
}

/// Resolve a document-local reference such as `#/components/schemas/Quantity`.
fn resolve<'a>(root: &'a Value, reference: &str) -> Option<&'a Value> {
    let pointer = reference.strip_prefix('#')?;
    if pointer.is_empty() {
        Some(root)
    } else {
        root.pointer(pointer)
    }
}

fn type_matches(expected: &Value, value: &Value) -> bool {
    match expected {
        Value::String(name) => is_type(name, value),
        Value::Array(names) => names
            .iter()
            .filter_map(Value::as_str)
            .any(|name| is_type(name, value)),
        _ => true,
    }
}

fn is_type(name: &str, value: &Value) -> bool {
    match name {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64() || value.as_f64().is_some_and(|f| f.fract() == 0.0),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
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

    fn bom_schema() -> Value {
        json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "type": "object",
            "required": ["catenaXId", "childItems"],
            "properties": {
                "catenaXId": { "type": "string" },
                "childItems": {
                    "type": "array",
                    "items": { "$ref": "#/components/schemas/ChildData" }
                }
            },
            "components": {
                "schemas": {
                    "ChildData": {
                        "type": "object",
                        "required": ["catenaXId"],
                        "properties": {
                            "catenaXId": { "type": "string" },
                            "lifecycleContext": { "enum": ["asBuilt", "asPlanned"] },
                            "quantity": {
                                "type": "object",
                                "properties": { "quantityNumber": { "type": "number" } }
                            }
                        }
                    }
                }
            }
        })
    }

    #[test]
    fn accepts_conforming_payload() {
        let payload = json!({
            "catenaXId": "urn:uuid:1",
            "childItems": [
                { "catenaXId": "urn:uuid:2", "lifecycleContext": "asBuilt", "quantity": { "quantityNumber": 2.5 } }
            ]
        });
        assert!(JsonSchemaValidator.validate(&payload, &bom_schema()).is_ok());
    }

    #[test]
    fn reports_every_violation_with_path() {
        let payload = json!({
            "childItems": [
                { "lifecycleContext": "asDesigned" },
                { "catenaXId": 7 }
            ]
        });
        let err = JsonSchemaValidator
            .validate(&payload, &bom_schema())
            .unwrap_err()
            .to_string();
        assert!(err.contains("$: missing required property 'catenaXId'"));
        assert!(err.contains("$.childItems[0]: missing required property 'catenaXId'"));
        assert!(err.contains("$.childItems[0].lifecycleContext"));
        assert!(err.contains("$.childItems[1].catenaXId: expected type \"string\", got number"));
    }

    #[test]
    fn union_types_and_integers() {
        let schema = json!({ "type": ["integer", "null"] });
        assert!(JsonSchemaValidator.validate(&json!(3), &schema).is_ok());
        assert!(JsonSchemaValidator.validate(&json!(null), &schema).is_ok());
        assert!(JsonSchemaValidator.validate(&json!(3.5), &schema).is_err());
    }

    fn strict_bom_schema() -> Value {
        json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "type": "object",
            "additionalProperties": false,
            "properties": {
                "catenaXId": {
                    "type": "string",
                    "pattern": "^urn:uuid:[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$"
                },
                "quantity": { "type": "number", "minimum": 0 },
                "childItems": { "type": "array", "minItems": 1 }
            }
        })
    }

    #[test]
    fn rejects_pattern_bound_and_additional_property_violations() {
        let payload = json!({
            "catenaXId": "not-a-urn",
            "quantity": -5,
            "childItems": [],
            "bogus": true
        });
        let err = JsonSchemaValidator
            .validate(&payload, &strict_bom_schema())
            .unwrap_err()
            .to_string();
        assert!(err.contains("$.catenaXId: 'not-a-urn' does not match pattern"));
        assert!(err.contains("$.quantity: -5 is below minimum 0"));
        assert!(err.contains("$.childItems: expected at least 1 items, got 0"));
        assert!(err.contains("$: additional property 'bogus' is not allowed"));

        let conforming = json!({
            "catenaXId": "urn:uuid:00000000-0000-0000-0000-000000000001",
            "quantity": 2,
            "childItems": [{}]
        });
        assert!(JsonSchemaValidator.validate(&conforming, &strict_bom_schema()).is_ok());
    }

    #[test]
    fn combinators_and_formats() {
        let schema = json!({
            "oneOf": [
                { "type": "string", "format": "date-time" },
                { "type": "integer", "exclusiveMinimum": 0 }
            ]
        });
        assert!(JsonSchemaValidator.validate(&json!("2024-03-01T10:00:00Z"), &schema).is_ok());
        assert!(JsonSchemaValidator.validate(&json!(4), &schema).is_ok());
        assert!(JsonSchemaValidator.validate(&json!("yesterday"), &schema).is_err());
        assert!(JsonSchemaValidator.validate(&json!(0), &schema).is_err());

        let not_empty = json!({ "not": { "const": "" }, "anyOf": [{ "maxLength": 3 }, { "format": "uuid" }] });
        assert!(JsonSchemaValidator.validate(&json!("abc"), &not_empty).is_ok());
        assert!(JsonSchemaValidator.validate(&json!(""), &not_empty).is_err());
        assert!(JsonSchemaValidator.validate(&json!("abcdef"), &not_empty).is_err());
    }

    #[test]
    fn unknown_keywords_fail_closed() {
        let schema = json!({ "type": "object", "unevaluatedProperties": false, "x-samm-urn": "urn:x" });
        let err = JsonSchemaValidator.validate(&json!({}), &schema).unwrap_err().to_string();
        assert!(err.contains("unsupported schema keyword(s) unevaluatedProperties"));

        let annotated = json!({ "title": "Part", "description": "d", "x-samm-urn": "urn:x", "type": "object" });
        assert!(JsonSchemaValidator.validate(&json!({}), &annotated).is_ok());

        let odd_format = json!({ "type": "string", "format": "int64" });
        assert!(JsonSchemaValidator.validate(&json!("1"), &odd_format).is_err());
    }

    #[test]
    fn dangling_reference_is_an_error() {
        let schema = json!({ "$ref": "#/definitions/Missing" });
        let err = JsonSchemaValidator.validate(&json!({}), &schema).unwrap_err();
        assert!(matches!(err, IrsError::Validation { .. }));
    }
}
