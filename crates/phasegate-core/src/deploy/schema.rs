//! Minimal record schema and its validator.
//!
//! Deployment data is either one JSON object or an array of objects; every
//! record is checked for required fields and declared field types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::backend::{CheckOutcome, ValidationResult, Validator};

/// JSON type a field must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
    Any,
}

impl FieldType {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
            Self::Any => true,
        }
    }
}

/// Record schema.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldType>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a required field of the given type.
    pub fn require(mut self, field: impl Into<String>, ty: FieldType) -> Self {
        let field = field.into();
        if !self.required.contains(&field) {
            self.required.push(field.clone());
        }
        self.fields.insert(field, ty);
        self
    }

    /// Declare an optional typed field.
    pub fn optional(mut self, field: impl Into<String>, ty: FieldType) -> Self {
        self.fields.insert(field.into(), ty);
        self
    }
}

/// Records of `data`: the object itself, or each element of an array.
pub(crate) fn records(data: &Value) -> Option<Vec<&Value>> {
    match data {
        Value::Object(_) => Some(vec![data]),
        Value::Array(items) => Some(items.iter().collect()),
        _ => None,
    }
}

/// Check `data` against `schema`, collecting one error per violation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaValidator;

impl Validator for SchemaValidator {
    fn validate(&self, data: &Value, schema: &Schema) -> ValidationResult {
        let mut result = ValidationResult::new();
        let Some(records) = records(data) else {
            result.record(
                "schema",
                CheckOutcome::Failed("expected an object or an array of objects".to_string()),
            );
            return result;
        };
        if records.is_empty() {
            result.record("schema", CheckOutcome::Warning("dataset has no records".to_string()));
            return result;
        }

        let mut violations = Vec::new();
        for (i, record) in records.iter().enumerate() {
            let Some(obj) = record.as_object() else {
                violations.push(format!("record {i} is not an object"));
                continue;
            };
            for field in &schema.required {
                if obj.get(field).map_or(true, Value::is_null) {
                    violations.push(format!("record {i} missing required field '{field}'"));
                }
            }
            for (field, ty) in &schema.fields {
                if let Some(value) = obj.get(field).filter(|v| !v.is_null()) {
                    if !ty.matches(value) {
                        violations.push(format!("record {i} field '{field}' is not {ty:?}"));
                    }
                }
            }
        }

        if violations.is_empty() {
            result.record("schema", CheckOutcome::Passed);
        } else {
            result.record("schema", CheckOutcome::Failed(violations.join("; ")));
        }
        result
    }
}
