//! Structural schema checks for step parameters and outputs.
//!
//! Only the subset of JSON Schema that workflow nodes actually declare is
//! understood: an object with `properties` (each with a primitive `type`, or
//! a list of them) and a `required` list. Anything else in the schema is
//! ignored.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{SchemaTarget, SchemaValidationError, Violation};

/// The primitive kinds a property can be declared as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
    Null,
}

impl ValueKind {
    pub fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => match value {
                Value::Number(n) => {
                    n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0)
                }
                _ => false,
            },
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
            Self::Null => value.is_null(),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
            Self::Null => "null",
        }
    }
}

/// `"type": "string"` or `"type": ["string", "null"]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TypeSpec {
    One(ValueKind),
    Any(Vec<ValueKind>),
}

impl TypeSpec {
    fn matches(&self, value: &Value) -> bool {
        match self {
            Self::One(kind) => kind.matches(value),
            Self::Any(kinds) => kinds.iter().any(|k| k.matches(value)),
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::One(kind) => kind.as_str().to_string(),
            Self::Any(kinds) => kinds
                .iter()
                .map(|k| k.as_str())
                .collect::<Vec<_>>()
                .join(" or "),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PropertySchema {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<TypeSpec>,
}

/// A declared `inputSchema` / `outputSchema`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ObjectSchema {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ValueKind>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, PropertySchema>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
}

impl ObjectSchema {
    pub fn new() -> Self {
        Self {
            kind: Some(ValueKind::Object),
            ..Self::default()
        }
    }

    /// Builder-style: declare a property of the given kind.
    pub fn property(mut self, name: &str, kind: ValueKind) -> Self {
        self.properties.insert(
            name.to_string(),
            PropertySchema {
                kind: Some(TypeSpec::One(kind)),
            },
        );
        self
    }

    /// Builder-style: mark a property as required.
    pub fn require(mut self, name: &str) -> Self {
        self.required.push(name.to_string());
        self
    }

    /// Check `value` against this schema, collecting every violation.
    pub fn validate(
        &self,
        step_id: &str,
        target: SchemaTarget,
        value: &Value,
    ) -> Result<(), SchemaValidationError> {
        let fail = |violations| SchemaValidationError {
            step_id: step_id.to_string(),
            target,
            violations,
        };

        let Some(object) = value.as_object() else {
            return Err(fail(vec![Violation::NotAnObject {
                found: kind_name(value),
            }]));
        };

        let mut violations = Vec::new();

        for field in &self.required {
            if !object.contains_key(field) {
                violations.push(Violation::Missing(field.clone()));
            }
        }

        for (field, prop) in &self.properties {
            let (Some(spec), Some(found)) = (&prop.kind, object.get(field)) else {
                continue;
            };
            if !spec.matches(found) {
                violations.push(Violation::WrongType {
                    field: field.clone(),
                    expected: spec.describe(),
                    found: kind_name(found),
                });
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(fail(violations))
        }
    }
}

/// Check an optional schema; absence is a no-op.
pub fn validate_optional(
    schema: Option<&ObjectSchema>,
    step_id: &str,
    target: SchemaTarget,
    value: &Value,
) -> Result<(), SchemaValidationError> {
    match schema {
        Some(schema) => schema.validate(step_id, target, value),
        None => Ok(()),
    }
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
