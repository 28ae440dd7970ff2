//! Typed description of the output an extraction must produce.
//!
//! Schemas are built in code or imported from a JSON Schema document, and are
//! handed to a reasoning backend as a response format. Backend output is
//! pruned (unknown keys and `null` on optional fields removed) and then checked
//! with `jsonschema`, collecting every problem instead of stopping at the first.

use std::fmt;

use jsonschema::error::ValidationErrorKind as SchemaViolation;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum SchemaError {
    #[error("invalid JSON schema: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExtractionSchema {
    String {
        min_length: Option<usize>,
        max_length: Option<usize>,
    },
    Number {
        integer: bool,
        minimum: Option<f64>,
        maximum: Option<f64>,
    },
    Boolean,
    Array {
        items: Box<ExtractionSchema>,
        min_items: Option<usize>,
        max_items: Option<usize>,
    },
    Object {
        fields: Vec<SchemaField>,
    },
    /// A JSON Schema document used as written.
    Document(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchemaField {
    pub name: String,
    pub schema: ExtractionSchema,
    pub required: bool,
    pub description: Option<String>,
}

impl SchemaField {
    pub fn required(name: impl Into<String>, schema: ExtractionSchema) -> Self {
        Self {
            name: name.into(),
            schema,
            required: true,
            description: None,
        }
    }

    pub fn optional(name: impl Into<String>, schema: ExtractionSchema) -> Self {
        Self {
            required: false,
            ..Self::required(name, schema)
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

impl ExtractionSchema {
    pub fn string() -> Self {
        Self::String {
            min_length: None,
            max_length: None,
        }
    }

    pub fn number() -> Self {
        Self::Number {
            integer: false,
            minimum: None,
            maximum: None,
        }
    }

    pub fn integer() -> Self {
        Self::Number {
            integer: true,
            minimum: None,
            maximum: None,
        }
    }

    pub fn boolean() -> Self {
        Self::Boolean
    }

    pub fn array(items: ExtractionSchema) -> Self {
        Self::Array {
            items: Box::new(items),
            min_items: None,
            max_items: None,
        }
    }

    pub fn object(fields: impl IntoIterator<Item = SchemaField>) -> Self {
        Self::Object {
            fields: fields.into_iter().collect(),
        }
    }

    /// Lower bound for numbers. Ignored on other kinds.
    pub fn with_minimum(mut self, bound: f64) -> Self {
        if let Self::Number { minimum, .. } = &mut self {
            *minimum = Some(bound);
        }
        self
    }

    /// Upper bound for numbers. Ignored on other kinds.
    pub fn with_maximum(mut self, bound: f64) -> Self {
        if let Self::Number { maximum, .. } = &mut self {
            *maximum = Some(bound);
        }
        self
    }

    /// Length bounds for strings, item-count bounds for arrays.
    pub fn with_len_bounds(mut self, min: Option<usize>, max: Option<usize>) -> Self {
        match &mut self {
            Self::String {
                min_length,
                max_length,
            } => {
                *min_length = min;
                *max_length = max;
            }
            Self::Array {
                min_items,
                max_items,
                ..
            } => {
                *min_items = min;
                *max_items = max;
            }
            _ => {}
        }
        self
    }

    pub fn has_field(&self, name: &str) -> bool {
        match self {
            Self::Object { fields } => fields.iter().any(|field| field.name == name),
            Self::Document(document) => document
                .get("properties")
                .and_then(Value::as_object)
                .is_some_and(|properties| properties.contains_key(name)),
            _ => false,
        }
    }

    pub fn to_json_schema(&self) -> Value {
        let mut out = Map::new();
        match self {
            Self::String {
                min_length,
                max_length,
            } => {
                out.insert("type".into(), Value::from("string"));
                insert_opt(&mut out, "minLength", min_length.map(Value::from));
                insert_opt(&mut out, "maxLength", max_length.map(Value::from));
            }
            Self::Number {
                integer,
                minimum,
                maximum,
            } => {
                let kind = if *integer { "integer" } else { "number" };
                out.insert("type".into(), Value::from(kind));
                insert_opt(&mut out, "minimum", minimum.map(Value::from));
                insert_opt(&mut out, "maximum", maximum.map(Value::from));
            }
            Self::Boolean => {
                out.insert("type".into(), Value::from("boolean"));
            }
            Self::Array {
                items,
                min_items,
                max_items,
            } => {
                out.insert("type".into(), Value::from("array"));
                out.insert("items".into(), items.to_json_schema());
                insert_opt(&mut out, "minItems", min_items.map(Value::from));
                insert_opt(&mut out, "maxItems", max_items.map(Value::from));
            }
            Self::Object { fields } => {
                let mut properties = Map::new();
                let mut required = Vec::new();
                for field in fields {
                    let mut property = field.schema.to_json_schema();
                    if let (Some(description), Value::Object(map)) =
                        (&field.description, &mut property)
                    {
                        map.insert("description".into(), Value::from(description.as_str()));
                    }
                    properties.insert(field.name.clone(), property);
                    if field.required {
                        required.push(Value::from(field.name.as_str()));
                    }
                }
                out.insert("type".into(), Value::from("object"));
                out.insert("properties".into(), Value::Object(properties));
                out.insert("required".into(), Value::Array(required));
                out.insert("additionalProperties".into(), Value::Bool(false));
            }
            Self::Document(document) => return document.clone(),
        }
        Value::Object(out)
    }

    /// Accept a JSON Schema document. Every keyword is kept and enforced at
    /// validation time; the document only has to compile.
    pub fn from_json_schema(value: &Value) -> Result<Self, SchemaError> {
        jsonschema::validator_for(value).map_err(|err| SchemaError::Invalid(err.to_string()))?;
        Ok(Self::Document(value.clone()))
    }

    /// Check `value` against this schema.
    ///
    /// Returns the cleaned value (unknown object keys removed, `null` on
    /// fields that do not accept it dropped) together with every validation
    /// error found, ordered by path.
    pub fn validate(&self, value: &Value) -> (Value, Vec<ValidationError>) {
        let document = self.to_json_schema();
        let cleaned = prune(&document, value);
        let validator = match jsonschema::validator_for(&document) {
            Ok(validator) => validator,
            Err(err) => {
                let error = ValidationError::new(
                    "$",
                    ValidationErrorKind::InvalidSchema {
                        detail: err.to_string(),
                    },
                );
                return (cleaned, vec![error]);
            }
        };

        let mut errors: Vec<ValidationError> = validator
            .iter_errors(&cleaned)
            .map(|violation| convert_violation(&document, &cleaned, &violation))
            .collect();
        errors.sort_by(|a, b| a.path.cmp(&b.path));
        (cleaned, errors)
    }
}

fn insert_opt(map: &mut Map<String, Value>, key: &str, value: Option<Value>) {
    if let Some(value) = value {
        map.insert(key.to_string(), value);
    }
}

/// Drop object keys the schema does not declare and `null` values on
/// properties that do not accept null, so an absent optional field validates
/// and a `null` required field reports as missing.
fn prune(schema: &Value, value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
                return value.clone();
            };
            if schema
                .get("additionalProperties")
                .is_some_and(Value::is_object)
            {
                return value.clone();
            }
            let mut cleaned = Map::new();
            for (key, item) in map {
                let Some(property) = properties.get(key) else {
                    continue;
                };
                if item.is_null() && !accepts_null(property) {
                    continue;
                }
                cleaned.insert(key.clone(), prune(property, item));
            }
            Value::Object(cleaned)
        }
        Value::Array(items) => match schema.get("items") {
            Some(item_schema) if item_schema.is_object() => {
                Value::Array(items.iter().map(|item| prune(item_schema, item)).collect())
            }
            _ => value.clone(),
        },
        _ => value.clone(),
    }
}

fn accepts_null(schema: &Value) -> bool {
    let typed_null = match schema.get("type") {
        Some(Value::String(kind)) => kind == "null",
        Some(Value::Array(kinds)) => kinds.iter().any(|kind| kind.as_str() == Some("null")),
        _ => false,
    };
    typed_null
        || ["anyOf", "oneOf"].iter().any(|key| {
            schema
                .get(*key)
                .and_then(Value::as_array)
                .is_some_and(|alternatives| alternatives.iter().any(accepts_null))
        })
}

fn convert_violation(
    document: &Value,
    instance: &Value,
    violation: &jsonschema::ValidationError<'_>,
) -> ValidationError {
    let path = display_path(instance, &violation.instance_path.to_string());
    match &violation.kind {
        SchemaViolation::Required { property } => {
            let name = property
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| property.to_string());
            ValidationError::new(format!("{path}.{name}"), ValidationErrorKind::MissingField)
        }
        SchemaViolation::Type { .. } => {
            let expected = document
                .pointer(&violation.schema_path.to_string())
                .map(describe_type)
                .unwrap_or_else(|| "a different type".to_string());
            ValidationError::new(
                path,
                ValidationErrorKind::TypeMismatch {
                    expected,
                    found: json_type_name(&violation.instance).to_string(),
                },
            )
        }
        _ => ValidationError::new(
            path,
            ValidationErrorKind::OutOfRange {
                detail: violation.to_string(),
            },
        ),
    }
}

fn describe_type(kind: &Value) -> String {
    match kind {
        Value::String(kind) => kind.clone(),
        Value::Array(kinds) => kinds
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(" or "),
        other => other.to_string(),
    }
}

/// Turn a JSON pointer into the `$.field[2]` notation, using the instance to
/// tell array indices from object keys.
fn display_path(instance: &Value, pointer: &str) -> String {
    let mut path = String::from("$");
    let mut current = Some(instance);
    for raw in pointer.split('/').skip(1) {
        let segment = raw.replace("~1", "/").replace("~0", "~");
        match current {
            Some(Value::Array(items)) => {
                current = segment.parse::<usize>().ok().and_then(|index| items.get(index));
                path.push('[');
                path.push_str(&segment);
                path.push(']');
            }
            Some(Value::Object(map)) => {
                current = map.get(&segment);
                path.push('.');
                path.push_str(&segment);
            }
            _ => {
                current = None;
                path.push('.');
                path.push_str(&segment);
            }
        }
    }
    path
}

/// A single problem found while validating backend output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationError {
    /// Location of the problem: `$`, `$.field`, `$.list[2]`.
    pub path: String,
    #[serde(flatten)]
    pub kind: ValidationErrorKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ValidationErrorKind {
    MissingField,
    TypeMismatch { expected: String, found: String },
    /// Any other constraint: bounds, lengths, `enum`, `const`, `pattern`.
    OutOfRange { detail: String },
    MalformedOutput { detail: String },
    InvalidSchema { detail: String },
}

impl ValidationError {
    pub fn new(path: impl Into<String>, kind: ValidationErrorKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }

    /// Output that could not be interpreted at all.
    pub fn malformed(detail: impl Into<String>) -> Self {
        Self::new(
            "$",
            ValidationErrorKind::MalformedOutput {
                detail: detail.into(),
            },
        )
    }

    pub fn is_missing_field(&self) -> bool {
        matches!(self.kind, ValidationErrorKind::MissingField)
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ValidationErrorKind::MissingField => write!(f, "{}: missing required field", self.path),
            ValidationErrorKind::TypeMismatch { expected, found } => {
                write!(f, "{}: expected {expected}, found {found}", self.path)
            }
            ValidationErrorKind::OutOfRange { detail } => write!(f, "{}: {detail}", self.path),
            ValidationErrorKind::MalformedOutput { detail } => {
                write!(f, "{}: malformed output: {detail}", self.path)
            }
            ValidationErrorKind::InvalidSchema { detail } => {
                write!(f, "{}: invalid schema: {detail}", self.path)
            }
        }
    }
}

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
