//! Field validation gate.
//!
//! Payloads are checked against a schema of required fields before any
//! network call is made. A rejected payload is dropped by the caller.

use serde_json::Value;

use crate::reading::SensorKind;

/// Expected JSON kind of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Number,
    String,
}

impl FieldKind {
    fn matches(&self, value: &Value) -> bool {
        match self {
            FieldKind::Number => value.is_number(),
            FieldKind::String => value.is_string(),
        }
    }
}

impl std::fmt::Display for FieldKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldKind::Number => write!(f, "number"),
            FieldKind::String => write!(f, "string"),
        }
    }
}

/// Required field names and their kinds.
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    fields: Vec<(String, FieldKind)>,
}

impl Schema {
    pub fn new() -> Self {
        Self { fields: Vec::new() }
    }

    /// Require a field of the given kind.
    pub fn field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push((name.into(), kind));
        self
    }

    /// Every sensor must be present and numeric.
    pub fn sensor_reading() -> Self {
        SensorKind::all()
            .iter()
            .fold(Self::new(), |schema, kind| {
                schema.field(kind.name(), FieldKind::Number)
            })
    }

    /// Six numeric host metrics plus a string timestamp.
    pub fn diagnostics() -> Self {
        Self::new()
            .field("cpu_usage", FieldKind::Number)
            .field("cpu_temperature", FieldKind::Number)
            .field("memory_usage", FieldKind::Number)
            .field("disk_usage", FieldKind::Number)
            .field("network_usage", FieldKind::Number)
            .field("system_uptime", FieldKind::Number)
            .field("timestamp", FieldKind::String)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl Default for Schema {
    fn default() -> Self {
        Self::new()
    }
}

/// Reason a payload was rejected.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// The payload is not a JSON object
    NotAnObject,

    /// A required field is absent
    MissingField(String),

    /// A field is present with the wrong kind
    WrongKind {
        field: String,
        expected: FieldKind,
        found: &'static str,
    },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::NotAnObject => write!(f, "payload is not an object"),
            ValidationError::MissingField(field) => write!(f, "missing field '{}'", field),
            ValidationError::WrongKind {
                field,
                expected,
                found,
            } => write!(f, "field '{}' expected {}, found {}", field, expected, found),
        }
    }
}

impl std::error::Error for ValidationError {}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Check a payload against a schema.
///
/// Pure; the first failing field is reported.
pub fn check(payload: &Value, schema: &Schema) -> Result<(), ValidationError> {
    let object = payload.as_object().ok_or(ValidationError::NotAnObject)?;

    for (name, kind) in &schema.fields {
        let value = object
            .get(name)
            .ok_or_else(|| ValidationError::MissingField(name.clone()))?;

        if !kind.matches(value) {
            return Err(ValidationError::WrongKind {
                field: name.clone(),
                expected: *kind,
                found: kind_name(value),
            });
        }
    }

    Ok(())
}
