//! Trigger types: how a job is bound to an event source.
//!
//! A job has exactly one trigger. Event and invocation triggers may declare a
//! [`PayloadSchema`]; the payload is validated (and defaults applied) before a
//! run is created.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ValidationError, ValidationIssue};

// ---------------------------------------------------------------------------
// TriggerKind / TriggerSpec
// ---------------------------------------------------------------------------

/// Which kind of source created a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Event,
    Interval,
    Invoke,
}

impl TriggerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerKind::Event => "event",
            TriggerKind::Interval => "interval",
            TriggerKind::Invoke => "invoke",
        }
    }
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TriggerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "event" => Ok(TriggerKind::Event),
            "interval" => Ok(TriggerKind::Interval),
            "invoke" => Ok(TriggerKind::Invoke),
            other => Err(format!("invalid trigger kind: '{other}'")),
        }
    }
}

/// Declarative binding of a job to its event source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerSpec {
    /// Named application event (e.g. `"auto.yield.1"`).
    Event {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        schema: Option<PayloadSchema>,
    },
    /// Fixed period; fires with an empty payload.
    Interval { seconds: u64 },
    /// Explicit invocation by another run or an API caller.
    Invoke {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        schema: Option<PayloadSchema>,
    },
}

impl TriggerSpec {
    pub fn event(name: impl Into<String>) -> Self {
        TriggerSpec::Event {
            name: name.into(),
            schema: None,
        }
    }

    pub fn interval(seconds: u64) -> Self {
        TriggerSpec::Interval { seconds }
    }

    pub fn invoke() -> Self {
        TriggerSpec::Invoke { schema: None }
    }

    /// Attach a payload schema. Interval triggers ignore payloads, so the
    /// schema is dropped for them.
    pub fn with_schema(self, schema: PayloadSchema) -> Self {
        match self {
            TriggerSpec::Event { name, .. } => TriggerSpec::Event {
                name,
                schema: Some(schema),
            },
            TriggerSpec::Invoke { .. } => TriggerSpec::Invoke {
                schema: Some(schema),
            },
            interval @ TriggerSpec::Interval { .. } => interval,
        }
    }

    pub fn kind(&self) -> TriggerKind {
        match self {
            TriggerSpec::Event { .. } => TriggerKind::Event,
            TriggerSpec::Interval { .. } => TriggerKind::Interval,
            TriggerSpec::Invoke { .. } => TriggerKind::Invoke,
        }
    }

    pub fn schema(&self) -> Option<&PayloadSchema> {
        match self {
            TriggerSpec::Event { schema, .. } | TriggerSpec::Invoke { schema } => schema.as_ref(),
            TriggerSpec::Interval { .. } => None,
        }
    }

    /// Validate a payload against the declared schema, if any.
    ///
    /// Returns the normalized payload (defaults applied, unknown fields
    /// stripped unless the schema allows them).
    pub fn validate(&self, payload: Value) -> Result<Value, ValidationError> {
        match self.schema() {
            Some(schema) => schema.validate(&payload),
            None => Ok(payload),
        }
    }
}

// ---------------------------------------------------------------------------
// Payload schema
// ---------------------------------------------------------------------------

/// JSON value type accepted by a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    Any,
}

impl FieldType {
    fn accepts(self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Object => value.is_object(),
            FieldType::Array => value.is_array(),
            FieldType::Any => true,
        }
    }

    fn describe(self) -> &'static str {
        match self {
            FieldType::String => "a string",
            FieldType::Number => "a number",
            FieldType::Integer => "an integer",
            FieldType::Boolean => "a boolean",
            FieldType::Object => "an object",
            FieldType::Array => "an array",
            FieldType::Any => "any value",
        }
    }
}

/// One top-level field of a payload schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSchema {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default = "default_required")]
    pub required: bool,
    /// Value inserted when the field is absent. A field with a default is
    /// never reported as missing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

fn default_required() -> bool {
    true
}

impl FieldSchema {
    pub fn new(field_type: FieldType) -> Self {
        Self {
            field_type,
            required: true,
            default: None,
        }
    }

    pub fn string() -> Self {
        Self::new(FieldType::String)
    }

    pub fn number() -> Self {
        Self::new(FieldType::Number)
    }

    pub fn integer() -> Self {
        Self::new(FieldType::Integer)
    }

    pub fn boolean() -> Self {
        Self::new(FieldType::Boolean)
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }
}

/// Declared shape of a trigger payload (a JSON object).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PayloadSchema {
    #[serde(default)]
    pub fields: BTreeMap<String, FieldSchema>,
    /// Keep fields the schema does not declare instead of stripping them.
    #[serde(default)]
    pub allow_unknown: bool,
}

impl PayloadSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, schema: FieldSchema) -> Self {
        self.fields.insert(name.into(), schema);
        self
    }

    pub fn allow_unknown(mut self) -> Self {
        self.allow_unknown = true;
        self
    }

    /// Check `payload` and return its normalized form.
    ///
    /// Every violation is collected before failing, so the caller sees the
    /// full list of issues at once.
    pub fn validate(&self, payload: &Value) -> Result<Value, ValidationError> {
        let Some(input) = payload.as_object() else {
            return Err(ValidationError::single("", "payload must be a JSON object"));
        };

        let mut issues = Vec::new();
        let mut output = Map::new();

        for (name, field) in &self.fields {
            match input.get(name) {
                Some(value) if !value.is_null() => {
                    if field.field_type.accepts(value) {
                        output.insert(name.clone(), value.clone());
                    } else {
                        issues.push(ValidationIssue {
                            path: name.clone(),
                            message: format!("expected {}", field.field_type.describe()),
                        });
                    }
                }
                _ => {
                    if let Some(default) = &field.default {
                        output.insert(name.clone(), default.clone());
                    } else if field.required {
                        issues.push(ValidationIssue {
                            path: name.clone(),
                            message: "is required".to_string(),
                        });
                    }
                }
            }
        }

        if self.allow_unknown {
            for (name, value) in input {
                if !self.fields.contains_key(name) {
                    output.insert(name.clone(), value.clone());
                }
            }
        }

        if issues.is_empty() {
            Ok(Value::Object(output))
        } else {
            Err(ValidationError { issues })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn invoke_schema() -> PayloadSchema {
        PayloadSchema::new()
            .field("message", FieldSchema::string())
            .field("forceError", FieldSchema::boolean().with_default(json!(false)))
            .field("delay", FieldSchema::number().with_default(json!(5)))
    }

    #[test]
    fn test_validate_applies_defaults() {
        let payload = invoke_schema().validate(&json!({"message": "hi"})).unwrap();
        assert_eq!(
            payload,
            json!({"message": "hi", "forceError": false, "delay": 5})
        );
    }

    #[test]
    fn test_validate_collects_every_issue() {
        let err = invoke_schema()
            .validate(&json!({"forceError": "yes"}))
            .unwrap_err();
        assert_eq!(err.issues.len(), 2);
        let paths: Vec<_> = err.issues.iter().map(|i| i.path.as_str()).collect();
        assert!(paths.contains(&"message"));
        assert!(paths.contains(&"forceError"));
    }

    #[test]
    fn test_validate_rejects_non_object() {
        let err = invoke_schema().validate(&json!([1, 2])).unwrap_err();
        assert_eq!(err.issues[0].path, "");
    }

    #[test]
    fn test_unknown_fields_stripped_unless_allowed() {
        let input = json!({"message": "hi", "extra": 1});
        let strict = invoke_schema().validate(&input).unwrap();
        assert!(strict.get("extra").is_none());

        let loose = invoke_schema().allow_unknown().validate(&input).unwrap();
        assert_eq!(loose["extra"], 1);
    }

    #[test]
    fn test_optional_field_may_be_absent() {
        let schema = PayloadSchema::new().field("note", FieldSchema::string().optional());
        assert_eq!(schema.validate(&json!({})).unwrap(), json!({}));
    }

    #[test]
    fn test_integer_rejects_fraction() {
        let schema = PayloadSchema::new().field("count", FieldSchema::integer());
        assert!(schema.validate(&json!({"count": 2})).is_ok());
        assert!(schema.validate(&json!({"count": 2.5})).is_err());
    }

    #[test]
    fn test_trigger_without_schema_passes_payload_through() {
        let trigger = TriggerSpec::event("auto.yield.1");
        let payload = json!({"anything": [1, 2, 3]});
        assert_eq!(trigger.validate(payload.clone()).unwrap(), payload);
        assert_eq!(trigger.kind(), TriggerKind::Event);
    }

    #[test]
    fn test_interval_ignores_schema() {
        let trigger = TriggerSpec::interval(180).with_schema(invoke_schema());
        assert!(trigger.schema().is_none());
    }

    #[test]
    fn test_trigger_spec_serde_shape() {
        let trigger = TriggerSpec::invoke().with_schema(invoke_schema());
        let json = serde_json::to_value(&trigger).unwrap();
        assert_eq!(json["type"], "invoke");
        assert_eq!(json["schema"]["fields"]["delay"]["type"], "number");
        let parsed: TriggerSpec = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, trigger);
    }
}
