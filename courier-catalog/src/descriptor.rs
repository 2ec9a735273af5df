//! Operation metadata: risk classification, batch limits and parameter schemas.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use thiserror::Error;

/// Bound parameters for one operation invocation.
pub type Parameters = serde_json::Map<String, Value>;

pub const DEFAULT_CONFIRMATION_ABOVE: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Safe,
    Reversible,
    Irreversible,
    BulkCapable,
}

impl RiskLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Safe => "safe",
            Self::Reversible => "reversible",
            Self::Irreversible => "irreversible",
            Self::BulkCapable => "bulk-capable",
        }
    }

    pub fn is_mutating(self) -> bool {
        self != Self::Safe
    }

    pub fn is_reversible(self) -> bool {
        self != Self::Irreversible
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level grouping presented to the user when nothing matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationCategory {
    Search,
    Organize,
    Delete,
    Compose,
}

impl OperationCategory {
    pub const ALL: [OperationCategory; 4] = [
        OperationCategory::Search,
        OperationCategory::Organize,
        OperationCategory::Delete,
        OperationCategory::Compose,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::Organize => "organize",
            Self::Delete => "delete",
            Self::Compose => "compose",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Search => "Search and read mail",
            Self::Organize => "Organize mail (archive, label, mark read)",
            Self::Delete => "Delete mail",
            Self::Compose => "Write and send mail",
        }
    }

    pub fn examples(self) -> &'static [&'static str] {
        match self {
            Self::Search => &["find emails from alice@example.com", "read this email"],
            Self::Organize => &[
                "archive all emails from deals@newsletter.example",
                "label this email as receipts",
                "mark all emails from bob as read",
            ],
            Self::Delete => &["delete this email", "permanently delete this email"],
            Self::Compose => &[
                "draft an email to bob@example.com about lunch saying see you at noon",
                "send now an email to bob@example.com saying running late",
            ],
        }
    }
}

impl fmt::Display for OperationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    String,
    Email,
    ItemId,
    Integer,
    Boolean,
}

impl ParamKind {
    fn json_type(self) -> &'static str {
        match self {
            Self::String | Self::Email | Self::ItemId => "string",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    pub kind: ParamKind,
    pub required: bool,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaViolation {
    #[error("missing required parameter `{field}`")]
    Missing { field: String },

    #[error("parameter `{field}` is invalid: {reason}")]
    Invalid { field: String, reason: String },

    #[error("unknown parameter `{field}`")]
    Unknown { field: String },
}

impl SchemaViolation {
    pub fn field(&self) -> &str {
        match self {
            Self::Missing { field } | Self::Invalid { field, .. } | Self::Unknown { field } => {
                field
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterSchema {
    pub fields: Vec<ParameterSpec>,
}

impl ParameterSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(mut self, name: &str, kind: ParamKind, description: &str) -> Self {
        self.fields.push(ParameterSpec {
            name: name.to_string(),
            kind,
            required: true,
            description: description.to_string(),
        });
        self
    }

    pub fn optional(mut self, name: &str, kind: ParamKind, description: &str) -> Self {
        self.fields.push(ParameterSpec {
            name: name.to_string(),
            kind,
            required: false,
            description: description.to_string(),
        });
        self
    }

    pub fn field(&self, name: &str) -> Option<&ParameterSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn accepts(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    /// Validates every bound value and reports the first violation in schema order.
    pub fn validate(&self, params: &Parameters) -> Result<(), SchemaViolation> {
        for key in params.keys() {
            if !self.accepts(key) {
                return Err(SchemaViolation::Unknown { field: key.clone() });
            }
        }
        for spec in &self.fields {
            match params.get(&spec.name) {
                None | Some(Value::Null) => {
                    if spec.required {
                        return Err(SchemaViolation::Missing {
                            field: spec.name.clone(),
                        });
                    }
                }
                Some(value) => validate_value(spec, value)?,
            }
        }
        Ok(())
    }

    pub fn missing_required(&self, params: &Parameters) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|spec| spec.required)
            .filter(|spec| matches!(params.get(&spec.name), None | Some(Value::Null)))
            .map(|spec| spec.name.as_str())
            .collect()
    }

    pub fn to_json_schema(&self) -> Value {
        let mut properties = serde_json::Map::new();
        for spec in &self.fields {
            properties.insert(
                spec.name.clone(),
                json!({ "type": spec.kind.json_type(), "description": spec.description }),
            );
        }
        let required: Vec<&str> = self
            .fields
            .iter()
            .filter(|spec| spec.required)
            .map(|spec| spec.name.as_str())
            .collect();
        json!({
            "type": "object",
            "additionalProperties": false,
            "properties": properties,
            "required": required,
        })
    }
}

fn validate_value(spec: &ParameterSpec, value: &Value) -> Result<(), SchemaViolation> {
    let invalid = |reason: String| SchemaViolation::Invalid {
        field: spec.name.clone(),
        reason,
    };
    match spec.kind {
        ParamKind::String => {
            let Some(s) = value.as_str() else {
                return Err(invalid(format!("expected string, got {value}")));
            };
            if s.trim().is_empty() {
                return Err(invalid("must not be empty".to_string()));
            }
        }
        ParamKind::ItemId => {
            let Some(s) = value.as_str() else {
                return Err(invalid(format!("expected id string, got {value}")));
            };
            if s.trim().is_empty() || s.contains(char::is_whitespace) {
                return Err(invalid(format!("{s:?} is not a valid id")));
            }
        }
        ParamKind::Email => {
            let Some(s) = value.as_str() else {
                return Err(invalid(format!("expected email address, got {value}")));
            };
            validate_email_address(s).map_err(invalid)?;
        }
        ParamKind::Integer => {
            if value.as_i64().is_none() {
                return Err(invalid(format!("expected integer, got {value}")));
            }
        }
        ParamKind::Boolean => {
            if !value.is_boolean() {
                return Err(invalid(format!("expected boolean, got {value}")));
            }
        }
    }
    Ok(())
}

pub fn validate_email_address(value: &str) -> Result<(), String> {
    let value = value.trim();
    if value.is_empty() || value.contains(char::is_whitespace) {
        return Err(format!("invalid email address: {value:?}"));
    }
    let mut parts = value.split('@');
    let (Some(local), Some(domain), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(format!("invalid email address: {value:?}"));
    };
    if local.is_empty() || domain.is_empty() {
        return Err(format!("invalid email address: {value:?}"));
    }
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 || labels.iter().any(|label| label.is_empty()) {
        return Err(format!("invalid email domain in {value:?}"));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationDescriptor {
    pub name: String,
    pub description: String,
    pub category: OperationCategory,
    pub parameter_schema: ParameterSchema,
    pub risk_level: RiskLevel,
    pub max_batch_size: usize,
    pub requires_confirmation_above: usize,
    /// Literal reply that unlocks an irreversible operation.
    #[serde(default)]
    pub confirmation_phrase: Option<String>,
}

impl OperationDescriptor {
    pub fn new(
        name: &str,
        description: &str,
        category: OperationCategory,
        risk_level: RiskLevel,
        parameter_schema: ParameterSchema,
    ) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            category,
            parameter_schema,
            risk_level,
            max_batch_size: 1,
            requires_confirmation_above: DEFAULT_CONFIRMATION_ABOVE,
            confirmation_phrase: None,
        }
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size.max(1);
        self
    }

    pub fn with_confirmation_above(mut self, threshold: usize) -> Self {
        self.requires_confirmation_above = threshold;
        self
    }

    pub fn with_confirmation_phrase(mut self, phrase: &str) -> Self {
        self.confirmation_phrase = Some(phrase.to_string());
        self
    }

    pub fn supports_batch(&self) -> bool {
        self.max_batch_size > 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compose_schema() -> ParameterSchema {
        ParameterSchema::new()
            .required("to", ParamKind::Email, "recipient")
            .required("subject", ParamKind::String, "subject line")
            .optional("body", ParamKind::String, "message body")
    }

    fn params(value: Value) -> Parameters {
        value.as_object().cloned().expect("object")
    }

    #[test]
    fn validate_reports_first_missing_required_field() {
        let err = compose_schema()
            .validate(&params(json!({"to": "bob@example.com"})))
            .expect_err("subject missing");
        assert_eq!(
            err,
            SchemaViolation::Missing {
                field: "subject".to_string()
            }
        );
    }

    #[test]
    fn validate_rejects_unknown_fields() {
        let err = compose_schema()
            .validate(&params(
                json!({"to": "bob@example.com", "subject": "hi", "cc": "x"}),
            ))
            .expect_err("cc is unknown");
        assert_eq!(err.field(), "cc");
    }

    #[test]
    fn validate_rejects_malformed_email() {
        let err = compose_schema()
            .validate(&params(json!({"to": "bob@example", "subject": "hi"})))
            .expect_err("domain without dot");
        assert!(err.to_string().contains("invalid email domain"));
    }

    #[test]
    fn missing_required_lists_all_absent_fields() {
        let schema = compose_schema();
        let missing = schema.missing_required(&Parameters::new());
        assert_eq!(missing, vec!["to", "subject"]);
    }

    #[test]
    fn email_validation_accepts_plain_addresses() {
        assert!(validate_email_address("alice@mail.example.com").is_ok());
        assert!(validate_email_address("alice@@example.com").is_err());
        assert!(validate_email_address("alice example.com").is_err());
    }

    #[test]
    fn json_schema_lists_required_fields() {
        let schema = compose_schema().to_json_schema();
        assert_eq!(schema["required"], json!(["to", "subject"]));
        assert_eq!(schema["properties"]["to"]["type"], "string");
    }
}
