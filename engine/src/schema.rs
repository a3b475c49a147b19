//! Field registry and validation.
//!
//! Every settings field is declared up front with a type, a constraint and a
//! default value. Local writes and merged remote values are both checked
//! against the registry before they reach a document.

use crate::{error::Result, Error, FieldName, SchemaVersion};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Field types supported in schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    /// Arbitrary nested JSON
    Json,
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::String => write!(f, "String"),
            FieldType::Int => write!(f, "Int"),
            FieldType::Float => write!(f, "Float"),
            FieldType::Bool => write!(f, "Bool"),
            FieldType::Json => write!(f, "Json"),
        }
    }
}

/// Additional restriction on a field's value, checked after the type.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Constraint {
    /// Any value of the right type
    #[default]
    Any,
    /// String must be one of the listed options
    OneOf { options: Vec<String> },
    /// Number must lie within `min..=max`
    Range { min: f64, max: f64 },
    /// ISO 4217 style code: exactly three ASCII uppercase letters
    CurrencyCode,
    /// String length in characters must not exceed the limit
    MaxLength { max: usize },
}

impl Constraint {
    fn check(&self, value: &Value) -> std::result::Result<(), String> {
        match self {
            Constraint::Any => Ok(()),
            Constraint::OneOf { options } => {
                let s = value.as_str().unwrap_or_default();
                if options.iter().any(|o| o == s) {
                    Ok(())
                } else {
                    Err(format!("expected one of {}", options.join(", ")))
                }
            }
            Constraint::Range { min, max } => match value.as_f64() {
                Some(n) if n >= *min && n <= *max => Ok(()),
                _ => Err(format!("expected a number between {} and {}", min, max)),
            },
            Constraint::CurrencyCode => {
                let s = value.as_str().unwrap_or_default();
                if s.len() == 3 && s.bytes().all(|b| b.is_ascii_uppercase()) {
                    Ok(())
                } else {
                    Err("expected a three-letter uppercase currency code".to_string())
                }
            }
            Constraint::MaxLength { max } => {
                let len = value.as_str().map(|s| s.chars().count()).unwrap_or(0);
                if len <= *max {
                    Ok(())
                } else {
                    Err(format!("longer than {} characters", max))
                }
            }
        }
    }
}

/// Definition of a settings field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    /// Field name
    pub name: FieldName,
    /// Field type
    pub field_type: FieldType,
    /// Value restriction beyond the type
    #[serde(default)]
    pub constraint: Constraint,
    /// Value used on first run and on reset
    pub default: Value,
}

impl FieldDef {
    /// Create a field definition with no constraint beyond its type.
    pub fn new(name: impl Into<FieldName>, field_type: FieldType, default: Value) -> Self {
        Self {
            name: name.into(),
            field_type,
            constraint: Constraint::Any,
            default,
        }
    }

    /// Builder-style method to attach a constraint.
    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.constraint = constraint;
        self
    }

    /// Validate a JSON value against this field definition.
    pub fn validate(&self, value: &Value) -> Result<()> {
        self.validate_type(value)?;
        self.constraint
            .check(value)
            .map_err(|reason| Error::InvalidValue {
                field: self.name.clone(),
                reason,
            })
    }

    fn validate_type(&self, value: &Value) -> Result<()> {
        let valid = match self.field_type {
            FieldType::String => value.is_string(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_number(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Json => true,
        };

        if valid {
            Ok(())
        } else {
            Err(Error::TypeMismatch {
                field: self.name.clone(),
                expected: self.field_type.to_string(),
                got: json_type_name(value).to_string(),
            })
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "Null",
        Value::Bool(_) => "Bool",
        Value::Number(n) if n.is_i64() || n.is_u64() => "Int",
        Value::Number(_) => "Float",
        Value::String(_) => "String",
        Value::Array(_) => "Array",
        Value::Object(_) => "Object",
    }
}

/// The registry of every settings field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    /// Schema version, recorded in persisted documents
    pub version: SchemaVersion,
    /// Field definitions by name
    pub fields: BTreeMap<FieldName, FieldDef>,
}

impl Schema {
    /// Create an empty schema.
    pub fn new(version: SchemaVersion) -> Self {
        Self {
            version,
            fields: BTreeMap::new(),
        }
    }

    /// Add a field to the schema.
    pub fn add_field(&mut self, field: FieldDef) -> &mut Self {
        self.fields.insert(field.name.clone(), field);
        self
    }

    /// Builder-style method to add a field.
    pub fn with_field(mut self, field: FieldDef) -> Self {
        self.add_field(field);
        self
    }

    /// Get a field definition by name.
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.get(name)
    }

    /// Check whether a field is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Validate a value for a named field.
    pub fn validate(&self, name: &str, value: &Value) -> Result<()> {
        self.fields
            .get(name)
            .ok_or_else(|| Error::UnknownField(name.to_string()))?
            .validate(value)
    }

    /// Boolean form of [`Schema::validate`].
    pub fn is_valid(&self, name: &str, value: &Value) -> bool {
        self.validate(name, value).is_ok()
    }

    /// Iterate over `(name, default)` pairs.
    pub fn defaults(&self) -> impl Iterator<Item = (&FieldName, &Value)> {
        self.fields.iter().map(|(name, def)| (name, &def.default))
    }

    /// The settings registered by the Tally application.
    pub fn finance() -> Self {
        let choices = |options: &[&str]| Constraint::OneOf {
            options: options.iter().map(|s| s.to_string()).collect(),
        };

        Schema::new(1)
            .with_field(
                FieldDef::new("theme", FieldType::String, json!("system"))
                    .with_constraint(choices(&["light", "dark", "system"])),
            )
            .with_field(
                FieldDef::new("currency", FieldType::String, json!("USD"))
                    .with_constraint(Constraint::CurrencyCode),
            )
            .with_field(
                FieldDef::new("language", FieldType::String, json!("en"))
                    .with_constraint(choices(&["en", "es", "fr", "de", "pt", "it", "ja", "zh"])),
            )
            .with_field(
                FieldDef::new("dateFormat", FieldType::String, json!("YYYY-MM-DD"))
                    .with_constraint(choices(&["YYYY-MM-DD", "DD/MM/YYYY", "MM/DD/YYYY"])),
            )
            .with_field(
                FieldDef::new("weekStartsOn", FieldType::String, json!("monday"))
                    .with_constraint(choices(&["monday", "sunday"])),
            )
            .with_field(FieldDef::new(
                "notificationsEnabled",
                FieldType::Bool,
                json!(true),
            ))
            .with_field(
                FieldDef::new("budgetAlertThreshold", FieldType::Int, json!(80))
                    .with_constraint(Constraint::Range {
                        min: 0.0,
                        max: 100.0,
                    }),
            )
            .with_field(
                FieldDef::new("decimalPlaces", FieldType::Int, json!(2))
                    .with_constraint(Constraint::Range { min: 0.0, max: 4.0 }),
            )
            .with_field(FieldDef::new("compactMode", FieldType::Bool, json!(false)))
    }
}
