//! Configuration validation
//!
//! Validates store configuration for correctness:
//! - No empty typenames or field names
//! - A foreign key never doubles as its own relation field
//! - Each relation field is paired with at most one foreign key
//! - A relation field is never also declared as a foreign key

use super::store_config::{StoreConfig, TypeConfig};
use crate::CacheError;
use std::collections::HashSet;

/// Validation error details
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub typename: Option<String>,
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            typename: None,
            field: field.into(),
            message: message.into(),
        }
    }

    fn with_typename(mut self, typename: impl Into<String>) -> Self {
        self.typename = Some(typename.into());
        self
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ref typename) = self.typename {
            write!(f, "[{}] {}: {}", typename, self.field, self.message)
        } else {
            write!(f, "{}: {}", self.field, self.message)
        }
    }
}

/// Validation result
pub type ValidationResult = std::result::Result<(), Vec<ValidationError>>;

/// Validate a store configuration
pub fn validate_config(config: &StoreConfig) -> ValidationResult {
    let mut errors = Vec::new();

    for (typename, type_config) in &config.types {
        if typename.is_empty() {
            errors.push(ValidationError::new("types", "Typename cannot be empty"));
        }

        if let Err(type_errors) = validate_type(type_config) {
            errors.extend(type_errors.into_iter().map(|e| e.with_typename(typename)));
        }

        for reference in type_config.references.values() {
            if !reference.typename.is_empty() && !config.types.contains_key(&reference.typename) {
                tracing::debug!(
                    typename = %typename,
                    target = %reference.typename,
                    "Association target has no type settings"
                );
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validate one typename's settings
fn validate_type(type_config: &TypeConfig) -> ValidationResult {
    let mut errors = Vec::new();
    let mut relation_fields = HashSet::new();

    for (foreign_key, reference) in &type_config.references {
        let field = format!("references.{}", foreign_key);

        if foreign_key.is_empty() {
            errors.push(ValidationError::new(
                "references",
                "Foreign key field cannot be empty",
            ));
        }

        if reference.field.is_empty() {
            errors.push(ValidationError::new(&field, "Relation field cannot be empty"));
        }

        if reference.typename.is_empty() {
            errors.push(ValidationError::new(&field, "Target type cannot be empty"));
        }

        if reference.field == *foreign_key {
            errors.push(ValidationError::new(
                &field,
                "Foreign key and relation must be different fields",
            ));
        }

        if !relation_fields.insert(reference.field.as_str()) {
            errors.push(ValidationError::new(
                &field,
                format!(
                    "Relation field '{}' is paired with more than one foreign key",
                    reference.field
                ),
            ));
        }

        if type_config.references.contains_key(&reference.field) {
            errors.push(ValidationError::new(
                &field,
                format!(
                    "Relation field '{}' is also declared as a foreign key",
                    reference.field
                ),
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validate configuration and return a Result
pub fn validate_config_result(config: &StoreConfig) -> crate::Result<()> {
    validate_config(config).map_err(|errors| {
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        CacheError::Config(format!(
            "Configuration validation failed:\n  - {}",
            messages.join("\n  - ")
        ))
    })
}
