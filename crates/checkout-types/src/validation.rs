//! Configuration validation for pluggable implementations.
//!
//! Storage backends and message buses receive their settings as raw TOML
//! tables. Each implementation describes the fields it accepts with a
//! [`Schema`] and exposes it through [`ConfigSchema`], so configuration errors
//! surface when the engine is built instead of at first use.

use thiserror::Error;

/// Errors that can occur during configuration validation.
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
	#[error("Missing required field: {0}")]
	MissingField(String),
	#[error("Invalid value for field '{field}': {message}")]
	InvalidValue { field: String, message: String },
	#[error("Type mismatch for field '{field}': expected {expected}, got {actual}")]
	TypeMismatch {
		field: String,
		expected: String,
		actual: String,
	},
}

/// Expected type of a configuration field.
#[derive(Debug)]
pub enum FieldType {
	String,
	/// Integer with optional inclusive bounds.
	Integer { min: Option<i64>, max: Option<i64> },
	Boolean,
}

/// Custom check run after the type check passed.
pub type FieldValidator = Box<dyn Fn(&toml::Value) -> Result<(), String> + Send + Sync>;

/// A named field in a schema.
pub struct Field {
	pub name: String,
	pub field_type: FieldType,
	pub validator: Option<FieldValidator>,
}

impl std::fmt::Debug for Field {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Field")
			.field("name", &self.name)
			.field("field_type", &self.field_type)
			.field("validator", &self.validator.is_some())
			.finish()
	}
}

impl Field {
	pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
		Self {
			name: name.into(),
			field_type,
			validator: None,
		}
	}

	/// Attaches a custom validator to this field.
	pub fn with_validator<F>(mut self, validator: F) -> Self
	where
		F: Fn(&toml::Value) -> Result<(), String> + Send + Sync + 'static,
	{
		self.validator = Some(Box::new(validator));
		self
	}

	fn check(&self, value: &toml::Value) -> Result<(), ValidationError> {
		let mismatch = |expected: &str| ValidationError::TypeMismatch {
			field: self.name.clone(),
			expected: expected.to_string(),
			actual: value.type_str().to_string(),
		};

		match &self.field_type {
			FieldType::String if !value.is_str() => return Err(mismatch("string")),
			FieldType::Boolean if !value.is_bool() => return Err(mismatch("boolean")),
			FieldType::Integer { min, max } => {
				let v = value.as_integer().ok_or_else(|| mismatch("integer"))?;
				if min.is_some_and(|min| v < min) || max.is_some_and(|max| v > max) {
					return Err(ValidationError::InvalidValue {
						field: self.name.clone(),
						message: format!("Value {} is outside [{:?}, {:?}]", v, min, max),
					});
				}
			},
			_ => {},
		}

		if let Some(validator) = &self.validator {
			validator(value).map_err(|message| ValidationError::InvalidValue {
				field: self.name.clone(),
				message,
			})?;
		}
		Ok(())
	}
}

/// Required and optional fields of one implementation's configuration table.
#[derive(Debug)]
pub struct Schema {
	pub required: Vec<Field>,
	pub optional: Vec<Field>,
}

impl Schema {
	pub fn new(required: Vec<Field>, optional: Vec<Field>) -> Self {
		Self { required, optional }
	}

	/// Validates a TOML table against this schema.
	///
	/// Required fields must be present; every present field must have the
	/// declared type and pass its validator. Unknown fields are ignored.
	pub fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		let table = config
			.as_table()
			.ok_or_else(|| ValidationError::TypeMismatch {
				field: "root".to_string(),
				expected: "table".to_string(),
				actual: config.type_str().to_string(),
			})?;

		for field in &self.required {
			let value = table
				.get(&field.name)
				.ok_or_else(|| ValidationError::MissingField(field.name.clone()))?;
			field.check(value)?;
		}
		for field in &self.optional {
			if let Some(value) = table.get(&field.name) {
				field.check(value)?;
			}
		}
		Ok(())
	}
}

/// Implemented by every pluggable implementation to validate its own table.
pub trait ConfigSchema: Send + Sync {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError>;
}

#[cfg(test)]
mod tests {
	use super::*;

	fn schema() -> Schema {
		Schema::new(
			vec![Field::new("path", FieldType::String)],
			vec![Field::new(
				"retries",
				FieldType::Integer {
					min: Some(0),
					max: Some(10),
				},
			)
			.with_validator(|v| match v.as_integer() {
				Some(3) => Err("3 is unlucky".into()),
				_ => Ok(()),
			})],
		)
	}

	#[test]
	fn test_missing_required_field() {
		let config: toml::Value = toml::from_str("retries = 1").unwrap();
		assert_eq!(
			schema().validate(&config),
			Err(ValidationError::MissingField("path".into()))
		);
	}

	#[test]
	fn test_type_mismatch_and_bounds() {
		let config: toml::Value = toml::from_str("path = 5").unwrap();
		assert!(matches!(
			schema().validate(&config),
			Err(ValidationError::TypeMismatch { .. })
		));

		let config: toml::Value = toml::from_str("path = \"x\"\nretries = 11").unwrap();
		assert!(matches!(
			schema().validate(&config),
			Err(ValidationError::InvalidValue { .. })
		));
	}

	#[test]
	fn test_custom_validator() {
		let config: toml::Value = toml::from_str("path = \"x\"\nretries = 3").unwrap();
		let err = schema().validate(&config).unwrap_err();
		assert!(err.to_string().contains("unlucky"));

		let config: toml::Value = toml::from_str("path = \"x\"\nretries = 2").unwrap();
		assert!(schema().validate(&config).is_ok());
	}
}
