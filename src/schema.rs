//! JSON Schema validation for flow inputs, outputs, interrupt payloads and
//! action inputs.

use serde_json::Value;

use crate::error::FlowError;

/// Validate `instance` against `schema`, collecting every violation.
///
/// `target` names what is being validated ("input of flow 'x'", ...) and ends
/// up in the error message.
pub fn validate(schema: &Value, instance: &Value, target: &str) -> Result<(), FlowError> {
    let validator = jsonschema::validator_for(schema)
        .map_err(|e| FlowError::validation(target, vec![format!("invalid JSON schema: {}", e)]))?;

    let errors: Vec<String> = validator
        .iter_errors(instance)
        .map(|e| format!("{} at {}", e, e.instance_path()))
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(FlowError::validation(target, errors))
    }
}

/// Validate only when a schema is present.
pub fn validate_opt(schema: Option<&Value>, instance: &Value, target: &str) -> Result<(), FlowError> {
    match schema {
        Some(schema) => validate(schema, instance, target),
        None => Ok(()),
    }
}
