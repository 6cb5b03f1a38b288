//! Structured-data capability: JSON in and out of script values.

use rhai::Dynamic;

use capsule_common::HostFunctionError;

/// Parse JSON text into a script value.
pub fn parse(text: &str) -> Result<Dynamic, HostFunctionError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| HostFunctionError::InvalidArgument {
            reason: format!("invalid JSON: {e}"),
        })?;

    rhai::serde::to_dynamic(value).map_err(|e| HostFunctionError::InvalidArgument {
        reason: format!("unrepresentable JSON: {e}"),
    })
}

/// Serialize a script value as compact JSON.
pub fn stringify(value: &Dynamic) -> Result<String, HostFunctionError> {
    serde_json::to_string(value).map_err(|e| HostFunctionError::InvalidArgument {
        reason: format!("value is not JSON-serializable: {e}"),
    })
}
