//! Typed access to tool call arguments.

use crate::error::WeftError;

/// Wrapper around validated tool call input providing typed extraction.
#[derive(Debug, Clone)]
pub struct ToolArguments {
    value: serde_json::Value,
}

impl ToolArguments {
    pub fn new(value: serde_json::Value) -> Self {
        Self { value }
    }

    /// Get the raw JSON value.
    pub fn raw(&self) -> &serde_json::Value {
        &self.value
    }

    /// Get a string argument by key.
    pub fn get_str(&self, key: &str) -> Result<&str, WeftError> {
        self.value
            .get(key)
            .and_then(|v| v.as_str())
            .ok_or_else(|| WeftError::InvalidArgument(format!("Missing string argument: {key}")))
    }

    /// Get an optional string argument.
    pub fn get_str_opt(&self, key: &str) -> Option<&str> {
        self.value.get(key).and_then(|v| v.as_str())
    }

    /// Get an integer argument.
    pub fn get_i64(&self, key: &str) -> Result<i64, WeftError> {
        self.value
            .get(key)
            .and_then(|v| v.as_i64())
            .ok_or_else(|| WeftError::InvalidArgument(format!("Missing integer argument: {key}")))
    }

    /// Get a boolean argument, `false` when absent.
    pub fn get_bool_or_false(&self, key: &str) -> bool {
        self.value
            .get(key)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// Get an array argument.
    pub fn get_array(&self, key: &str) -> Result<&Vec<serde_json::Value>, WeftError> {
        self.value
            .get(key)
            .and_then(|v| v.as_array())
            .ok_or_else(|| WeftError::InvalidArgument(format!("Missing array argument: {key}")))
    }

    /// Deserialize the entire arguments into a typed struct.
    pub fn deserialize<T: serde::de::DeserializeOwned>(&self) -> Result<T, WeftError> {
        serde_json::from_value(self.value.clone()).map_err(|e| {
            WeftError::InvalidArgument(format!("Failed to deserialize arguments: {e}"))
        })
    }
}
