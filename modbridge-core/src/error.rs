// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Error types for module loading and calls

use crate::value::{Handle, PtrKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type for host/guest operations
pub type CoreResult<T> = Result<T, CoreError>;

/// Failure to bring a module to `Ready`. Fatal to that load attempt only.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Manifest not found: {0}")]
    ManifestNotFound(String),

    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("Manifest parse error: {0}")]
    ManifestParse(String),

    #[error("Unsupported module format: {0}")]
    UnsupportedFormat(String),

    #[error("Instantiation failed: {0}")]
    Instantiate(String),

    #[error("Missing required export: {0}")]
    MissingExport(String),

    #[error("Capabilities not offered by the host: {0:?}")]
    UnsupportedCapability(Vec<String>),

    #[error("Host function registration failed for {name}: {reason}")]
    HostFunction { name: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Exception or trap raised by guest code, in the shape surfaced to callers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuestError {
    /// Entry point (or import) that was executing.
    pub function_name: String,
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    /// Omitted for WebAssembly traps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

impl GuestError {
    pub fn new(
        function_name: impl Into<String>,
        name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            function_name: function_name.into(),
            name: name.into(),
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_function_name(mut self, function_name: impl Into<String>) -> Self {
        self.function_name = function_name.into();
        self
    }

    /// Build from a guest-supplied error object
    /// `{name?, message, cause?, stack?, data?, status?, hostname?}`.
    ///
    /// Non-object values become the message of a plain `Error`.
    pub fn from_json(function_name: impl Into<String>, value: &serde_json::Value) -> Self {
        use serde_json::Value;

        let text = |v: &Value| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };

        let mut err = GuestError::new(function_name, "Error", "");
        match value {
            Value::Object(fields) => {
                if let Some(name) = fields.get("name").filter(|v| !v.is_null()) {
                    err.name = text(name);
                }
                err.message = fields.get("message").map(text).unwrap_or_default();
                err.cause = fields.get("cause").filter(|v| !v.is_null()).map(text);
                err.stack = fields
                    .get("stack")
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .map(str::to_owned);
                err.data = fields.get("data").filter(|v| !v.is_null()).cloned();
                err.status = fields
                    .get("status")
                    .and_then(Value::as_u64)
                    .and_then(|s| u16::try_from(s).ok());
                err.hostname = fields
                    .get("hostname")
                    .and_then(Value::as_str)
                    .map(str::to_owned);
            }
            Value::Null => err.message = "null".to_string(),
            other => err.message = text(other),
        }
        err
    }
}

impl fmt::Display for GuestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)?;
        if !self.function_name.is_empty() {
            write!(f, " (in {})", self.function_name)?;
        }
        Ok(())
    }
}

impl std::error::Error for GuestError {}

/// Errors surfaced by module calls
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Load failed: {0}")]
    Load(#[from] LoadError),

    // Per-call bridge errors
    #[error("Out of bounds access: offset={offset}, length={length}, size={size}")]
    OutOfBounds { offset: u64, length: u64, size: u64 },

    #[error("Stale handle: {0}")]
    StaleHandle(Handle),

    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: &'static str, found: PtrKind },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Guest error: {0}")]
    Guest(#[from] GuestError),

    #[error("Entry point not exported: {0}")]
    EntryNotFound(String),

    #[error("Capability denied: {0}")]
    CapabilityDenied(String),

    #[error("Call scope mismatch: {0}")]
    ScopeMismatch(String),

    // Scheduling outcomes
    #[error("Module instance busy: {0}")]
    Busy(String),

    #[error("Call timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("Call cancelled")]
    Cancelled,

    // Instance-wide
    #[error("Corrupted memory region: offset={offset}, length={length}")]
    CorruptRegion { offset: u64, length: u64 },

    #[error("Fatal trap in {function_name}: {trap}")]
    FatalTrap { function_name: String, trap: String },

    #[error("Module instance faulted: {0}")]
    Faulted(String),

    #[error("Module instance unloaded: {0}")]
    Unloaded(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Module error: {0}")]
    Other(String),
}

impl CoreError {
    /// Errors that move an instance to `Faulted`.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CoreError::CorruptRegion { .. } | CoreError::FatalTrap { .. }
        )
    }

    /// Errors a caller may retry immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::Busy(_) | CoreError::Timeout { .. } | CoreError::Cancelled
        )
    }

    /// The guest payload, when this error came from guest code.
    pub fn guest(&self) -> Option<&GuestError> {
        match self {
            CoreError::Guest(err) => Some(err),
            _ => None,
        }
    }

    pub fn type_mismatch(expected: &'static str, found: PtrKind) -> Self {
        CoreError::TypeMismatch { expected, found }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::Load(LoadError::Io(e))
    }
}

impl From<serde_json::Error> for LoadError {
    fn from(e: serde_json::Error) -> Self {
        LoadError::ManifestParse(e.to_string())
    }
}

impl From<toml::de::Error> for LoadError {
    fn from(e: toml::de::Error) -> Self {
        LoadError::ManifestParse(e.to_string())
    }
}

impl From<semver::Error> for LoadError {
    fn from(e: semver::Error) -> Self {
        LoadError::InvalidManifest(format!("Invalid version: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(CoreError::CorruptRegion {
            offset: 0,
            length: 0
        }
        .is_fatal());
        assert!(!CoreError::OutOfBounds {
            offset: 10,
            length: 4,
            size: 8
        }
        .is_fatal());
        assert!(!CoreError::Guest(GuestError::new("search", "Error", "boom")).is_fatal());
        assert!(CoreError::Busy("m".into()).is_retryable());
    }

    #[test]
    fn test_guest_error_payload_shape() {
        let err = GuestError {
            function_name: "discoverListings".to_string(),
            name: "Error".to_string(),
            message: "network unavailable".to_string(),
            hostname: Some("example.com".to_string()),
            ..Default::default()
        };

        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["functionName"], "discoverListings");
        assert_eq!(json["hostname"], "example.com");
        assert!(json.get("stack").is_none());
    }

    #[test]
    fn test_guest_error_from_json() {
        let err = GuestError::from_json(
            "search",
            &serde_json::json!({
                "name": "HttpError",
                "message": "not found",
                "status": 404,
                "cause": {"code": 1},
                "hostname": "example.com"
            }),
        );
        assert_eq!(err.function_name, "search");
        assert_eq!(err.name, "HttpError");
        assert_eq!(err.status, Some(404));
        assert_eq!(err.cause.as_deref(), Some(r#"{"code":1}"#));

        let plain = GuestError::from_json("search", &serde_json::json!("boom"));
        assert_eq!(plain.name, "Error");
        assert_eq!(plain.message, "boom");
    }
}
