//! Command protocol type definitions.
//!
//! Covers the request body accepted by `POST /commands`, the uniform
//! response envelope, and the static command catalogue.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::AppError;

// ── Request ────────────────────────────────────────────────────

/// A parsed `{command, params, requestId}` body.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub command: String,
    pub params: Map<String, Value>,
    pub request_id: Option<Value>,
}

impl CommandRequest {
    /// Pull the echo-back id out of an arbitrary body, if there is one.
    ///
    /// Only strings and numbers are echoed.
    pub fn request_id_of(body: &Value) -> Option<Value> {
        match body.get("requestId") {
            Some(v @ Value::String(_)) | Some(v @ Value::Number(_)) => Some(v.clone()),
            _ => None,
        }
    }

    pub fn from_value(body: Value) -> Result<Self, AppError> {
        let request_id = Self::request_id_of(&body);

        let Value::Object(mut obj) = body else {
            return Err(AppError::InvalidPayload("body must be a JSON object".into()));
        };

        let command = match obj.remove("command") {
            None | Some(Value::Null) => return Err(AppError::MissingCommand),
            Some(Value::String(s)) if s.trim().is_empty() => return Err(AppError::MissingCommand),
            Some(Value::String(s)) => s,
            Some(_) => return Err(AppError::InvalidPayload("command must be a string".into())),
        };

        let params = match obj.remove("params") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map,
            Some(_) => return Err(AppError::InvalidPayload("params must be an object".into())),
        };

        Ok(Self {
            command,
            params,
            request_id,
        })
    }
}

// ── Envelope ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeError {
    pub code: String,
    pub message: String,
}

/// Uniform wrapper around every command response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub success: bool,
    pub error: Option<EnvelopeError>,
    #[serde(rename = "requestId")]
    pub request_id: Option<Value>,
    pub data: Value,
}

impl Envelope {
    pub fn success(data: Value, request_id: Option<Value>) -> Self {
        Self {
            success: true,
            error: None,
            request_id,
            data,
        }
    }

    pub fn failure(code: &str, message: String, request_id: Option<Value>) -> Self {
        Self {
            success: false,
            error: Some(EnvelopeError {
                code: code.to_string(),
                message,
            }),
            request_id,
            data: Value::Null,
        }
    }
}

// ── Command catalogue ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    SearchPosts,
    GetPost,
    GetSchema,
    HealthCheck,
    ListCommands,
}

impl Command {
    pub const ALL: [Command; 5] = [
        Command::SearchPosts,
        Command::GetPost,
        Command::GetSchema,
        Command::HealthCheck,
        Command::ListCommands,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::SearchPosts => "searchPosts",
            Command::GetPost => "getPost",
            Command::GetSchema => "getSchema",
            Command::HealthCheck => "healthCheck",
            Command::ListCommands => "listCommands",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Command::SearchPosts => "Full-text search across published content with cursor pagination",
            Command::GetPost => "Fetch a single published post by numeric id",
            Command::GetSchema => "Describe the indexed fields of each post type",
            Command::HealthCheck => "Report service status and index sizes",
            Command::ListCommands => "List the commands this server accepts",
        }
    }

    /// Scope an authenticated token must hold to run the command.
    pub fn scope(&self) -> &'static str {
        match self {
            Command::SearchPosts | Command::GetPost => "search.read",
            Command::GetSchema => "schema.read",
            Command::HealthCheck => "health.read",
            Command::ListCommands => "commands.read",
        }
    }

    pub fn describe(&self) -> Value {
        serde_json::json!({
            "name": self.name(),
            "description": self.description(),
            "scope": self.scope(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_missing_command() {
        let err = CommandRequest::from_value(json!({"params": {}})).unwrap_err();
        assert_eq!(err.code(), "missing_command");
        let err = CommandRequest::from_value(json!({"command": "  "})).unwrap_err();
        assert_eq!(err.code(), "missing_command");
    }

    #[test]
    fn test_params_must_be_object() {
        let err = CommandRequest::from_value(json!({"command": "searchPosts", "params": [1]})).unwrap_err();
        assert_eq!(err.code(), "invalid_payload");
    }

    #[test]
    fn test_request_id_echo() {
        let req = CommandRequest::from_value(json!({"command": "healthCheck", "requestId": "abc-1"})).unwrap();
        assert_eq!(req.request_id, Some(json!("abc-1")));
        assert!(req.params.is_empty());

        let req = CommandRequest::from_value(json!({"command": "healthCheck", "requestId": {"x": 1}})).unwrap();
        assert_eq!(req.request_id, None);
    }

    #[test]
    fn test_envelope_shape() {
        let v = serde_json::to_value(Envelope::success(json!({"ok": true}), Some(json!(7)))).unwrap();
        assert_eq!(v, json!({"success": true, "error": null, "requestId": 7, "data": {"ok": true}}));

        let v = serde_json::to_value(Envelope::failure("unknown_command", "nope".into(), None)).unwrap();
        assert_eq!(v["error"]["code"], "unknown_command");
        assert_eq!(v["requestId"], Value::Null);
        assert_eq!(v["success"], false);
    }

    #[test]
    fn test_command_lookup() {
        assert_eq!(Command::from_name("searchPosts"), Some(Command::SearchPosts));
        assert_eq!(Command::from_name("searchposts"), None);
        for c in Command::ALL {
            assert_eq!(Command::from_name(c.name()), Some(c));
        }
    }
}
