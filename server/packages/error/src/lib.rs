use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    ProviderNotFound,
    SpawnFailed,
    AgentProcessExited,
    AgentError,
    SessionCreationFailed,
    SessionBusy,
    StreamError,
    Timeout,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "urn:acp-bridge:error:invalid_request",
            Self::ProviderNotFound => "urn:acp-bridge:error:provider_not_found",
            Self::SpawnFailed => "urn:acp-bridge:error:spawn_failed",
            Self::AgentProcessExited => "urn:acp-bridge:error:agent_process_exited",
            Self::AgentError => "urn:acp-bridge:error:agent_error",
            Self::SessionCreationFailed => "urn:acp-bridge:error:session_creation_failed",
            Self::SessionBusy => "urn:acp-bridge:error:session_busy",
            Self::StreamError => "urn:acp-bridge:error:stream_error",
            Self::Timeout => "urn:acp-bridge:error:timeout",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::ProviderNotFound => "Provider Not Found",
            Self::SpawnFailed => "Spawn Failed",
            Self::AgentProcessExited => "Agent Process Exited",
            Self::AgentError => "Agent Error",
            Self::SessionCreationFailed => "Session Creation Failed",
            Self::SessionBusy => "Session Busy",
            Self::StreamError => "Stream Error",
            Self::Timeout => "Timeout",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::ProviderNotFound => 404,
            Self::SpawnFailed => 502,
            Self::AgentProcessExited => 502,
            Self::AgentError => 502,
            Self::SessionCreationFailed => 502,
            Self::SessionBusy => 409,
            Self::StreamError => 502,
            Self::Timeout => 504,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            extensions: Map::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("provider not found: {provider}")]
    ProviderNotFound { provider: String },
    #[error("failed to start agent `{provider}`: {message}")]
    Spawn { provider: String, message: String },
    #[error("agent process exited: {provider}")]
    AgentExited { provider: String },
    #[error("agent returned error for `{method}` ({code}): {message}")]
    Protocol {
        method: String,
        code: i64,
        message: String,
        data: Option<Value>,
    },
    #[error("failed to create session with `{provider}`: {message}")]
    SessionCreation { provider: String, message: String },
    #[error("session already has a prompt in flight: {session_id}")]
    SessionBusy { session_id: String },
    #[error("stream error: {message}")]
    Stream { message: String },
    #[error("timed out after {timeout_ms}ms waiting for `{method}`")]
    Timeout { method: String, timeout_ms: u64 },
}

impl BridgeError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::ProviderNotFound { .. } => ErrorType::ProviderNotFound,
            Self::Spawn { .. } => ErrorType::SpawnFailed,
            Self::AgentExited { .. } => ErrorType::AgentProcessExited,
            Self::Protocol { .. } => ErrorType::AgentError,
            Self::SessionCreation { .. } => ErrorType::SessionCreationFailed,
            Self::SessionBusy { .. } => ErrorType::SessionBusy,
            Self::Stream { .. } => ErrorType::StreamError,
            Self::Timeout { .. } => ErrorType::Timeout,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));
        let mut extensions = Map::new();
        match self {
            Self::ProviderNotFound { provider }
            | Self::Spawn { provider, .. }
            | Self::AgentExited { provider }
            | Self::SessionCreation { provider, .. } => {
                extensions.insert("provider".to_string(), Value::String(provider.clone()));
            }
            Self::Protocol {
                method, code, data, ..
            } => {
                extensions.insert("method".to_string(), Value::String(method.clone()));
                extensions.insert("code".to_string(), Value::from(*code));
                if let Some(data) = data {
                    extensions.insert("data".to_string(), data.clone());
                }
            }
            Self::SessionBusy { session_id } => {
                extensions.insert("sessionId".to_string(), Value::String(session_id.clone()));
            }
            Self::Timeout { method, timeout_ms } => {
                extensions.insert("method".to_string(), Value::String(method.clone()));
                extensions.insert("timeoutMs".to_string(), Value::from(*timeout_ms));
            }
            Self::InvalidRequest { .. } | Self::Stream { .. } => {}
        }
        problem.extensions = extensions;
        problem
    }
}

impl From<BridgeError> for ProblemDetails {
    fn from(value: BridgeError) -> Self {
        value.to_problem_details()
    }
}

impl From<&BridgeError> for ProblemDetails {
    fn from(value: &BridgeError) -> Self {
        value.to_problem_details()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_problem_carries_method_and_bound() {
        let err = BridgeError::Timeout {
            method: "session/prompt".to_string(),
            timeout_ms: 250,
        };
        let problem = err.to_problem_details();
        assert_eq!(problem.status, 504);
        assert_eq!(problem.type_, "urn:acp-bridge:error:timeout");
        assert_eq!(problem.extensions["method"], "session/prompt");
        assert_eq!(problem.extensions["timeoutMs"], 250);
    }

    #[test]
    fn protocol_problem_serializes_flat() {
        let err = BridgeError::Protocol {
            method: "session/new".to_string(),
            code: -32000,
            message: "boom".to_string(),
            data: None,
        };
        let value = serde_json::to_value(ProblemDetails::from(&err)).expect("serialize");
        assert_eq!(value["title"], "Agent Error");
        assert_eq!(value["status"], 502);
        assert_eq!(value["code"], -32000);
        assert!(value.get("data").is_none());
    }
}
