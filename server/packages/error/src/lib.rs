use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    SandboxNotFound,
    ObservationNotFound,
    MissingCredentials,
    DirectoryMissing,
    RemoteTimeout,
    RemoteUnavailable,
    ProviderError,
    StorageError,
    TokenInvalid,
}

/// Coarse grouping used by callers to decide on retries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Timeouts and connection failures against the sandbox provider. Retrying
    /// is the caller's decision.
    TransientRemote,
    /// Missing credentials, directories or records. Never retried.
    Precondition,
    /// The collaborator answered but refused the operation.
    Collaborator,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "urn:workspace-orchestrator:error:invalid_request",
            Self::SandboxNotFound => "urn:workspace-orchestrator:error:sandbox_not_found",
            Self::ObservationNotFound => "urn:workspace-orchestrator:error:observation_not_found",
            Self::MissingCredentials => "urn:workspace-orchestrator:error:missing_credentials",
            Self::DirectoryMissing => "urn:workspace-orchestrator:error:directory_missing",
            Self::RemoteTimeout => "urn:workspace-orchestrator:error:remote_timeout",
            Self::RemoteUnavailable => "urn:workspace-orchestrator:error:remote_unavailable",
            Self::ProviderError => "urn:workspace-orchestrator:error:provider_error",
            Self::StorageError => "urn:workspace-orchestrator:error:storage_error",
            Self::TokenInvalid => "urn:workspace-orchestrator:error:token_invalid",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::SandboxNotFound => "Sandbox Not Found",
            Self::ObservationNotFound => "Observation Not Found",
            Self::MissingCredentials => "Missing Credentials",
            Self::DirectoryMissing => "Directory Missing",
            Self::RemoteTimeout => "Remote Timeout",
            Self::RemoteUnavailable => "Remote Unavailable",
            Self::ProviderError => "Provider Error",
            Self::StorageError => "Storage Error",
            Self::TokenInvalid => "Token Invalid",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::SandboxNotFound => 404,
            Self::ObservationNotFound => 404,
            Self::MissingCredentials => 412,
            Self::DirectoryMissing => 412,
            Self::RemoteTimeout => 504,
            Self::RemoteUnavailable => 503,
            Self::ProviderError => 502,
            Self::StorageError => 500,
            Self::TokenInvalid => 401,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::RemoteTimeout | Self::RemoteUnavailable => ErrorClass::TransientRemote,
            Self::ProviderError | Self::StorageError => ErrorClass::Collaborator,
            Self::InvalidRequest
            | Self::SandboxNotFound
            | Self::ObservationNotFound
            | Self::MissingCredentials
            | Self::DirectoryMissing
            | Self::TokenInvalid => ErrorClass::Precondition,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
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
            instance: None,
            extensions: Map::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("sandbox not found: {sandbox_id}")]
    SandboxNotFound { sandbox_id: String },
    #[error("sandbox is not being observed: {sandbox_id}")]
    ObservationNotFound { sandbox_id: String },
    #[error("missing credentials: {what}")]
    MissingCredentials { what: String },
    #[error("directory missing: {path}")]
    DirectoryMissing { path: String },
    #[error("remote operation timed out after {timeout_ms}ms: {operation}")]
    RemoteTimeout { operation: String, timeout_ms: u64 },
    #[error("remote unavailable: {message}")]
    RemoteUnavailable { message: String },
    #[error("provider error: {message}")]
    Provider {
        message: String,
        status: Option<u16>,
    },
    #[error("storage error: {message}")]
    Storage { message: String },
    #[error("token invalid")]
    TokenInvalid { message: Option<String> },
}

impl OrchestratorError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::SandboxNotFound { .. } => ErrorType::SandboxNotFound,
            Self::ObservationNotFound { .. } => ErrorType::ObservationNotFound,
            Self::MissingCredentials { .. } => ErrorType::MissingCredentials,
            Self::DirectoryMissing { .. } => ErrorType::DirectoryMissing,
            Self::RemoteTimeout { .. } => ErrorType::RemoteTimeout,
            Self::RemoteUnavailable { .. } => ErrorType::RemoteUnavailable,
            Self::Provider { .. } => ErrorType::ProviderError,
            Self::Storage { .. } => ErrorType::StorageError,
            Self::TokenInvalid { .. } => ErrorType::TokenInvalid,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.error_type().class() == ErrorClass::TransientRemote
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));

        let mut extensions = Map::new();
        match self {
            Self::SandboxNotFound { sandbox_id } | Self::ObservationNotFound { sandbox_id } => {
                extensions.insert("sandboxId".to_string(), Value::String(sandbox_id.clone()));
            }
            Self::RemoteTimeout {
                operation,
                timeout_ms,
            } => {
                let mut map = Map::new();
                map.insert("operation".to_string(), Value::String(operation.clone()));
                map.insert(
                    "timeoutMs".to_string(),
                    Value::Number(serde_json::Number::from(*timeout_ms)),
                );
                extensions.insert("details".to_string(), Value::Object(map));
            }
            Self::Provider {
                status: Some(status),
                ..
            } => {
                let mut map = Map::new();
                map.insert(
                    "upstreamStatus".to_string(),
                    Value::Number(serde_json::Number::from(*status)),
                );
                extensions.insert("details".to_string(), Value::Object(map));
            }
            Self::TokenInvalid {
                message: Some(message),
            } => {
                let mut map = Map::new();
                map.insert("message".to_string(), Value::String(message.clone()));
                extensions.insert("details".to_string(), Value::Object(map));
            }
            _ => {}
        }
        extensions.insert(
            "class".to_string(),
            serde_json::to_value(self.error_type().class()).unwrap_or(Value::Null),
        );
        problem.extensions = extensions;
        problem
    }
}

impl From<OrchestratorError> for ProblemDetails {
    fn from(value: OrchestratorError) -> Self {
        value.to_problem_details()
    }
}

impl From<&OrchestratorError> for ProblemDetails {
    fn from(value: &OrchestratorError) -> Self {
        value.to_problem_details()
    }
}
