//! Error types for op-mcp-router

use crate::namespace::CapabilityKind;
use crate::protocol::{codes, JsonRpcError};
use serde_json::{json, Value};
use thiserror::Error;

/// Main error type for router operations.
///
/// Cloneable so one failure can be handed to every waiter it affects.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RouterError {
    #[error("Transport error on '{server}': {reason}")]
    Transport { server: String, reason: String },

    #[error("Capability conflict: {kind} '{alias}' is already exposed by '{existing}', rejected for '{server}'")]
    CapabilityConflict {
        kind: CapabilityKind,
        alias: String,
        existing: String,
        server: String,
    },

    #[error("Capability unavailable: '{id}' ({reason})")]
    CapabilityUnavailable { id: String, reason: String },

    #[error("Profile not found: {name}")]
    ProfileNotFound { name: String },

    #[error("Connection to '{server}' terminated")]
    ConnectionTerminated { server: String },

    #[error("Request to '{server}' timed out after {timeout_ms}ms")]
    Timeout { server: String, timeout_ms: u64 },

    #[error("Server '{server}' returned error {code} for '{capability}': {message}")]
    Downstream {
        server: String,
        capability: String,
        code: i32,
        message: String,
        data: Option<Value>,
    },

    #[error("Invalid server id '{id}': {reason}")]
    InvalidServerId { id: String, reason: String },

    #[error("Server already registered: {id}")]
    DuplicateServer { id: String },

    #[error("Server not registered: {id}")]
    ServerNotFound { id: String },

    #[error("Session not found: {id}")]
    SessionNotFound { id: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias using our error type
pub type Result<T> = std::result::Result<T, RouterError>;

impl RouterError {
    /// Create a transport error
    pub fn transport(server: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Transport {
            server: server.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a capability-unavailable error
    pub fn unavailable(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CapabilityUnavailable {
            id: id.into(),
            reason: reason.into(),
        }
    }

    pub fn terminated(server: impl Into<String>) -> Self {
        Self::ConnectionTerminated { server: server.into() }
    }

    /// Tag a downstream error with the namespaced id the client used.
    pub fn for_capability(self, namespaced_id: &str) -> Self {
        match self {
            Self::Downstream {
                server,
                code,
                message,
                data,
                ..
            } => Self::Downstream {
                server,
                capability: namespaced_id.to_string(),
                code,
                message,
                data,
            },
            other => other,
        }
    }

    /// JSON-RPC error object returned to upstream clients.
    pub fn to_rpc_error(&self) -> JsonRpcError {
        match self {
            Self::Downstream {
                server,
                capability,
                code,
                message,
                data,
            } => JsonRpcError::new(*code, message.clone()).with_data(json!({
                "server": server,
                "capability": capability,
                "data": data,
            })),
            Self::CapabilityUnavailable { id, .. } => {
                JsonRpcError::new(codes::CAPABILITY_UNAVAILABLE, self.to_string())
                    .with_data(json!({ "capability": id }))
            }
            Self::ConnectionTerminated { server } => {
                JsonRpcError::new(codes::CONNECTION_TERMINATED, self.to_string())
                    .with_data(json!({ "server": server }))
            }
            Self::Timeout { server, timeout_ms } => JsonRpcError::new(codes::TIMEOUT, self.to_string())
                .with_data(json!({ "server": server, "timeoutMs": timeout_ms })),
            Self::ProfileNotFound { name } => {
                JsonRpcError::new(codes::PROFILE_NOT_FOUND, self.to_string())
                    .with_data(json!({ "profile": name }))
            }
            Self::CapabilityConflict { .. } => {
                JsonRpcError::new(codes::CAPABILITY_CONFLICT, self.to_string())
            }
            Self::Transport { server, .. } => JsonRpcError::new(codes::TRANSPORT, self.to_string())
                .with_data(json!({ "server": server })),
            Self::InvalidRequest(msg) => JsonRpcError::invalid_params(msg.clone()),
            Self::InvalidServerId { .. }
            | Self::DuplicateServer { .. }
            | Self::ServerNotFound { .. }
            | Self::SessionNotFound { .. }
            | Self::Config(_) => JsonRpcError::internal_error(self.to_string()),
        }
    }
}
