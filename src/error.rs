//! Crate-wide error taxonomy.
//!
//! Each component owns its own `thiserror` enum; this module only defines the
//! cross-cutting kinds referenced from more than one component (see spec
//! section 7 of the design doc). Task boundaries (main, tokio::spawn bodies)
//! collapse everything into `anyhow::Result`.

use thiserror::Error;

/// Fatal at startup only; never raised once the process is running.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] anyhow::Error),
    #[error("configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

/// OCPP frame is malformed or violates the `[2|3|4, msgId, ...]` shape.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed OCPP-J frame: {0}")]
    Malformed(String),
    #[error("unknown message type id {0}")]
    UnknownMessageType(u8),
    #[error("unsupported action: {0}")]
    UnsupportedAction(String),
    #[error("call {message_id} timed out waiting for response")]
    Timeout { message_id: String },
    #[error("no open channel to charger {0}")]
    NotConnected(String),
}

/// Raised by the admin-facing authentication layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("not authenticated")]
    NotAuthenticated,
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("role {required:?} required, caller has {actual:?}")]
    InsufficientRole {
        required: crate::api::auth::Role,
        actual: crate::api::auth::Role,
    },
}
