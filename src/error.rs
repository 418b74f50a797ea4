//! Typed domain error hierarchy.
//!
//! Per Design Note §9, method-substring sniffing ("not found" + "host" ->
//! 1001) is fragile; this type is mapped to an RPC error code directly by
//! the method router (C8) instead. Grounded on the teacher's
//! `DbError`/`UplinkError` enums (`services/receiver/src/db.rs`,
//! `services/forwarder/src/uplink.rs`), which use `thiserror` the same way.

use moleport_protocol::ErrorCode;
use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum DomainError {
    #[error("host not found: {0}")]
    HostNotFound(String),

    #[error("host already connected: {0}")]
    AlreadyConnected(String),

    #[error("host not connected: {0}")]
    NotConnected(String),

    #[error("forward rule not found: {0}")]
    RuleNotFound(String),

    #[error("forward rule already exists: {0}")]
    RuleAlreadyExists(String),

    #[error("local port already in use: {0}")]
    PortConflict(u16),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("credential request timed out")]
    CredentialTimeout,

    #[error("credential request cancelled")]
    CredentialCancelled,

    #[error("invalid forward rule: {0}")]
    InvalidRule(String),

    #[error("{0}")]
    Internal(String),
}

impl DomainError {
    /// Direct mapping to the application error code range, replacing
    /// message-substring inspection.
    pub fn rpc_code(&self) -> ErrorCode {
        match self {
            DomainError::HostNotFound(_) => ErrorCode::HostNotFound,
            DomainError::AlreadyConnected(_) => ErrorCode::AlreadyConnected,
            DomainError::NotConnected(_) => ErrorCode::NotConnected,
            DomainError::RuleNotFound(_) => ErrorCode::RuleNotFound,
            DomainError::RuleAlreadyExists(_) => ErrorCode::RuleAlreadyExists,
            DomainError::PortConflict(_) => ErrorCode::PortConflict,
            DomainError::AuthenticationFailed(_) => ErrorCode::AuthenticationFailed,
            DomainError::CredentialTimeout => ErrorCode::CredentialTimeout,
            DomainError::CredentialCancelled => ErrorCode::CredentialCancelled,
            DomainError::InvalidRule(_) => ErrorCode::InvalidParams,
            DomainError::Internal(_) => ErrorCode::InternalError,
        }
    }
}

pub type DomainResult<T> = Result<T, DomainError>;
