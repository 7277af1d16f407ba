//! Error types for tether operations

use crate::{EntityId, EntityKind, RequestKind};
use std::fmt;
use thiserror::Error;

/// A single failed rule reported by a field's rule chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleViolation {
    /// Name of the rule that rejected the value.
    pub rule: String,
    /// Human readable explanation.
    pub message: String,
}

impl RuleViolation {
    pub fn new(rule: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            rule: rule.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for RuleViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.rule, self.message)
    }
}

fn format_violations(violations: &[RuleViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Local validation errors. Never involve the network.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Rejected value for {field}: {}", format_violations(.violations))]
    RuleChainFailed {
        field: String,
        violations: Vec<RuleViolation>,
    },

    #[error("Unknown field {field} on {kind}")]
    UnknownField { kind: EntityKind, field: String },

    #[error("Value for {field} could not be encoded: {reason}")]
    Unencodable { field: String, reason: String },
}

impl ValidationError {
    /// Rule violations carried by this error, empty for non rule-chain errors.
    pub fn violations(&self) -> &[RuleViolation] {
        match self {
            Self::RuleChainFailed { violations, .. } => violations,
            _ => &[],
        }
    }
}

/// Errors raised while talking to the remote service.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("{request} failed with status {status} after {attempts} attempt(s): {message}")]
    Status {
        request: RequestKind,
        status: u16,
        attempts: u32,
        message: String,
    },

    #[error("{request} could not reach the service: {reason}")]
    Unreachable { request: RequestKind, reason: String },

    #[error("Malformed response for {request}: {reason}")]
    MalformedResponse { request: RequestKind, reason: String },

    #[error("Serialization failed: {reason}")]
    Serialization { reason: String },
}

impl TransportError {
    /// Status code reported by the service, if the failure carried one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Synchronization lifecycle errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("Operation on {kind} {id} was cancelled")]
    Cancelled { kind: EntityKind, id: EntityId },

    #[error("{kind} {id} has been deleted")]
    Deleted { kind: EntityKind, id: EntityId },

    #[error("{kind} does not support deletion")]
    NotDeletable { kind: EntityKind },

    #[error("Background task for {kind} {id} ended unexpectedly: {reason}")]
    TaskFailed {
        kind: EntityKind,
        id: EntityId,
        reason: String,
    },

    #[error("Batch response had no slice {index} for {request}")]
    BatchSliceMissing { request: RequestKind, index: usize },

    #[error("Batched {request} was abandoned before a response arrived")]
    BatchAbandoned { request: RequestKind },

    #[error("Cached instance for {kind} {id} has an unexpected type")]
    TypeMismatch { kind: EntityKind, id: EntityId },

    #[error("Event channel is closed")]
    ChannelClosed,
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all tether errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TetherError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl TetherError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Sync(SyncError::Cancelled { .. }))
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Result type alias for tether operations.
pub type TetherResult<T> = Result<T, TetherError>;

// =============================================================================
// TESTS
// =============================================================================
