//! Error types for the container service agent
//!
//! Errors are structured with fields to aid debugging in production. Each
//! variant maps to one [`ErrorKind`], which is what gets persisted in task
//! records and reported back to callers.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for agent operations
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The referenced entity, task or page does not exist
    #[error("{resource} not found: {id}")]
    NotFound {
        /// What was being looked up (entity, task, acl)
        resource: String,
        /// Identifier that was not found
        id: String,
    },

    /// The caller token is missing, invalid or expired
    #[error("unauthorized: {message}")]
    Unauthorized {
        /// Description returned by the platform
        message: String,
    },

    /// The supplied version token no longer matches the stored one
    #[error("version conflict on {entity_id}: expected version {expected}")]
    VersionConflict {
        /// Entity being written
        entity_id: String,
        /// Version token the writer last observed
        expected: String,
    },

    /// Optimistic concurrency retries were exhausted
    #[error("concurrent modification of {entity_id}: gave up after {attempts} attempts")]
    ConcurrentModification {
        /// Entity being written
        entity_id: String,
        /// Number of read-modify-write attempts made
        attempts: u32,
    },

    /// Retriable network or server failure
    #[error("transient error: {message}")]
    Transient {
        /// Description of what failed
        message: String,
        /// HTTP status code, if the failure came from a response
        status: Option<u16>,
    },

    /// A message or response could not be decoded into the expected shape
    #[error("malformed {what}: {message}")]
    Malformed {
        /// What was being decoded (message, payload, response)
        what: String,
        /// Decoder error
        message: String,
    },

    /// The behavior id does not map to any registered handler
    #[error("unsupported behavior: {behavior_id}")]
    UnsupportedBehavior {
        /// Behavior id received in the message headers
        behavior_id: String,
    },

    /// The entity is not in a phase that allows the operation
    #[error("cluster {entity_id} is not ready (phase: {phase})")]
    NotReady {
        /// Entity that was queried
        entity_id: String,
        /// Phase the entity was observed in
        phase: String,
    },

    /// The operation completed but some part of it did not
    #[error("partial failure: {message}")]
    PartialFailure {
        /// Summary of what failed
        message: String,
        /// Individual failures (e.g. one entry per node)
        failures: Vec<String>,
    },

    /// A create targeted an id that already exists
    #[error("entity already exists: {id}")]
    AlreadyExists {
        /// Conflicting identifier
        id: String,
    },

    /// The desired spec was rejected before any remote call
    #[error("validation error for {entity}: {message}")]
    Validation {
        /// Entity or cluster name the spec belongs to
        entity: String,
        /// What is invalid
        message: String,
    },

    /// Unrecoverable error, aborts the task
    #[error("fatal error [{context}]: {message}")]
    Fatal {
        /// Description of what failed
        message: String,
        /// Where the error occurred (e.g. "dispatcher", "create", "backend")
        context: String,
    },
}

/// Error classification persisted with failed or degraded tasks
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// See [`Error::NotFound`]
    NotFound,
    /// See [`Error::Unauthorized`]
    Unauthorized,
    /// See [`Error::VersionConflict`]
    VersionConflict,
    /// See [`Error::ConcurrentModification`]
    ConcurrentModification,
    /// See [`Error::Transient`]
    Transient,
    /// See [`Error::Malformed`]
    Malformed,
    /// See [`Error::UnsupportedBehavior`]
    UnsupportedBehavior,
    /// See [`Error::NotReady`]
    NotReady,
    /// See [`Error::PartialFailure`]
    PartialFailure,
    /// See [`Error::AlreadyExists`]
    AlreadyExists,
    /// See [`Error::Validation`]
    Validation,
    /// See [`Error::Fatal`]
    Fatal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotFound => "NotFound",
            Self::Unauthorized => "Unauthorized",
            Self::VersionConflict => "VersionConflict",
            Self::ConcurrentModification => "ConcurrentModification",
            Self::Transient => "Transient",
            Self::Malformed => "Malformed",
            Self::UnsupportedBehavior => "UnsupportedBehavior",
            Self::NotReady => "NotReady",
            Self::PartialFailure => "PartialFailure",
            Self::AlreadyExists => "AlreadyExists",
            Self::Validation => "Validation",
            Self::Fatal => "Fatal",
        };
        f.write_str(s)
    }
}

/// Structured failure record: kind + description + minor code
///
/// Serialized with the key names the platform uses in its own error bodies.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Error classification
    pub kind: ErrorKind,
    /// Human readable description
    #[serde(rename = "error description")]
    pub description: String,
    /// Numeric minor code (HTTP-like)
    #[serde(rename = "minor error code")]
    pub minor_code: u16,
}

impl ErrorDetail {
    /// Build a detail record directly from its parts
    pub fn new(kind: ErrorKind, description: impl Into<String>, minor_code: u16) -> Self {
        Self {
            kind,
            description: description.into(),
            minor_code,
        }
    }
}

impl From<&Error> for ErrorDetail {
    fn from(e: &Error) -> Self {
        Self {
            kind: e.kind(),
            description: e.to_string(),
            minor_code: e.minor_code(),
        }
    }
}

impl Error {
    /// Create a not-found error for an entity id
    pub fn entity_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            resource: "entity".to_string(),
            id: id.into(),
        }
    }

    /// Create a not-found error for an arbitrary resource
    pub fn not_found(resource: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }

    /// Create an unauthorized error
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized {
            message: msg.into(),
        }
    }

    /// Create a version conflict error
    pub fn version_conflict(entity_id: impl Into<String>, expected: impl Into<String>) -> Self {
        Self::VersionConflict {
            entity_id: entity_id.into(),
            expected: expected.into(),
        }
    }

    /// Create a transient error without an HTTP status
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient {
            message: msg.into(),
            status: None,
        }
    }

    /// Create a transient error caused by an HTTP status
    pub fn transient_status(status: u16, msg: impl Into<String>) -> Self {
        Self::Transient {
            message: msg.into(),
            status: Some(status),
        }
    }

    /// Create a malformed error for the given kind of input
    pub fn malformed(what: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Malformed {
            what: what.into(),
            message: msg.into(),
        }
    }

    /// Create an unsupported behavior error
    pub fn unsupported_behavior(behavior_id: impl Into<String>) -> Self {
        Self::UnsupportedBehavior {
            behavior_id: behavior_id.into(),
        }
    }

    /// Create a not-ready error
    pub fn not_ready(entity_id: impl Into<String>, phase: impl std::fmt::Display) -> Self {
        Self::NotReady {
            entity_id: entity_id.into(),
            phase: phase.to_string(),
        }
    }

    /// Create a partial failure with the individual failures listed
    pub fn partial_failure(msg: impl Into<String>, failures: Vec<String>) -> Self {
        Self::PartialFailure {
            message: msg.into(),
            failures,
        }
    }

    /// Create a validation error for an entity
    pub fn validation_for(entity: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            entity: entity.into(),
            message: msg.into(),
        }
    }

    /// Create a fatal error without specific context
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create a fatal error with context
    pub fn fatal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Fatal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::Unauthorized { .. } => ErrorKind::Unauthorized,
            Error::VersionConflict { .. } => ErrorKind::VersionConflict,
            Error::ConcurrentModification { .. } => ErrorKind::ConcurrentModification,
            Error::Transient { .. } => ErrorKind::Transient,
            Error::Malformed { .. } => ErrorKind::Malformed,
            Error::UnsupportedBehavior { .. } => ErrorKind::UnsupportedBehavior,
            Error::NotReady { .. } => ErrorKind::NotReady,
            Error::PartialFailure { .. } => ErrorKind::PartialFailure,
            Error::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            Error::Validation { .. } => ErrorKind::Validation,
            Error::Fatal { .. } => ErrorKind::Fatal,
        }
    }

    /// Check if this error is retryable
    ///
    /// Only transient failures are retried. Everything else propagates
    /// immediately: retrying an auth, decode or lookup failure cannot succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transient { .. })
    }

    /// Numeric minor code recorded alongside the description
    pub fn minor_code(&self) -> u16 {
        match self {
            Error::NotFound { .. } => 404,
            Error::Unauthorized { .. } => 401,
            Error::VersionConflict { .. } => 412,
            Error::ConcurrentModification { .. } => 409,
            Error::Transient { status, .. } => status.unwrap_or(503),
            Error::Malformed { .. } => 502,
            Error::UnsupportedBehavior { .. } => 400,
            Error::NotReady { .. } => 425,
            Error::PartialFailure { .. } => 207,
            Error::AlreadyExists { .. } => 409,
            Error::Validation { .. } => 422,
            Error::Fatal { .. } => 500,
        }
    }

    /// Structured detail for persistence
    pub fn detail(&self) -> ErrorDetail {
        ErrorDetail::from(self)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::malformed("json", e.to_string())
    }
}
