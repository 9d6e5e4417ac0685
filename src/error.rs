//! Error types for the Stackwright provisioning engine.
//!
//! Errors are grouped by the phase that raises them: description loading,
//! graph construction, planning, provider calls, state persistence and apply.
//! Validation-phase errors never leave partial state behind; apply-phase
//! errors may, and always name the resources involved.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the Stackwright engine.
#[derive(Debug, Error)]
pub enum StackError {
    /// Description loading and validation errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Resource graph errors.
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Provisioning collaborator errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Apply errors.
    #[error("Apply error: {0}")]
    Apply(#[from] ApplyError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Description loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The description file was not found.
    #[error("Stack description not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The description could not be parsed.
    #[error("Failed to parse stack description: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Stack description validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// The description uses a schema version this build does not understand.
    #[error("Unsupported description schema version {found} (supported: {supported})")]
    UnsupportedVersion {
        /// Version found in the file.
        found: u32,
        /// Version supported by this build.
        supported: u32,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },
}

/// Resource graph errors.
#[derive(Debug, Error)]
pub enum GraphError {
    /// A reference points at a resource (or attribute) that is not declared.
    #[error("Resource '{resource}' references unknown '{reference}'")]
    UnknownReference {
        /// Resource holding the reference.
        resource: String,
        /// The unresolved reference.
        reference: String,
    },

    /// The same resource name was declared twice.
    #[error("Duplicate resource name: {name}")]
    DuplicateResource {
        /// The duplicated name.
        name: String,
    },

    /// The graph contains at least one cycle.
    #[error("Cyclic dependency between resources: {}", resources.join(" -> "))]
    CyclicDependency {
        /// Resources participating in the cycle, in declaration order.
        resources: Vec<String>,
    },
}

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// Two operations would touch the same provider-assigned identifier.
    #[error("Plan conflict: {first} and {second} both target provider id '{provider_id}'")]
    PlanConflict {
        /// Provider-assigned identifier.
        provider_id: String,
        /// First resource.
        first: String,
        /// Second resource.
        second: String,
    },

    /// The state changed between planning and applying.
    #[error("Plan is stale: state serial was {planned} when planned, now {current}")]
    StalePlan {
        /// Serial the plan was computed against.
        planned: u64,
        /// Serial found when applying.
        current: u64,
    },
}

/// Provisioning collaborator errors.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// A failure that may succeed on retry.
    #[error("Transient provider error during {operation} of '{resource}': {message}")]
    Transient {
        /// Resource identity.
        resource: String,
        /// Operation that failed.
        operation: String,
        /// Error description.
        message: String,
        /// Suggested delay before retrying, if the provider gave one.
        retry_after_secs: Option<u64>,
    },

    /// A failure that will not succeed on retry.
    #[error("Permanent provider error during {operation} of '{resource}': {message}")]
    Permanent {
        /// Resource identity.
        resource: String,
        /// Operation that failed.
        operation: String,
        /// Error description.
        message: String,
    },

    /// The provider has no resource with this identifier.
    #[error("Provider resource not found: {provider_id}")]
    NotFound {
        /// Provider-assigned identifier.
        provider_id: String,
    },

    /// The operation exceeded its deadline.
    #[error("Operation {operation} of '{resource}' timed out after {timeout_secs}s")]
    Timeout {
        /// Resource identity.
        resource: String,
        /// Operation that timed out.
        operation: String,
        /// Deadline in seconds.
        timeout_secs: u64,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted and needs manual reconciliation.
    #[error("State store is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State could not be written.
    #[error("Failed to write state: {message}")]
    WriteFailed {
        /// Description of the failure.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// S3 backend error.
    #[error("S3 state backend error: {message}")]
    S3Error {
        /// Description of the S3 error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },
}

/// Apply errors.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// The run stopped before every operation succeeded.
    #[error(
        "Apply partially applied: failed [{}], succeeded [{}], skipped [{}], not started [{}]",
        failed.join(", "),
        succeeded.join(", "),
        skipped.join(", "),
        not_started.join(", ")
    )]
    PartiallyApplied {
        /// Operations that completed.
        succeeded: Vec<String>,
        /// Operations that failed.
        failed: Vec<String>,
        /// Operations skipped because a dependency failed.
        skipped: Vec<String>,
        /// Operations never started (halt or cancellation).
        not_started: Vec<String>,
    },

    /// The run was cancelled before its first operation started.
    #[error("Apply cancelled before any operation started")]
    Cancelled,

    /// A reference could not be resolved against provisioned outputs.
    #[error("Cannot resolve reference '{reference}' of '{resource}': {reason}")]
    UnresolvedReference {
        /// Resource holding the reference.
        resource: String,
        /// The reference expression.
        reference: String,
        /// Why it could not be resolved.
        reason: String,
    },
}

/// Result type alias for Stackwright operations.
pub type Result<T> = std::result::Result<T, StackError>;

impl StackError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Provider(ProviderError::Transient { .. } | ProviderError::Timeout { .. })
                | Self::State(StateError::LockFailed { .. })
        )
    }

    /// Returns the delay the failing party asked for, if any.
    #[must_use]
    pub const fn retry_delay_secs(&self) -> Option<u64> {
        match self {
            Self::Provider(ProviderError::Transient {
                retry_after_secs, ..
            }) => *retry_after_secs,
            Self::State(StateError::LockFailed { .. }) => Some(2),
            _ => None,
        }
    }

    /// Returns the process exit code for this error.
    ///
    /// `1` for errors raised before any mutation (validation, lock
    /// contention, unreadable state), `2` for failures raised while applying
    /// or persisting state. State errors raised after the provider was
    /// mutated are turned into write failures by [`Self::after_mutation`].
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Apply(_) | Self::Provider(_) | Self::State(StateError::WriteFailed { .. }) => 2,
            Self::State(_)
            | Self::Config(_)
            | Self::Graph(_)
            | Self::Plan(_)
            | Self::Io(_)
            | Self::Internal(_) => 1,
        }
    }

    /// Marks a state error as raised after resources were changed.
    ///
    /// State and I/O errors become write failures; other errors are
    /// returned unchanged.
    #[must_use]
    pub fn after_mutation(self) -> Self {
        match self {
            Self::State(StateError::WriteFailed { .. }) => self,
            Self::State(e) => Self::State(StateError::write(e.to_string())),
            Self::Io(e) => Self::State(StateError::write(e.to_string())),
            other => other,
        }
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }
}

impl StateError {
    /// Creates an S3 error with the given message.
    #[must_use]
    pub fn s3(message: impl Into<String>) -> Self {
        Self::S3Error {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Creates a corruption error with the given message.
    #[must_use]
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }

    /// Creates a write error with the given message.
    #[must_use]
    pub fn write(message: impl Into<String>) -> Self {
        Self::WriteFailed {
            message: message.into(),
        }
    }
}

impl ProviderError {
    /// Creates a transient error.
    #[must_use]
    pub fn transient(
        resource: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Transient {
            resource: resource.into(),
            operation: operation.into(),
            message: message.into(),
            retry_after_secs: None,
        }
    }

    /// Creates a permanent error.
    #[must_use]
    pub fn permanent(
        resource: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Permanent {
            resource: resource.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }
}
