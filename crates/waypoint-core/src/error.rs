// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for waypoint-core.
//!
//! Every variant carries a stable error code so operators and tooling can
//! match on failures without parsing messages.

/// Result type using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors produced by the engine, the executor and the store boundary.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum EngineError {
    /// Instance was not found in the store.
    #[error("Instance '{instance_id}' not found")]
    InstanceNotFound {
        /// The instance ID that was not found.
        instance_id: String,
    },

    /// No deployed definition matches the requested alias/version.
    #[error("{}", definition_not_found(alias, version.as_deref()))]
    DefinitionNotFound {
        /// Workflow alias.
        alias: String,
        /// Requested version, if a specific one was asked for.
        version: Option<String>,
    },

    /// A workflow definition failed structural validation.
    #[error("Invalid definition '{alias}': {reason}")]
    InvalidDefinition {
        /// Workflow alias.
        alias: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A method body returned a step naming a call site it never declared,
    /// or declared with a different kind or callee.
    #[error("Method '{method}' used undeclared call site '{call_site}'")]
    UndeclaredCallSite {
        /// Method issuing the step.
        method: String,
        /// Call-site identity used by the step.
        call_site: String,
    },

    /// A frame's locals did not match the declared live set at capture time.
    #[error(
        "Locals of '{method}' at '{call_site}' do not match declaration: expected {expected:?}, got {actual:?}"
    )]
    LocalsMismatch {
        /// Method owning the frame.
        method: String,
        /// Call site the frame is suspended at.
        call_site: String,
        /// Declared live locals.
        expected: Vec<String>,
        /// Locals actually present in the frame.
        actual: Vec<String>,
    },

    /// A method read a local that is not present in its frame.
    #[error("Local '{name}' is not set in method '{method}'")]
    MissingLocal {
        /// Method reading the local.
        method: String,
        /// Name of the missing local.
        name: String,
    },

    /// The continuation cannot be resumed under the deployed version.
    #[error(
        "Instance '{instance_id}' captured under {from} cannot resume under {to}: {}",
        reasons.join("; ")
    )]
    IncompatibleVersion {
        /// Instance being restored.
        instance_id: String,
        /// Version the continuation was captured under.
        from: String,
        /// Version currently deployed.
        to: String,
        /// Human-readable incompatibilities.
        reasons: Vec<String>,
    },

    /// A value could not be serialized or deserialized.
    #[error("Serialization error in {context}: {details}")]
    Serialization {
        /// What was being (de)serialized.
        context: String,
        /// Error details.
        details: String,
    },

    /// A wait request is malformed.
    #[error("Invalid wait: {reason}")]
    InvalidWait {
        /// Why the wait was rejected.
        reason: String,
    },

    /// Instance is in the wrong state for the requested operation.
    #[error("Instance '{instance_id}' is in invalid state: expected '{expected}', got '{actual}'")]
    InvalidState {
        /// The instance ID.
        instance_id: String,
        /// The expected state.
        expected: String,
        /// The actual state.
        actual: String,
    },

    /// Store operation failed.
    #[error("Storage error during '{operation}': {details}")]
    Storage {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// No processor pool with this id is configured.
    #[error("Processor pool '{pool_id}' is not configured")]
    UnknownPool {
        /// Requested pool.
        pool_id: String,
    },

    /// Workflow code failed while executing a segment.
    #[error("Workflow fault in '{method}': {message}")]
    WorkflowFault {
        /// Method executing when the fault occurred.
        method: String,
        /// Fault message.
        message: String,
    },

    /// The engine is shutting down.
    #[error("Engine is shutting down")]
    Shutdown,
}

fn definition_not_found(alias: &str, version: Option<&str>) -> String {
    match version {
        Some(v) => format!("Definition '{}' version {} not found", alias, v),
        None => format!("No definition deployed for '{}'", alias),
    }
}

impl EngineError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InstanceNotFound { .. } => "INSTANCE_NOT_FOUND",
            Self::DefinitionNotFound { .. } => "DEFINITION_NOT_FOUND",
            Self::InvalidDefinition { .. } => "INVALID_DEFINITION",
            Self::UndeclaredCallSite { .. } => "UNDECLARED_CALL_SITE",
            Self::LocalsMismatch { .. } => "LOCALS_MISMATCH",
            Self::MissingLocal { .. } => "MISSING_LOCAL",
            Self::IncompatibleVersion { .. } => "INCOMPATIBLE_VERSION",
            Self::Serialization { .. } => "SERIALIZATION_ERROR",
            Self::InvalidWait { .. } => "INVALID_WAIT",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::Storage { .. } => "STORAGE_ERROR",
            Self::UnknownPool { .. } => "UNKNOWN_POOL",
            Self::WorkflowFault { .. } => "WORKFLOW_FAULT",
            Self::Shutdown => "SHUTDOWN",
        }
    }

    /// Whether retrying the failed operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Storage { .. })
    }

    pub(crate) fn serialization(context: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Serialization {
            context: context.into(),
            details: err.to_string(),
        }
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::Storage {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::serialization("json", err)
    }
}
