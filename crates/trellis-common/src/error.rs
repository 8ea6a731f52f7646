//! Error types for the trellis provisioning controllers
//!
//! Errors are structured with fields to aid debugging in production and are
//! classified into three handling categories:
//!
//! - transient: requeue the reconciliation and try again later
//! - permanent: freeze the object and surface the message on its status
//! - security: reject the caller outright and never retry

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for trellis operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// An object that is expected to exist (or appear shortly) was not found
    #[error("{kind} {name} not found")]
    NotFound {
        /// Kind of the missing object
        kind: String,
        /// Namespaced name of the missing object
        name: String,
    },

    /// Optimistic concurrency conflict on write
    #[error("conflict writing {kind} {name}: object was modified")]
    Conflict {
        /// Kind of the conflicting object
        kind: String,
        /// Namespaced name of the conflicting object
        name: String,
    },

    /// Create failed because the object already exists
    #[error("{kind} {name} already exists")]
    AlreadyExists {
        /// Kind of the existing object
        kind: String,
        /// Namespaced name of the existing object
        name: String,
    },

    /// Validation error for a user supplied spec
    #[error("validation error for {cluster}: {message}")]
    Validation {
        /// Name of the cluster with invalid configuration
        cluster: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.rkeConfig.machinePools[0]")
        field: Option<String>,
    },

    /// A credential or identity did not match its expected owner
    #[error("security violation: {message}")]
    Security {
        /// Description of the mismatch
        message: String,
    },

    /// A handshake wait expired before the record was resolved
    #[error("handshake {id} timed out waiting for a machine match")]
    HandshakeTimeout {
        /// Handshake record name
        id: String,
    },

    /// A handshake record exists but has not been resolved yet
    #[error("handshake {id} is not matched to a machine yet")]
    NotMatched {
        /// Handshake record name
        id: String,
    },

    /// Agent output that could not be parsed
    #[error("malformed agent output: {message}")]
    MalformedOutput {
        /// Description of what failed to parse
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "apply", "watcher")
        context: String,
    },
}

impl Error {
    /// Create a not-found error for the given kind and name
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a conflict error for the given kind and name
    pub fn conflict(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Conflict {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create an already-exists error for the given kind and name
    pub fn already_exists(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a validation error with the given message
    ///
    /// For simple validation errors without cluster context.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with cluster context
    pub fn validation_for(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with cluster context and field path
    pub fn validation_for_field(
        cluster: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a security error
    pub fn security(msg: impl Into<String>) -> Self {
        Self::Security {
            message: msg.into(),
        }
    }

    /// Create a malformed output error
    pub fn malformed_output(msg: impl Into<String>) -> Self {
        Self::MalformedOutput {
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    #[cfg(test)]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Transient errors resolve by re-enqueueing. Validation, serialization
    /// and security errors need a human to change something first.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) => {
                    matches!(ae.code, 404 | 409 | 429) || ae.code >= 500
                }
                _ => true,
            },
            Error::NotFound { .. }
            | Error::Conflict { .. }
            | Error::AlreadyExists { .. }
            | Error::HandshakeTimeout { .. }
            | Error::NotMatched { .. }
            | Error::MalformedOutput { .. }
            | Error::Internal { .. } => true,
            Error::Validation { .. } | Error::Serialization { .. } | Error::Security { .. } => {
                false
            }
        }
    }

    /// Check if this error must freeze the object with a status message
    pub fn is_permanent(&self) -> bool {
        matches!(self, Error::Validation { .. } | Error::Serialization { .. })
    }

    /// Check if this error is a rejected identity or credential
    pub fn is_security(&self) -> bool {
        matches!(self, Error::Security { .. })
    }

    /// Check if this error means the target object does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 404,
            _ => false,
        }
    }

    /// Check if this error is an optimistic concurrency conflict
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 409 && ae.reason != "AlreadyExists",
            _ => false,
        }
    }

    /// Check if this error means a create found the object already present
    pub fn is_already_exists(&self) -> bool {
        match self {
            Error::AlreadyExists { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 409 && ae.reason == "AlreadyExists",
            _ => false,
        }
    }

    /// Get the cluster name if this error is associated with a specific cluster
    #[cfg(test)]
    pub fn cluster(&self) -> Option<&str> {
        match self {
            Error::Validation { cluster, .. } => Some(cluster),
            _ => None,
        }
    }

    /// Get the context if this error has one
    #[cfg(test)]
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16, reason: &str) -> Error {
        Error::Kube {
            source: kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: "test".to_string(),
                reason: reason.to_string(),
                code,
            }),
        }
    }

    // ==========================================================================
    // Story Tests: Error Classification in Reconciliation
    // ==========================================================================

    /// Story: a malformed cluster spec freezes reconciliation
    ///
    /// Missing versions, role-less pools and duplicate pool names need the
    /// user to edit the spec, so they are permanent and not retried.
    #[test]
    fn story_validation_errors_are_permanent() {
        let err = Error::validation_for("prod", "machine pool pool-a has no roles");
        assert!(err.is_permanent());
        assert!(!err.is_retryable());
        assert_eq!(err.cluster(), Some("prod"));
        assert!(err.to_string().contains("pool-a has no roles"));

        let err = Error::validation_for_field("prod", "spec.kubernetesVersion", "must be set");
        match &err {
            Error::Validation { field, .. } => {
                assert_eq!(field.as_deref(), Some("spec.kubernetesVersion"))
            }
            _ => panic!("Expected Validation variant"),
        }
    }

    /// Story: objects created by a concurrent path resolve on requeue
    #[test]
    fn story_transient_errors_requeue() {
        assert!(Error::not_found("Secret", "default/plan").is_retryable());
        assert!(Error::conflict("Machine", "default/m-0").is_retryable());
        assert!(Error::HandshakeTimeout { id: "custom-abc".into() }.is_retryable());
        assert!(Error::NotMatched { id: "custom-abc".into() }.is_retryable());
        assert!(Error::malformed_output("bad json").is_retryable());
        assert!(Error::internal("boom").is_retryable());
        assert!(!Error::not_found("Secret", "x").is_permanent());
    }

    /// Story: identity mismatches are rejected outright
    #[test]
    fn story_security_errors_never_retry() {
        let err = Error::security("service account uid does not match token");
        assert!(err.is_security());
        assert!(!err.is_retryable());
        assert!(!err.is_permanent());
    }

    #[test]
    fn test_kube_api_errors_are_classified_by_status() {
        assert!(api_error(404, "NotFound").is_not_found());
        assert!(api_error(404, "NotFound").is_retryable());
        assert!(api_error(409, "Conflict").is_conflict());
        assert!(!api_error(409, "Conflict").is_already_exists());
        assert!(api_error(409, "AlreadyExists").is_already_exists());
        assert!(!api_error(409, "AlreadyExists").is_conflict());
        assert!(api_error(503, "ServiceUnavailable").is_retryable());
        assert!(!api_error(403, "Forbidden").is_retryable());
        assert!(!api_error(422, "Invalid").is_retryable());
    }

    #[test]
    fn test_internal_error_context() {
        let err = Error::internal_with_context("apply", "index corrupted");
        assert_eq!(err.context(), Some("apply"));
        assert!(err.to_string().contains("[apply]"));
        assert_eq!(Error::internal("x").context(), Some(UNKNOWN_CONTEXT));
    }

    #[test]
    fn test_serde_errors_convert_to_serialization() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{");
        let err: Error = parse.unwrap_err().into();
        assert!(matches!(err, Error::Serialization { .. }));
        assert!(err.is_permanent());
    }
}
