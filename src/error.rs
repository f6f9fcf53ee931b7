//! Error types for the Linode provider core.
//!
//! Every fallible operation in the crate returns [`ProviderError`]. Planning and
//! validation accumulate [`Diagnostic`]s instead; [`ProviderError::to_diagnostic`]
//! bridges the two at component boundaries.

use crate::schema::Diagnostic;
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors that can occur while planning or applying resources.
#[derive(Debug, Error)]
pub enum ProviderError {
    // ── Schema / configuration ──────────────────────────────────────
    /// A schema or configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The remote rejected the request as invalid (HTTP 400/422).
    #[error("Validation error: {message}")]
    Validation {
        /// The server's error message.
        message: String,
        /// Field name to reason, when the server reported per-field errors.
        fields: BTreeMap<String, String>,
    },

    // ── Remote API ──────────────────────────────────────────────────
    /// A retryable remote failure (5xx, 429).
    #[error("Remote error (HTTP {status}): {message}")]
    RemoteTransient {
        /// HTTP status code.
        status: u16,
        /// The server's error message.
        message: String,
    },

    /// A non-retryable remote failure (4xx other than 404).
    #[error("Remote error (HTTP {status}): {message}")]
    RemotePermanent {
        /// HTTP status code.
        status: u16,
        /// The server's error message.
        message: String,
    },

    /// The remote object does not exist.
    #[error("Resource not found: {0}")]
    NotFound(String),

    // ── Asynchronous operations ─────────────────────────────────────
    /// The deadline elapsed before the awaited event reached a terminal status.
    #[error("Timed out waiting for {0}")]
    AwaitTimeout(String),

    /// The awaited event finished with status `failed`.
    #[error("Remote operation failed: {0}")]
    AwaitFailed(String),

    /// The operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    // ── State ───────────────────────────────────────────────────────
    /// The state document is unreadable or version-incompatible.
    #[error("State corruption: {0}")]
    StateCorruption(String),

    /// The requested resource kind is not registered.
    #[error("Unknown resource type: {0}")]
    UnknownResource(String),

    // ── Wrapped ─────────────────────────────────────────────────────
    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A filesystem error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A transport-level HTTP error occurred.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A URL could not be built.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl ProviderError {
    /// Get the error message without the variant prefix.
    pub fn message(&self) -> String {
        match self {
            Self::Config(msg)
            | Self::NotFound(msg)
            | Self::AwaitTimeout(msg)
            | Self::AwaitFailed(msg)
            | Self::StateCorruption(msg)
            | Self::UnknownResource(msg) => msg.clone(),
            Self::Validation { message, .. }
            | Self::RemoteTransient { message, .. }
            | Self::RemotePermanent { message, .. } => message.clone(),
            Self::Cancelled => "operation cancelled".to_string(),
            Self::Serialization(err) => err.to_string(),
            Self::Io(err) => err.to_string(),
            Self::Http(err) => err.to_string(),
            Self::InvalidUrl(err) => err.to_string(),
        }
    }

    /// The HTTP status code, for remote errors.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::RemoteTransient { status, .. } | Self::RemotePermanent { status, .. } => {
                Some(*status)
            },
            Self::NotFound(_) => Some(404),
            Self::Http(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Returns `true` if retrying the request may succeed.
    ///
    /// Network failures, 5xx and 429 are always transient. A remote error whose
    /// message contains one of `transient_messages` is also treated as
    /// transient, regardless of its status.
    pub fn is_transient(&self, transient_messages: &[String]) -> bool {
        match self {
            Self::RemoteTransient { .. } => true,
            Self::Http(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            Self::RemotePermanent { message, .. } => transient_messages
                .iter()
                .any(|needle| message.contains(needle.as_str())),
            _ => false,
        }
    }

    /// Returns `true` for a 404/410 from the remote.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Convert this error into an error diagnostic.
    pub fn to_diagnostic(&self) -> Diagnostic {
        match self {
            Self::Validation { message, fields } if !fields.is_empty() => {
                let detail = fields
                    .iter()
                    .map(|(field, reason)| format!("{field}: {reason}"))
                    .collect::<Vec<_>>()
                    .join("; ");
                Diagnostic::error(message.clone()).with_detail(detail)
            },
            other => Diagnostic::error(other.to_string()),
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = ProviderError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::DiagnosticSeverity;

    #[test]
    fn test_error_message() {
        let err = ProviderError::NotFound("linode_database_postgresql 123".to_string());
        assert_eq!(err.message(), "linode_database_postgresql 123");
        assert_eq!(
            err.to_string(),
            "Resource not found: linode_database_postgresql 123"
        );

        let err = ProviderError::RemotePermanent {
            status: 403,
            message: "Unauthorized".to_string(),
        };
        assert_eq!(err.message(), "Unauthorized");
        assert_eq!(err.to_string(), "Remote error (HTTP 403): Unauthorized");
    }

    #[test]
    fn test_is_transient() {
        let err = ProviderError::RemoteTransient {
            status: 503,
            message: "unavailable".to_string(),
        };
        assert!(err.is_transient(&[]));

        let err = ProviderError::RemotePermanent {
            status: 400,
            message: "Unable to delete instance while it is busy".to_string(),
        };
        assert!(!err.is_transient(&[]));
        assert!(err.is_transient(&["Unable to delete instance".to_string()]));

        assert!(!ProviderError::NotFound("x".into()).is_transient(&[]));
        assert!(!ProviderError::Cancelled.is_transient(&[]));
    }

    #[test]
    fn test_status() {
        assert_eq!(ProviderError::NotFound("x".into()).status(), Some(404));
        assert_eq!(
            ProviderError::RemoteTransient {
                status: 429,
                message: "slow down".into()
            }
            .status(),
            Some(429)
        );
        assert_eq!(ProviderError::Cancelled.status(), None);
    }

    #[test]
    fn test_validation_to_diagnostic() {
        let mut fields = BTreeMap::new();
        fields.insert("label".to_string(), "Label must be unique".to_string());
        fields.insert("region".to_string(), "Invalid region".to_string());
        let err = ProviderError::Validation {
            message: "Invalid request".to_string(),
            fields,
        };

        let diag = err.to_diagnostic();
        assert_eq!(diag.severity, DiagnosticSeverity::Error);
        assert_eq!(diag.summary, "Invalid request");
        assert_eq!(
            diag.detail.as_deref(),
            Some("label: Label must be unique; region: Invalid region")
        );
    }

    #[test]
    fn test_from_serde_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: ProviderError = json_err.into();
        assert!(matches!(err, ProviderError::Serialization(_)));
        assert!(err.to_diagnostic().summary.starts_with("Serialization error"));
    }
}
