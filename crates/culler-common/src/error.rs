//! Error types for the culler controller
//!
//! Errors are structured with fields to aid debugging in production. Each
//! variant carries the context that matters at its call sites: the node or
//! group involved, the configuration key that failed to parse, and whether
//! retrying on the next tick can help.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for culler operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Cloud provider error
    #[error("provider error for {subject}: {message}")]
    Provider {
        /// The node or group the provider call was about
        subject: String,
        /// Description of what failed
        message: String,
        /// Whether this error is retryable
        retryable: bool,
    },

    /// Configuration error (static flags or dynamic per-group settings)
    #[error("config error for {key}: {message}")]
    Config {
        /// The setting key that failed to parse or validate
        key: String,
        /// Description of what's invalid
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "scheduler", "lease")
        context: String,
    },
}

impl Error {
    /// Create a provider error without subject context
    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider {
            subject: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a provider error about a specific node or group
    pub fn provider_for(subject: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Provider {
            subject: subject.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable provider error (e.g. unparseable providerID)
    pub fn provider_permanent(subject: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Provider {
            subject: subject.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a configuration error for the given setting key
    pub fn config(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Config {
            key: key.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an internal error without specific context
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

    /// Check if this error is retryable on a later tick
    ///
    /// Configuration and serialization errors are not retryable (they need a
    /// config or code fix). Kubernetes 4xx responses are not retryable;
    /// everything else transient is.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code)
                )
            }
            Error::Provider { retryable, .. } => *retryable,
            Error::Config { .. } => false,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: provider failures leave the node in place and retry next tick
    ///
    /// A detach that fails because AWS throttled us must be retryable; a
    /// providerID that cannot be parsed will never get better on its own.
    #[test]
    fn story_provider_errors_classify_retryability() {
        let err = Error::provider_for("node-a", "DetachInstances throttled");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("node-a"));

        let err = Error::provider_permanent("node-b", "unparseable providerID ''");
        assert!(!err.is_retryable());
    }

    /// Story: a bad dynamic-config value aborts the tick, it is never retried
    #[test]
    fn story_config_errors_are_not_retryable() {
        let err = Error::config("deletionAge", "invalid duration '3x'");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("deletionAge"));
        assert!(err.to_string().contains("3x"));
    }

    #[test]
    fn test_internal_error_context() {
        let err = Error::internal_with_context("lease", "write conflict");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("[lease]"));

        let err = Error::internal("oops");
        assert!(err.to_string().contains(UNKNOWN_CONTEXT));
    }

    #[test]
    fn test_serialization_not_retryable() {
        assert!(!Error::serialization("truncated snapshot").is_retryable());
    }
}
