// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for the authentication and handoff core.
//!
//! Authorization and sanitizer *decisions* are reported as `bool`/`Option`
//! return values and audited; the variants here cover the hard failures a
//! caller must handle: bad input, exceeded limits, and storage problems.

use thiserror::Error;

use crate::token::Permission;

/// Errors surfaced by the authentication, sanitization, and handoff layers.
#[derive(Debug, Error)]
pub enum SecurityError {
    /// An operation that requires a token was called without one while
    /// authentication is enabled.
    #[error("authentication required: no token provided")]
    AuthenticationRequired,

    /// The presented token failed signature verification, expired, was
    /// revoked, or belongs to a locked-out agent.
    #[error("authentication failed: invalid or expired token")]
    AuthenticationFailed,

    /// The authenticated token lacks the permission the operation needs.
    #[error("authorization failed: {permission} permission required")]
    AuthorizationFailed { permission: Permission },

    /// An operation that needs the authentication subsystem was called on a
    /// workspace configured with authentication disabled.
    #[error("authentication system is not enabled")]
    AuthDisabled,

    /// Input rejected by a sanitizer.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Serialized payload exceeds the configured maximum.
    #[error("payload exceeds maximum size of {limit} bytes (got {size})")]
    PayloadTooLarge { size: usize, limit: usize },

    /// JSON structure nested deeper than allowed.
    #[error("structure too deeply nested (max: {max_depth})")]
    DepthExceeded { max_depth: usize },

    /// A sliding-window rate limit was hit.
    #[error("rate limit exceeded for {operation}")]
    RateLimitExceeded { operation: String },

    /// Filesystem failure while persisting or reading state.
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    /// Persisted or supplied JSON could not be encoded/decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SecurityError {
    /// True for failures callers may retry after backing off.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SecurityError::RateLimitExceeded { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = SecurityError::AuthorizationFailed {
            permission: Permission::CreateHandoff,
        };
        assert!(err.to_string().contains("CREATE_HANDOFF"));

        let err = SecurityError::PayloadTooLarge { size: 11, limit: 10 };
        assert!(err.to_string().contains("maximum size of 10"));
    }

    #[test]
    fn test_retryable() {
        assert!(SecurityError::RateLimitExceeded {
            operation: "create_handoff".to_string()
        }
        .is_retryable());
        assert!(!SecurityError::AuthenticationFailed.is_retryable());
    }
}
