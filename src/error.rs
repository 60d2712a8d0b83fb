//! Crate-wide error type
//!
//! Each subsystem owns its own error enum; [`BusLinkError`] folds them together
//! for the service layer and the CLI. Messages that may end up in logs pass
//! through [`sanitize_error_message`] first.

use crate::backend::BackendError;
use crate::config::ConfigError;
use crate::protocol::DecodeError;
use crate::store::StoreError;
use crate::transport::mqtt::MqttError;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Maximum length of a sanitized message, suffix included
const MAX_MESSAGE_LEN: usize = 500;
const TRUNCATE_SUFFIX: &str = "...[truncated]";

/// Main error type for buslink operations
#[derive(Debug, Error)]
pub enum BusLinkError {
    #[error("Transport error: {0}")]
    Transport(#[from] MqttError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Handshake error: {message}")]
    Handshake { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl BusLinkError {
    /// Create handshake error
    pub fn handshake<S: Into<String>>(message: S) -> Self {
        Self::Handshake {
            message: message.into(),
        }
    }

    /// Create internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Display form with credentials redacted
    pub fn sanitized(&self) -> String {
        sanitize_error_message(&self.to_string())
    }
}

/// Result type for buslink operations
pub type BusLinkResult<T> = Result<T, BusLinkError>;

static SECRET_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").ok());

static BEARER_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)bearer\s+\S+").ok());

/// Redact credentials and cap the length of a message bound for logs
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = message.to_string();

    if let Some(pattern) = SECRET_PATTERN.as_ref() {
        sanitized = pattern.replace_all(&sanitized, "${1}=***").to_string();
    }

    if let Some(pattern) = BEARER_PATTERN.as_ref() {
        sanitized = pattern.replace_all(&sanitized, "Bearer ***").to_string();
    }

    if sanitized.chars().count() > MAX_MESSAGE_LEN {
        let keep = MAX_MESSAGE_LEN - TRUNCATE_SUFFIX.len();
        let truncated: String = sanitized.chars().take(keep).collect();
        sanitized = format!("{truncated}{TRUNCATE_SUFFIX}");
    }

    sanitized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_message_sanitization() {
        let error =
            BusLinkError::internal("Failed to authenticate: password=secret123 token=abc456");
        let sanitized = error.sanitized();

        assert!(!sanitized.contains("secret123"));
        assert!(!sanitized.contains("abc456"));
        assert!(sanitized.contains("password=***"));
        assert!(sanitized.contains("token=***"));
    }

    #[test]
    fn test_bearer_tokens_redacted() {
        let sanitized =
            sanitize_error_message("request failed with Authorization: Bearer eyJhbGci");
        assert!(!sanitized.contains("eyJhbGci"));
        assert!(sanitized.contains("Bearer ***"));
    }

    #[test]
    fn test_long_message_truncation() {
        let sanitized = sanitize_error_message(&"x".repeat(600));
        assert_eq!(sanitized.chars().count(), 500);
        assert!(sanitized.ends_with("...[truncated]"));
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let sanitized = sanitize_error_message(&"é".repeat(600));
        assert!(sanitized.ends_with("...[truncated]"));
        assert_eq!(sanitized.chars().count(), 500);
    }

    #[test]
    fn test_sanitize_exactly_500_chars() {
        let message = "x".repeat(500);
        let sanitized = sanitize_error_message(&message);
        assert_eq!(sanitized, message);
    }

    #[test]
    fn test_sanitize_case_insensitive_with_colons() {
        let sanitized = sanitize_error_message("PASSWORD: secret123 Key=xyz");
        assert!(!sanitized.contains("secret123"));
        assert!(!sanitized.contains("xyz"));
    }

    #[test]
    fn test_constructors() {
        let error = BusLinkError::handshake("no session for p-1");
        assert!(matches!(error, BusLinkError::Handshake { .. }));
        assert_eq!(error.to_string(), "Handshake error: no session for p-1");

        let error = BusLinkError::internal("unexpected state");
        assert_eq!(error.to_string(), "Internal error: unexpected state");
    }

    #[test]
    fn test_from_subsystem_errors() {
        let error: BusLinkError = ConfigError::EnvVarNotFound("TOKEN".to_string()).into();
        assert!(matches!(error, BusLinkError::Config(_)));

        let error: BusLinkError = MqttError::Network("connection reset".to_string()).into();
        assert!(error.to_string().starts_with("Transport error"));
    }
}
