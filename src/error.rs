//! Upload error taxonomy and HTTP status classification

use regex::Regex;
use reqwest::StatusCode;
use thiserror::Error;

/// Maximum number of response body bytes kept in an error message
const MAX_ERROR_BODY: usize = 512;

/// Errors a transport can report for a single item
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UploadError {
    #[error("Not authenticated: no credential available")]
    NotAuthenticated,

    #[error("Credential expired or rejected ({0})")]
    AuthExpired(String),

    #[error("Payload too large for the remote store")]
    PayloadTooLarge,

    #[error("Server error: {0}")]
    ServerTransient(String),

    #[error("Rate limited by the remote store")]
    RateLimited,

    #[error("Network failure: {0}")]
    Network(String),

    #[error("Export failed: {0}")]
    ExportFailure(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Request rejected with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Staging failed: {0}")]
    Staging(String),
}

impl UploadError {
    /// Whether another attempt may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::AuthExpired(_) | Self::ServerTransient(_) | Self::RateLimited | Self::Network(_)
        )
    }

    /// Whether the credential should be refreshed before the next attempt
    pub fn needs_refresh(&self) -> bool {
        matches!(self, Self::AuthExpired(_))
    }

    /// Build from a reqwest transport-level error
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Network(format!("request timed out: {}", err))
        } else {
            Self::Network(err.to_string())
        }
    }
}

/// Check whether a 400 body describes an expired or invalid bearer token
pub fn is_expired_token_body(body: &str) -> bool {
    crate::lazy_static! {
        static ref EXPIRED_RE: Regex = Regex::new(
            r#"(?i)(jwt\s+expired|token\s+(has\s+)?expired|exp"?\s+claim|invalid\s+(jwt|token)|(jwt|token)\s+is\s+invalid|unauthorized)"#
        ).unwrap();
    }

    EXPIRED_RE.is_match(body)
}

/// Map a non-success, non-conflict HTTP status to an error
///
/// 409 is handled by callers as "object already exists" before reaching here.
pub fn classify_status(status: StatusCode, body: &str) -> UploadError {
    let code = status.as_u16();
    match code {
        401 | 403 => UploadError::AuthExpired(format!("HTTP {}", code)),
        400 if is_expired_token_body(body) => UploadError::AuthExpired("HTTP 400".to_string()),
        413 => UploadError::PayloadTooLarge,
        429 => UploadError::RateLimited,
        _ if status.is_server_error() => UploadError::ServerTransient(format!("HTTP {}", code)),
        _ => UploadError::Rejected {
            status: code,
            body: crate::http_logger::truncate_utf8_safe(body.trim(), MAX_ERROR_BODY),
        },
    }
}

/// Lazy static macro for regex
pub mod lazy_static {
    #[macro_export]
    macro_rules! lazy_static {
        ($(static ref $name:ident: $t:ty = $init:expr;)*) => {
            $(
                static $name: std::sync::LazyLock<$t> = std::sync::LazyLock::new(|| $init);
            )*
        };
    }
    pub use lazy_static;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_statuses_are_retryable_and_refresh() {
        for code in [401u16, 403] {
            let err = classify_status(StatusCode::from_u16(code).unwrap(), "");
            assert!(err.is_retryable());
            assert!(err.needs_refresh());
        }
    }

    #[test]
    fn test_bad_request_with_expired_jwt() {
        let err = classify_status(
            StatusCode::BAD_REQUEST,
            r#"{"statusCode":"400","error":"InvalidJWT","message":"jwt expired"}"#,
        );
        assert!(matches!(err, UploadError::AuthExpired(_)));
    }

    #[test]
    fn test_bad_request_without_auth_signature_is_terminal() {
        let err = classify_status(StatusCode::BAD_REQUEST, "malformed object name");
        assert!(matches!(err, UploadError::Rejected { status: 400, .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_payload_too_large_is_terminal() {
        let err = classify_status(StatusCode::PAYLOAD_TOO_LARGE, "");
        assert_eq!(err, UploadError::PayloadTooLarge);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_server_errors_and_rate_limit_retry() {
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, "").is_retryable());
        assert!(classify_status(StatusCode::BAD_GATEWAY, "").is_retryable());
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, ""),
            UploadError::RateLimited
        );
    }

    #[test]
    fn test_export_and_protocol_errors_are_terminal() {
        assert!(!UploadError::ExportFailure("cancelled".into()).is_retryable());
        assert!(!UploadError::ProtocolViolation("no location".into()).is_retryable());
        assert!(!UploadError::NotAuthenticated.is_retryable());
    }
}
