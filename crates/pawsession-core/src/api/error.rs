use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Error payload shapes the backend sends: `{"message": ...}` or `{"error": ...}`
#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
    error: Option<String>,
}

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    /// Pull the server's human-readable message out of an error body,
    /// falling back to the (truncated) raw text.
    pub fn server_message(body: &str) -> String {
        if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
            if let Some(message) = parsed.message.or(parsed.error) {
                return message;
            }
        }
        Self::truncate_body(body.trim())
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let message = Self::server_message(body);
        match status.as_u16() {
            401 => ApiError::Unauthorized(message),
            403 => ApiError::AccessDenied(message),
            404 => ApiError::NotFound(message),
            429 => ApiError::RateLimited,
            500..=599 => ApiError::ServerError(message),
            400..=499 => ApiError::Rejected {
                status: status.as_u16(),
                message,
            },
            _ => ApiError::InvalidResponse(format!("Status {}: {}", status, message)),
        }
    }

    /// True when the server rejected the bearer token
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Unauthorized(_))
    }

    /// Message suitable for showing to the user (no status prefix)
    pub fn user_message(&self) -> String {
        match self {
            ApiError::AccessDenied(m)
            | ApiError::Unauthorized(m)
            | ApiError::NotFound(m)
            | ApiError::ServerError(m)
            | ApiError::InvalidResponse(m)
            | ApiError::Rejected { message: m, .. } => m.clone(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_server_message_prefers_message_field() {
        let body = r#"{"message":"Invalid email or password","error":"ignored"}"#;
        assert_eq!(ApiError::server_message(body), "Invalid email or password");
    }

    #[test]
    fn test_server_message_falls_back_to_error_field() {
        assert_eq!(ApiError::server_message(r#"{"error":"jwt expired"}"#), "jwt expired");
    }

    #[test]
    fn test_server_message_plain_text() {
        assert_eq!(ApiError::server_message("  Bad Gateway \n"), "Bad Gateway");
    }

    #[test]
    fn test_truncate_long_body() {
        let body = "x".repeat(MAX_ERROR_BODY_LENGTH + 20);
        let msg = ApiError::server_message(&body);
        assert!(msg.contains("truncated"));
        assert!(msg.starts_with(&"x".repeat(MAX_ERROR_BODY_LENGTH)));
    }

    #[test]
    fn test_from_status_mapping() {
        assert!(ApiError::from_status(StatusCode::UNAUTHORIZED, "").is_unauthorized());
        assert!(matches!(
            ApiError::from_status(StatusCode::FORBIDDEN, "{}"),
            ApiError::AccessDenied(_)
        ));
        assert!(matches!(
            ApiError::from_status(StatusCode::TOO_MANY_REQUESTS, ""),
            ApiError::RateLimited
        ));
        assert!(matches!(
            ApiError::from_status(StatusCode::BAD_REQUEST, r#"{"message":"Email is required"}"#),
            ApiError::Rejected { status: 400, ref message } if message == "Email is required"
        ));
        assert!(matches!(
            ApiError::from_status(StatusCode::BAD_GATEWAY, ""),
            ApiError::ServerError(_)
        ));
    }

    #[test]
    fn test_user_message_strips_prefix() {
        let err = ApiError::from_status(StatusCode::UNAUTHORIZED, r#"{"message":"Token expired"}"#);
        assert_eq!(err.user_message(), "Token expired");
    }
}
