use thiserror::Error;

use crate::api::ApiError;

/// Why a token renewal failed.
///
/// Clone so that every caller waiting on a shared renewal gets the outcome.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenewalError {
    #[error("No refresh token available")]
    NoRefreshToken,

    #[error("Refresh token rejected: {0}")]
    Rejected(String),

    #[error("Token renewal failed: {0}")]
    Failed(String),
}

impl From<ApiError> for RenewalError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Unauthorized(_) | ApiError::AccessDenied(_) | ApiError::Rejected { .. } => {
                RenewalError::Rejected(err.user_message())
            }
            other => RenewalError::Failed(other.to_string()),
        }
    }
}

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Email and password are required")]
    MissingCredentials,

    #[error("Login failed: {0}")]
    LoginFailed(String),

    #[error("Session expired - please log in again")]
    SessionExpired,

    #[error("Not logged in")]
    NotAuthenticated,

    #[error(transparent)]
    Renewal(#[from] RenewalError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("Credential storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl AuthError {
    /// Whether the UI should send the user back to the login screen
    pub fn requires_login(&self) -> bool {
        match self {
            AuthError::SessionExpired | AuthError::NotAuthenticated => true,
            AuthError::Renewal(RenewalError::NoRefreshToken | RenewalError::Rejected(_)) => true,
            AuthError::Api(e) => e.is_unauthorized(),
            _ => false,
        }
    }
}
