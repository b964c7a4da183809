use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;

use super::ApiError;
use crate::models::{LoginResponse, TokenPair, User};

/// The backend calls the session layer depends on.
///
/// Every bearer-authenticated call takes the access token explicitly so the
/// interceptor can replay it with a renewed one.
#[async_trait]
pub trait AuthBackend: Send + Sync {
    /// `POST /clinic/login`
    async fn login(&self, email: &str, password: &str) -> Result<LoginResponse, ApiError>;

    /// `POST /refresh-token`
    async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, ApiError>;

    /// `GET /logout`
    async fn logout(&self, access_token: &str) -> Result<(), ApiError>;

    /// `GET /validate-token`
    async fn validate_token(&self, access_token: &str) -> Result<Value, ApiError>;

    /// `GET /dashboard-user`
    async fn current_user(&self, access_token: &str) -> Result<User, ApiError>;

    /// Any other authorized JSON call. `path` is relative to the API base URL.
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        access_token: &str,
    ) -> Result<Value, ApiError>;
}
