//! Reactive renewal for authorized requests.
//!
//! Each request starts in [`RetryState::Initial`]. A 401 in that state,
//! with a refresh token on hand, triggers one renewal and one replay with
//! the new access token. The replay runs in [`RetryState::Retried`], so a
//! second 401 goes straight back to the caller.

use std::future::Future;
use std::sync::Arc;

use reqwest::Method;
use serde_json::Value;
use tracing::{debug, warn};

use super::error::AuthError;
use super::session::SessionContext;
use crate::api::ApiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Initial,
    Retried,
}

impl SessionContext {
    /// Run `call` with the current access token, renewing and replaying
    /// once on an authorization failure.
    ///
    /// `call` may be invoked twice; it receives the token to send each time.
    /// If renewal fails the original 401 is returned and the session is
    /// left alone.
    pub async fn authorized<T, F, Fut>(&self, call: F) -> Result<T, AuthError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let mut token = self
            .access_token()
            .await
            .ok_or(AuthError::NotAuthenticated)?;
        let mut retry = RetryState::Initial;

        loop {
            let err = match call(token).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_unauthorized() || retry == RetryState::Retried {
                return Err(err.into());
            }
            if self.inner.refresh_token().await.is_none() {
                debug!("Authorization failed and no refresh token is available");
                return Err(err.into());
            }

            debug!("Authorization failed, renewing access token");
            match self.renew().await {
                Ok(tokens) => {
                    token = tokens.access_token;
                    retry = RetryState::Retried;
                }
                Err(renewal) => {
                    warn!(error = %renewal, "Renewal after authorization failure failed");
                    return Err(err.into());
                }
            }
        }
    }

    /// Authorized JSON request to any API path through the interceptor
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, AuthError> {
        let backend = Arc::clone(&self.inner.backend);
        let body = body.map(Arc::new);
        self.authorized(move |token| {
            let backend = Arc::clone(&backend);
            let body = body.clone();
            let method = method.clone();
            let path = path.to_string();
            async move {
                backend
                    .request(method, &path, body.as_deref(), &token)
                    .await
            }
        })
        .await
    }

    pub async fn get(&self, path: &str) -> Result<Value, AuthError> {
        self.request(Method::GET, path, None).await
    }

    pub async fn post(&self, path: &str, body: Value) -> Result<Value, AuthError> {
        self.request(Method::POST, path, Some(body)).await
    }

    pub async fn put(&self, path: &str, body: Value) -> Result<Value, AuthError> {
        self.request(Method::PUT, path, Some(body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<Value, AuthError> {
        self.request(Method::DELETE, path, None).await
    }
}
