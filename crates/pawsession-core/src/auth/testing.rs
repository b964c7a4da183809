//! Counting stub backend for session tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use reqwest::Method;
use serde_json::{json, Value};

use super::token::make_jwt;
use crate::api::{ApiError, AuthBackend};
use crate::models::{LoginResponse, TokenPair, User};

pub(crate) fn fresh_jwt() -> String {
    make_jwt(Utc::now() + Duration::hours(1))
}

pub(crate) fn expired_jwt() -> String {
    make_jwt(Utc::now() - Duration::minutes(1))
}

pub(crate) fn sample_user() -> User {
    serde_json::from_value(json!({
        "_id": "65f0c1",
        "name": "Asha",
        "email": "asha@pawclinic.in",
        "role": "admin"
    }))
    .expect("sample user")
}

#[derive(Default)]
struct Behaviour {
    login_error: Option<String>,
    user_error: Option<String>,
    logout_fails: bool,
    refresh_fails: bool,
    refresh_delay: Option<StdDuration>,
    token_lifetime: Option<Duration>,
    reject_requests: usize,
    not_found: bool,
}

#[derive(Default)]
pub(crate) struct StubBackend {
    pub login_calls: AtomicUsize,
    pub refresh_calls: AtomicUsize,
    pub logout_calls: AtomicUsize,
    pub user_calls: AtomicUsize,
    pub request_calls: AtomicUsize,
    behaviour: Mutex<Behaviour>,
    user_tokens: Mutex<Vec<String>>,
    request_tokens: Mutex<Vec<String>>,
    refreshed_with: Mutex<Vec<String>>,
    issued: AtomicUsize,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn behaviour(&self) -> std::sync::MutexGuard<'_, Behaviour> {
        self.behaviour.lock().unwrap()
    }

    pub fn reject_login(&self, message: &str) {
        self.behaviour().login_error = Some(message.to_string());
    }

    pub fn fail_user_fetch(&self, message: &str) {
        self.behaviour().user_error = Some(message.to_string());
    }

    pub fn fail_logout(&self) {
        self.behaviour().logout_fails = true;
    }

    pub fn fail_refresh(&self) {
        self.behaviour().refresh_fails = true;
    }

    pub fn set_refresh_delay(&self, delay: StdDuration) {
        self.behaviour().refresh_delay = Some(delay);
    }

    pub fn set_token_lifetime(&self, lifetime: Duration) {
        self.behaviour().token_lifetime = Some(lifetime);
    }

    /// The next `count` generic requests answer 401
    pub fn reject_requests(&self, count: usize) {
        self.behaviour().reject_requests = count;
    }

    pub fn fail_requests_with_not_found(&self) {
        self.behaviour().not_found = true;
    }

    pub fn user_tokens(&self) -> Vec<String> {
        self.user_tokens.lock().unwrap().clone()
    }

    pub fn request_tokens(&self) -> Vec<String> {
        self.request_tokens.lock().unwrap().clone()
    }

    pub fn refreshed_with(&self) -> Vec<String> {
        self.refreshed_with.lock().unwrap().clone()
    }

    /// Each issued pair has a distinct access token and `refresh-N`
    fn issue_tokens(&self) -> TokenPair {
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        let lifetime = self.behaviour().token_lifetime.unwrap_or_else(|| Duration::hours(1));
        // Offset by n seconds so consecutive tokens differ
        let access_token = make_jwt(Utc::now() + lifetime + Duration::seconds(n as i64));
        TokenPair {
            access_token,
            refresh_token: format!("refresh-{}", n),
        }
    }
}

#[async_trait]
impl AuthBackend for StubBackend {
    async fn login(&self, email: &str, _password: &str) -> Result<LoginResponse, ApiError> {
        self.login_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.behaviour().login_error.clone() {
            return Err(ApiError::Unauthorized(message));
        }
        let mut user = sample_user();
        user.email = Some(email.to_string());
        Ok(LoginResponse {
            tokens: self.issue_tokens(),
            user,
        })
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, ApiError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        self.refreshed_with
            .lock()
            .unwrap()
            .push(refresh_token.to_string());
        let (delay, fails) = {
            let b = self.behaviour();
            (b.refresh_delay, b.refresh_fails)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fails {
            return Err(ApiError::Unauthorized("Invalid refresh token".to_string()));
        }
        Ok(self.issue_tokens())
    }

    async fn logout(&self, _access_token: &str) -> Result<(), ApiError> {
        self.logout_calls.fetch_add(1, Ordering::SeqCst);
        if self.behaviour().logout_fails {
            return Err(ApiError::ServerError("logout exploded".to_string()));
        }
        Ok(())
    }

    async fn validate_token(&self, _access_token: &str) -> Result<Value, ApiError> {
        Ok(json!({ "valid": true }))
    }

    async fn current_user(&self, access_token: &str) -> Result<User, ApiError> {
        self.user_calls.fetch_add(1, Ordering::SeqCst);
        self.user_tokens
            .lock()
            .unwrap()
            .push(access_token.to_string());
        if let Some(message) = self.behaviour().user_error.clone() {
            return Err(ApiError::ServerError(message));
        }
        Ok(sample_user())
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        access_token: &str,
    ) -> Result<Value, ApiError> {
        self.request_calls.fetch_add(1, Ordering::SeqCst);
        self.request_tokens
            .lock()
            .unwrap()
            .push(access_token.to_string());
        {
            let mut b = self.behaviour();
            if b.not_found {
                return Err(ApiError::NotFound(path.to_string()));
            }
            if b.reject_requests > 0 {
                b.reject_requests -= 1;
                return Err(ApiError::Unauthorized("jwt expired".to_string()));
            }
        }
        Ok(json!({
            "method": method.as_str(),
            "path": path,
            "body": body.cloned().unwrap_or(Value::Null),
        }))
    }
}
