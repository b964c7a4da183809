//! API client for the dashboard REST backend.
//!
//! This module provides the `ApiClient` struct, the reqwest implementation
//! of [`AuthBackend`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, Method};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{ApiError, AuthBackend};
use crate::config::Config;
use crate::models::user::DashboardUserResponse;
use crate::models::{LoginResponse, TokenPair, User};

// ============================================================================
// Constants
// ============================================================================

/// Maximum number of retries for rate-limited (429) requests.
/// 3 retries with exponential backoff usually succeeds without excessive delay.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// API client for the dashboard backend.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    /// Create a new API client for `base_url` (e.g. `https://host/api`)
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, base_url))
    }

    /// Wrap an already configured reqwest client
    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        debug!(base_url = %base_url, "Creating API client");
        Self { client, base_url }
    }

    pub fn from_config(config: &Config) -> Result<Self, ApiError> {
        Self::new(
            config.api_base(),
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Build an absolute URL; absolute inputs pass through unchanged
    pub fn build_url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Check if response is successful, returning an error with body if not.
    /// Returns Ok(Some(response)) for success, Ok(None) for rate limit (should retry),
    /// or Err for other errors.
    async fn check_response_for_retry(
        response: reqwest::Response,
    ) -> Result<Option<reqwest::Response>, ApiError> {
        if response.status().is_success() {
            Ok(Some(response))
        } else if response.status().as_u16() == 429 {
            Ok(None)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    /// Send a request, backing off on 429. `build` is called once per attempt.
    async fn send_with_backoff<F>(&self, url: &str, build: F) -> Result<reqwest::Response, ApiError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let response = build().send().await?;
            match Self::check_response_for_retry(response).await? {
                Some(response) => return Ok(response),
                None => {
                    retries += 1;
                    if retries > MAX_RATE_LIMIT_RETRIES {
                        return Err(ApiError::RateLimited);
                    }
                    warn!(url = url, retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms *= 2;
                }
            }
        }
    }

    /// Read a body as JSON, treating an empty body as `null`
    async fn read_json<T: DeserializeOwned>(
        response: reqwest::Response,
        url: &str,
    ) -> Result<T, ApiError> {
        let text = response.text().await?;
        let text = if text.trim().is_empty() { "null" } else { text.as_str() };
        serde_json::from_str(text).map_err(|e| {
            ApiError::InvalidResponse(format!("Failed to parse JSON response from {}: {}", url, e))
        })
    }

    async fn post_public<T: DeserializeOwned, B: Serialize + Sync>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let url = self.build_url(path);
        let response = self
            .send_with_backoff(&url, || {
                self.client
                    .post(&url)
                    .header(header::ACCEPT, "application/json")
                    .json(body)
            })
            .await?;
        Self::read_json(response, &url).await
    }

    async fn send_authorized<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        access_token: &str,
    ) -> Result<T, ApiError> {
        let url = self.build_url(path);
        let response = self
            .send_with_backoff(&url, || {
                let builder = self
                    .client
                    .request(method.clone(), &url)
                    .header(header::ACCEPT, "application/json")
                    .bearer_auth(access_token);
                match body {
                    Some(body) => builder.json(body),
                    None => builder,
                }
            })
            .await?;
        Self::read_json(response, &url).await
    }
}

#[async_trait]
impl AuthBackend for ApiClient {
    async fn login(&self, email: &str, password: &str) -> Result<LoginResponse, ApiError> {
        debug!(email = email, "Logging in");
        self.post_public("clinic/login", &json!({ "email": email, "password": password }))
            .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, ApiError> {
        self.post_public("refresh-token", &json!({ "refreshToken": refresh_token }))
            .await
    }

    async fn logout(&self, access_token: &str) -> Result<(), ApiError> {
        let _: Value = self
            .send_authorized(Method::GET, "logout", None, access_token)
            .await?;
        Ok(())
    }

    async fn validate_token(&self, access_token: &str) -> Result<Value, ApiError> {
        self.send_authorized(Method::GET, "validate-token", None, access_token)
            .await
    }

    async fn current_user(&self, access_token: &str) -> Result<User, ApiError> {
        let response: DashboardUserResponse = self
            .send_authorized(Method::GET, "dashboard-user", None, access_token)
            .await?;
        Ok(response.into_user())
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        access_token: &str,
    ) -> Result<Value, ApiError> {
        self.send_authorized(method, path, body, access_token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    type Requests = Arc<Mutex<Vec<String>>>;

    /// Minimal HTTP/1.1 server answering one connection per canned
    /// response, in order. Each raw request (head and body) is recorded.
    async fn serve(responses: Vec<(u16, &'static str)>) -> (ApiClient, Requests) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests: Requests = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&requests);

        tokio::spawn(async move {
            for (status, body) in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let (reader, mut writer) = socket.split();
                let mut reader = BufReader::new(reader);

                let mut request = String::new();
                let mut content_length = 0;
                loop {
                    let mut line = String::new();
                    reader.read_line(&mut line).await.unwrap();
                    let lower = line.to_ascii_lowercase();
                    if let Some(len) = lower.strip_prefix("content-length:") {
                        content_length = len.trim().parse().unwrap();
                    }
                    let end_of_head = line == "\r\n" || line.is_empty();
                    request.push_str(&lower);
                    if end_of_head {
                        break;
                    }
                }
                let mut payload = vec![0; content_length];
                reader.read_exact(&mut payload).await.unwrap();
                request.push_str(&String::from_utf8_lossy(&payload));
                seen.lock().unwrap().push(request);

                let reason = StatusCode::from_u16(status)
                    .ok()
                    .and_then(|s| s.canonical_reason())
                    .unwrap_or("Unknown");
                let response = format!(
                    "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    reason,
                    body.len(),
                    body
                );
                writer.write_all(response.as_bytes()).await.unwrap();
                writer.flush().await.unwrap();
            }
        });

        // Bypass any proxy configured in the environment
        let client = Client::builder().no_proxy().build().unwrap();
        (ApiClient::with_client(client, format!("http://{}/api", addr)), requests)
    }

    #[tokio::test]
    async fn test_login_posts_credentials() {
        let (client, requests) = serve(vec![(
            200,
            r#"{"token":"a.b.c","refreshToken":"refresh-1","user":{"_id":"65f0c1","name":"Asha"}}"#,
        )])
        .await;

        let response = client.login("asha@pawclinic.in", "woof").await.unwrap();
        assert_eq!(response.tokens.access_token, "a.b.c");
        assert_eq!(response.tokens.refresh_token, "refresh-1");
        assert_eq!(response.user.id.as_deref(), Some("65f0c1"));

        let requests = requests.lock().unwrap();
        assert!(requests[0].starts_with("post /api/clinic/login "));
        assert!(requests[0].contains(r#""email":"asha@pawclinic.in""#));
        assert!(requests[0].contains(r#""password":"woof""#));
    }

    #[tokio::test]
    async fn test_bearer_token_sent_and_empty_body_is_null() {
        let (client, requests) = serve(vec![(200, "")]).await;

        let value = client.validate_token("tok-123").await.unwrap();
        assert_eq!(value, Value::Null);

        let requests = requests.lock().unwrap();
        assert!(requests[0].starts_with("get /api/validate-token "));
        assert!(requests[0].contains("authorization: bearer tok-123\r\n"));
    }

    #[tokio::test]
    async fn test_error_body_becomes_server_message() {
        let (client, _) = serve(vec![
            (401, r#"{"message":"jwt expired"}"#),
            (500, "database down"),
        ])
        .await;

        let err = client.current_user("stale").await.unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized(ref m) if m == "jwt expired"));
        assert!(err.is_unauthorized());

        let err = client
            .request(Method::GET, "bookings", None, "tok")
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::ServerError(ref m) if m == "database down"));
    }

    #[tokio::test]
    async fn test_rate_limited_request_is_retried() {
        let (client, requests) = serve(vec![
            (429, ""),
            (200, r#"{"user":{"_id":"65f0c1","name":"Asha"}}"#),
        ])
        .await;

        let user = client.current_user("tok").await.unwrap();
        assert_eq!(user.name.as_deref(), Some("Asha"));
        assert_eq!(requests.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_build_url_joins_paths() {
        let client = ApiClient::new("https://api.pawclinic.in/api/", Duration::from_secs(5)).unwrap();
        assert_eq!(client.base_url(), "https://api.pawclinic.in/api");
        assert_eq!(client.build_url("clinic/login"), "https://api.pawclinic.in/api/clinic/login");
        assert_eq!(client.build_url("/refresh-token"), "https://api.pawclinic.in/api/refresh-token");
        assert_eq!(
            client.build_url("https://cdn.pawclinic.in/banners"),
            "https://cdn.pawclinic.in/banners"
        );
    }

    #[test]
    fn test_from_config_uses_api_base() {
        let config = Config {
            api_url: "http://localhost:5000/api/".to_string(),
            ..Config::default()
        };
        let client = ApiClient::from_config(&config).unwrap();
        assert_eq!(client.build_url("logout"), "http://localhost:5000/api/logout");
    }
}
