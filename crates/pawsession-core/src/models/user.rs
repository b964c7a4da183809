use serde::{Deserialize, Serialize};

/// A dashboard user as returned by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct User {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Any other fields the backend sends (clinic, permissions, ...)
    #[serde(flatten)]
    #[cfg_attr(feature = "ts", ts(skip))]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl User {
    /// Name for display, falling back to the email address
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .or(self.email.as_deref())
            .unwrap_or("Unknown user")
    }
}

/// Access/refresh token pair returned by login and renewal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    #[serde(rename = "token")]
    pub access_token: String,
    #[serde(rename = "refreshToken")]
    pub refresh_token: String,
}

/// Body of `POST /clinic/login`
#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    #[serde(flatten)]
    pub tokens: TokenPair,
    pub user: User,
}

/// `GET /dashboard-user` either returns the user directly or wraps it.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum DashboardUserResponse {
    Wrapped { user: User },
    Bare(User),
}

impl DashboardUserResponse {
    pub(crate) fn into_user(self) -> User {
        match self {
            DashboardUserResponse::Wrapped { user } => user,
            DashboardUserResponse::Bare(user) => user,
        }
    }
}
