//! Session layer for the pet-services dashboard API.
//!
//! Handles login against the clinic backend, keeps access/refresh tokens
//! in redundant storage, renews the access token before it expires and
//! retries authorized calls once after a 401.

pub mod api;
pub mod auth;
pub mod config;
pub mod models;

pub use api::{ApiClient, ApiError, AuthBackend};
pub use auth::{AuthError, CredentialStore, RenewalError, SessionContext, SessionSnapshot};
pub use config::Config;
pub use models::{TokenPair, User};
