//! REST API client module for the pet-services dashboard backend.
//!
//! This module provides the `ApiClient` for the authentication endpoints
//! (`/clinic/login`, `/refresh-token`, `/logout`, `/validate-token`,
//! `/dashboard-user`) plus a generic bearer-authenticated JSON request used
//! by everything else.
//!
//! The session layer talks to the backend through the [`AuthBackend`]
//! trait so it can be exercised against stubs.

pub mod backend;
pub mod client;
pub mod error;

pub use backend::AuthBackend;
pub use client::ApiClient;
pub use error::ApiError;
