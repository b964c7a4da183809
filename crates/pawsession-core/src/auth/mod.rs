//! Authentication module for managing sessions and stored credentials.
//!
//! This module provides:
//! - `CredentialStore`: redundant token storage over ordered backends
//! - `SessionContext`: login, restore, logout and renewal
//! - `RenewalScheduler`: proactive renewal shortly before token expiry
//! - the interceptor that renews once and replays on a 401
//!
//! Access tokens are JWTs; their `exp` claim drives proactive renewal.
//! Proactive and reactive renewal share one in-flight refresh call.

pub mod credentials;
pub mod error;
pub mod interceptor;
pub mod renewal;
pub mod scheduler;
pub mod session;
pub mod token;

#[cfg(test)]
pub(crate) mod testing;

pub use credentials::{
    CookieStore, CredentialStore, KeyValueStore, KeyringStore, MemoryStore, StorageChange,
    StoredTokens, TokenBackend, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY,
};
pub use error::{AuthError, RenewalError};
pub use interceptor::RetryState;
pub use scheduler::RenewalScheduler;
pub use session::{SessionContext, SessionSnapshot, SessionState};
