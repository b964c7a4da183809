//! Data models exchanged with the dashboard backend.
//!
//! The backend is loosely typed, so these types keep only the fields the
//! session layer relies on and carry everything else through verbatim.

pub mod user;

pub use user::{LoginResponse, TokenPair, User};
