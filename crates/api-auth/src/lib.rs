//! Credential handling for the dashboard API
//!
//! Stores the access/refresh token pair across a persistent and a session
//! scope, decodes token expiry claims, and coordinates token refresh so that
//! at most one refresh call is in flight at a time. The request pipeline in
//! `api-client` builds on top of this crate; nothing here issues requests
//! other than the refresh call itself.
//!
//! Credential flow:
//! 1. Sign-in response saved via `CredentialStore::set_tokens()`
//! 2. Callers ask `RefreshCoordinator::ensure_access_token()` for a bearer
//! 3. Expired (or nearly expired) access tokens trigger a single shared refresh
//! 4. Refresh failure clears the store; callers treat that as "session ended"

pub mod claims;
pub mod constants;
pub mod credentials;
pub mod error;
pub mod refresh;
pub mod storage;
pub mod token;

pub use claims::{expires_at_millis, is_expired, is_expired_at};
pub use constants::*;
pub use credentials::{AuthTokens, CredentialStore, TokenStorageMode};
pub use error::{Error, Result};
pub use refresh::RefreshCoordinator;
pub use storage::{FileStorage, MemoryStorage, Storage};
pub use token::refresh_tokens;
