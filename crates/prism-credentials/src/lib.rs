//! Per-tenant upstream credentials: file-backed store, client-auth
//! validation, and transparent OAuth refresh.

pub mod error;
pub mod refresh;
pub mod store;
pub mod types;

pub use error::{CredentialError, Result};
pub use store::CredentialStore;
pub use types::{CredentialFile, CredentialType, OAuthTokens, ResolvedCredential, UpstreamAuth};
