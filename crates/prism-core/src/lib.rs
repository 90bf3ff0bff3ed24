//! Shared foundation for the prism proxy: configuration, the wire error
//! taxonomy, content-block views over opaque request bodies, and secret
//! redaction.

pub mod config;
pub mod error;
pub mod redact;
pub mod types;

pub use config::PrismConfig;
pub use error::{ErrorEnvelope, ErrorKind, PrismError, Result};
