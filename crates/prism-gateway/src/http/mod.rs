//! Dashboard read/control API. Every endpoint checks the shared secret and
//! reads through the store's query side; only the analysis endpoints have
//! side effects.

pub mod analyses;
pub mod conversations;
pub mod health;
pub mod requests;
pub mod usage;
