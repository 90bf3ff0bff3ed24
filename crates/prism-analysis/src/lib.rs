//! Background conversation analysis: a polled, multi-instance work queue
//! that calls an external analysis model with truncation and retry
//! discipline.

pub mod client;
pub mod error;
pub mod prompt;
pub mod truncate;
pub mod worker;

pub use client::{AnalysisClient, AnalysisOutcome};
pub use error::{AnalysisError, Result};
pub use truncate::{Truncator, TRUNCATION_MARKER};
pub use worker::AnalysisWorker;
