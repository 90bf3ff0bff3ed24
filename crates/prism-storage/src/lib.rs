//! Durable storage for the proxy: schema, the batched write pipeline, the
//! request/conversation read side, token accounting, and the analysis queue.

pub mod analyses;
pub mod db;
pub mod error;
pub mod requests;
pub mod types;
pub mod usage;
pub mod writer;

pub use analyses::{AnalysisStore, CreateOutcome};
pub use db::{init_db, open};
pub use error::{Result, StorageError};
pub use requests::RequestStore;
pub use writer::{WriteItem, WritePipeline};
