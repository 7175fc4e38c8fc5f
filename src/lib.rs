pub mod cache;
pub mod config;
pub mod dims;
pub mod error;
pub mod pipeline;
pub mod query;
pub mod server;
pub mod source;
pub mod telemetry;
pub mod worker_pool;

pub use error::{DirpyError, Result};
