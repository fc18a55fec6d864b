pub mod billing;
pub mod channels;
pub mod config;
pub mod error;
pub mod generation;
pub mod job_queue;
pub mod routes;
pub mod scheduling;
pub mod webhooks;

pub use error::{AppError, AppResult, ConfigurationError};
