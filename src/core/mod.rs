//! Configuration, errors, logging, metrics and the HTTP surface

pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod process;
pub mod retry;
pub mod validation;
pub mod web_server;

// Re-exports for convenience
pub use config::AppConfig;
pub use error::{AppError, AppResult};
pub use logging::{init_logger, log_startup_configuration};
