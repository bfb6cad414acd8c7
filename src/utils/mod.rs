pub mod config;
pub mod logger;

pub use config::*;
pub use logger::{init_logger, LogConfig, LogLevel};
