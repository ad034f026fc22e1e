#![forbid(unsafe_code)]

pub mod auth;
pub mod compact;
pub mod config;
pub mod errors;
pub mod log_buffer;
pub mod protocol;
pub mod runner;
pub mod supervisor;
pub mod transport;

pub use config::ClientConfig;
pub use errors::{AppError, Result};
