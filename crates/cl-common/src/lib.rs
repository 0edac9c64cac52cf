//! # cl-common
//!
//! Shared configuration and error types for Careline.

pub mod config;
pub mod error;

pub use config::AppConfig;
pub use error::{AppError, AppResult};
