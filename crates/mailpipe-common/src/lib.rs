//! Mailpipe Common - Shared types and utilities
//!
//! This crate provides configuration, error types and identifiers
//! shared across all Mailpipe components.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use types::{Clock, ManualClock, SystemClock};
