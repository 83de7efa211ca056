//! Postmaster Common - Shared types and configuration
//!
//! This crate provides the error type, configuration, and mail account
//! types shared across all postmaster components.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use types::{MailAccount, MailProtocol};
