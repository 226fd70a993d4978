//! StripeStore Common - Shared types and configuration
//!
//! This crate provides the identifiers, configuration and error types
//! used by the storage engine and its drivers.

pub mod config;
pub mod error;
pub mod types;

pub use config::{AddressingMode, StorageConfig};
pub use error::{Error, Result};
pub use types::*;
