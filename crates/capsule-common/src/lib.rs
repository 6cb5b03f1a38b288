//! Common types, errors, and configuration for capsule.
//!
//! This crate provides shared functionality used across the capsule workspace:
//! - Error types using `thiserror` for type-safe error handling
//! - Configuration structures for runtime settings

pub mod config;
pub mod error;

pub use config::{CacheConfig, ConfigFileError, HttpConfig, RegistryConfig, RuntimeConfig};
pub use error::{CacheError, HostFunctionError, RuntimeError};
