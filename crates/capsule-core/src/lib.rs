//! Core building blocks for capsule.
//!
//! This crate provides the pieces every runtime context shares:
//! - [`ScriptCache`]: two-tier cache of compiled scripts and fetched bytes
//! - [`Sink`] and [`SharedBuffer`]: output destinations for script text
//! - [`TestResult`] and [`StderrInterceptor`]: test-harness result model
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     ScriptCache                         │
//! │  (Shared by a root context and all of its copies)       │
//! │                                                         │
//! │  volatile index ── RwLock<HashMap<url, AST + expiry>>   │
//! │         │ miss                                          │
//! │         ▼                                               │
//! │  durable store ─── <dir>/http/<sha256(url)> (bincode)   │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod cache;
pub mod output;
pub mod testing;

pub use cache::{
    CacheLookup, DurableEntry, Headers, ResponseMeta, ScriptCache, ScriptOrigin, cache_key,
    header_value, parse_expiration,
};
pub use output::{SharedBuffer, Sink};
pub use testing::{StderrInterceptor, TestError, TestResult};
