//! Runtime contexts, program loading, and the test harness for capsule.
//!
//! This crate ties the cache and the capability surface together:
//! - [`RuntimeContext`]: Load / Run / Call / Copy on one interpreter
//! - [`ScriptHost`]: root context, local files, token aliases, upload
//! - [`program`]: program names and registry URLs
//! - [`harness`]: `test_*` discovery and execution with output capture
//!
//! # Load pipeline
//!
//! ```text
//! name or URL ──resolve──▶ URL
//!                           │
//!            ┌──────────────┼───────────────┬──────────────────┐
//!            ▼              ▼               ▼                  │
//!      compiled script   disk entry      network GET           │
//!      (volatile tier)   (recompile)     (validate, compile)   │
//!            │ fail/miss    │ fail/miss     │ ok → cache both tiers
//!            └──────────────┴──────▶────────┘
//! ```

pub mod context;
pub mod harness;
pub mod host;
pub mod program;

pub use context::RuntimeContext;
pub use harness::TEST_PREFIX;
pub use host::ScriptHost;
pub use program::ProgramName;

pub use capsule_core::{TestError, TestResult};
