//! Host capabilities for capsule.
//!
//! This crate provides everything a hosted script can reach outside its
//! interpreter. Scripts see these as Rhai modules and a `Response` type.
//!
//! # Capabilities
//!
//! - [`http_outbound`]: Outbound HTTP through [`FetchService`], with an
//!   optional durable-cache path
//! - [`logging`]: Console output routed to the context's sinks
//! - [`json`]: Structured data in and out of script values
//! - [`permissions`]: Host policy deciding which destinations are reachable
//!
//! # Security Model
//!
//! 1. **Narrow surface**: scripts get the modules above and nothing else; no
//!    filesystem or process access is registered.
//! 2. **Host policy**: every script request is checked against
//!    [`Permissions`] before it leaves the process.
//! 3. **Errors as values**: network failures never raise inside a script;
//!    they come back as a `Response` whose `error` field is set.

pub mod http_outbound;
pub mod json;
pub mod linker;
pub mod logging;
pub mod permissions;
pub mod response;
pub mod state;

pub use http_outbound::{
    FetchService, HttpError, HttpMethod, HttpRequest, HttpResponse, RequestData, RequestOptions,
    validate,
};
pub use linker::build_engine;
pub use permissions::Permissions;
pub use response::ScriptResponse;
pub use state::HostState;
