//! Console logging for hosted scripts.
//!
//! Script log lines go to the context's output sinks and are also emitted
//! through `tracing` tagged `guest_log = true`.

use rhai::Dynamic;
use tracing::{debug, error, info};

use crate::HostState;

/// Console severity as seen by scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleLevel {
    /// Shown only when verbose; goes to standard output.
    Debug,
    /// Standard output.
    Log,
    /// Standard error.
    Error,
}

impl std::fmt::Display for ConsoleLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsoleLevel::Debug => write!(f, "DEBUG"),
            ConsoleLevel::Log => write!(f, "LOG"),
            ConsoleLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Write one console line at `level`.
pub fn log(state: &HostState, level: ConsoleLevel, message: &str) {
    match level {
        ConsoleLevel::Debug => {
            debug!(guest_log = true, "{}", message);
            if state.verbose() {
                state.write_stdout(message);
            }
        }
        ConsoleLevel::Log => {
            info!(guest_log = true, "{}", message);
            state.write_stdout(message);
        }
        ConsoleLevel::Error => {
            error!(guest_log = true, "{}", message);
            state.write_stderr(message);
        }
    }
}

/// Render script arguments the way `console` functions print them.
pub fn join_args(args: &[Dynamic]) -> String {
    args.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{FetchService, Permissions};
    use capsule_core::{ScriptCache, SharedBuffer, Sink};

    fn state(verbose: bool) -> (HostState, SharedBuffer, SharedBuffer) {
        let out = SharedBuffer::new();
        let err = SharedBuffer::new();
        let fetch = FetchService::with_client(
            reqwest::blocking::Client::new(),
            Arc::new(ScriptCache::new(std::env::temp_dir())),
            Permissions::all(),
        );
        let state = HostState::new(fetch, Sink::new(out.clone()), Sink::new(err.clone()), verbose);
        (state, out, err)
    }

    #[test]
    fn test_levels_route_to_sinks() {
        let (state, out, err) = state(false);

        log(&state, ConsoleLevel::Log, "hello");
        log(&state, ConsoleLevel::Error, "broken");
        log(&state, ConsoleLevel::Debug, "hidden");

        assert_eq!(out.contents(), "hello\n");
        assert_eq!(err.contents(), "broken\n");
    }

    #[test]
    fn test_debug_shown_when_verbose() {
        let (state, out, _err) = state(true);

        log(&state, ConsoleLevel::Debug, "details");

        assert_eq!(out.contents(), "details\n");
    }

    #[test]
    fn test_join_args() {
        let args = [Dynamic::from("count"), Dynamic::from(3_i64), Dynamic::from(true)];
        assert_eq!(join_args(&args), "count 3 true");
        assert_eq!(join_args(&[]), "");
    }
}
