//! Per-context host state.
//!
//! Every capability handler installed into an interpreter closes over one
//! [`HostState`]. Copying a runtime context builds a fresh state and a fresh
//! handler table around it, so handlers never reach back into the context
//! they were copied from.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use crate::FetchService;
use capsule_core::Sink;

/// State reachable from capability handlers.
#[derive(Debug)]
pub struct HostState {
    fetch: FetchService,
    stdout: Mutex<Sink>,
    stderr: Mutex<Sink>,
    verbose: AtomicBool,
}

impl HostState {
    /// Create a new host state.
    pub fn new(fetch: FetchService, stdout: Sink, stderr: Sink, verbose: bool) -> Self {
        Self {
            fetch,
            stdout: Mutex::new(stdout),
            stderr: Mutex::new(stderr),
            verbose: AtomicBool::new(verbose),
        }
    }

    /// The HTTP capability.
    pub fn fetch(&self) -> &FetchService {
        &self.fetch
    }

    /// Current standard output sink.
    pub fn stdout(&self) -> Sink {
        self.stdout.lock().clone()
    }

    /// Current standard error sink.
    pub fn stderr(&self) -> Sink {
        self.stderr.lock().clone()
    }

    /// Replace the standard output sink, returning the previous one.
    pub fn set_stdout(&self, sink: Sink) -> Sink {
        std::mem::replace(&mut *self.stdout.lock(), sink)
    }

    /// Replace the standard error sink, returning the previous one.
    pub fn set_stderr(&self, sink: Sink) -> Sink {
        std::mem::replace(&mut *self.stderr.lock(), sink)
    }

    /// Whether `debug` output is shown.
    pub fn verbose(&self) -> bool {
        self.verbose.load(Ordering::Relaxed)
    }

    /// Toggle `debug` output.
    pub fn set_verbose(&self, verbose: bool) {
        self.verbose.store(verbose, Ordering::Relaxed);
    }

    /// Write a line to standard output.
    pub fn write_stdout(&self, text: &str) {
        write_line(&self.stdout(), text);
    }

    /// Write a line to standard error.
    pub fn write_stderr(&self, text: &str) {
        write_line(&self.stderr(), text);
    }
}

fn write_line(sink: &Sink, text: &str) {
    if let Err(e) = sink.write_line(text) {
        debug!(error = %e, "Failed to write script output");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::Permissions;
    use capsule_core::{ScriptCache, SharedBuffer};

    fn state() -> HostState {
        let fetch = FetchService::with_client(
            reqwest::blocking::Client::new(),
            Arc::new(ScriptCache::new(std::env::temp_dir())),
            Permissions::all(),
        );
        HostState::new(fetch, Sink::null(), Sink::null(), false)
    }

    #[test]
    fn test_swap_sinks() {
        let state = state();
        let out = SharedBuffer::new();
        let err = SharedBuffer::new();

        let previous_out = state.set_stdout(Sink::new(out.clone()));
        let previous_err = state.set_stderr(Sink::new(err.clone()));
        state.write_stdout("to stdout");
        state.write_stderr("to stderr");

        assert_eq!(out.contents(), "to stdout\n");
        assert_eq!(err.contents(), "to stderr\n");

        state.set_stdout(previous_out.clone());
        state.write_stdout("dropped");
        assert_eq!(out.contents(), "to stdout\n");
        assert!(state.stdout().same_as(&previous_out));
        assert!(!state.stderr().same_as(&previous_err));
    }

    #[test]
    fn test_verbose_toggle() {
        let state = state();
        assert!(!state.verbose());
        state.set_verbose(true);
        assert!(state.verbose());
    }
}
