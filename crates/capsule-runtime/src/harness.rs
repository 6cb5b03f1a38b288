//! Convention-based test runner.
//!
//! Every zero-parameter global function whose name starts with
//! [`TEST_PREFIX`] is a test. Tests run in name order; each one gets a fresh
//! output buffer and a [`StderrInterceptor`], and every line it writes to
//! standard error is recorded as a failure.

use std::io::Write;

use chrono::Utc;
use regex::Regex;
use tracing::debug;

use capsule_common::RuntimeError;
use capsule_core::{SharedBuffer, Sink, StderrInterceptor, TestError, TestResult};

use crate::RuntimeContext;

/// Name prefix that marks a test entry point.
pub const TEST_PREFIX: &str = "test_";

impl RuntimeContext {
    /// Test entries as `(function name, display name)`, in run order.
    ///
    /// `pattern` is matched against the display name.
    pub fn test_entries(&self, pattern: Option<&Regex>) -> Vec<(String, String)> {
        self.functions()
            .into_iter()
            .filter(|(_, params)| *params == 0)
            .filter_map(|(name, _)| {
                let display = name.strip_prefix(TEST_PREFIX)?.to_string();
                Some((name, display))
            })
            .filter(|(_, display)| pattern.is_none_or(|re| re.is_match(display)))
            .collect()
    }

    /// Run every discovered test and report one result per test.
    ///
    /// A failing test never stops the run. Output sinks are restored
    /// afterwards.
    pub fn run_tests(&mut self, pattern: Option<&Regex>) -> Vec<TestResult> {
        let entries = self.test_entries(pattern);
        debug!(count = entries.len(), "Running tests");

        entries
            .into_iter()
            .map(|(entry, name)| self.run_test(&entry, name))
            .collect()
    }

    fn run_test(&mut self, entry: &str, name: String) -> TestResult {
        let verbose = self.verbose();
        let stdout = SharedBuffer::new();
        let real_stdout = self.host().stdout();
        let real_stderr = self.host().stderr();
        let interceptor = StderrInterceptor::new(real_stderr.clone());

        if verbose {
            report(&real_stdout, &format!("TEST: {name}"));
        }

        self.set_stdout(Sink::new(stdout.clone()));
        self.set_stderr(Sink::new(interceptor.clone()));

        let started = Utc::now();
        let outcome = self.call(entry, Vec::new());
        let finished = Utc::now();

        self.set_stdout(real_stdout.clone());
        self.set_stderr(real_stderr.clone());

        let (mut errors, stderr) = interceptor.finish();
        if let Err(e) = outcome {
            errors.push(TestError::new(failure_message(&e).trim()));
        }

        let result = TestResult {
            name,
            started,
            finished,
            errors,
            stdout: stdout.contents(),
            stderr,
        };

        if verbose && !result.stdout.is_empty() {
            if let Err(e) = real_stdout.clone().write_all(result.stdout.as_bytes()) {
                debug!(error = %e, "Failed to mirror test output");
            }
        }

        if result.passed() {
            if verbose {
                report(
                    &real_stdout,
                    &format!("PASS: {} ({:?})", result.name, result.elapsed()),
                );
            }
        } else {
            report(
                &real_stderr,
                &format!("FAIL: {} ({:?})", result.name, result.elapsed()),
            );
            for error in &result.errors {
                report(
                    &real_stderr,
                    &format!(
                        "    error: {} (at +{:?})",
                        error.message,
                        result.offset(error)
                    ),
                );
            }
        }

        result
    }
}

fn failure_message(err: &RuntimeError) -> String {
    match err {
        RuntimeError::Execution { message } => message.clone(),
        other => other.to_string(),
    }
}

fn report(sink: &Sink, line: &str) {
    if let Err(e) = sink.write_line(line) {
        debug!(error = %e, "Failed to write test report");
    }
}
