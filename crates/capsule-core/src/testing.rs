//! Test-result model and standard-error capture.
//!
//! - [`TestResult`] and [`TestError`]: the outcome of one script test entry
//! - [`StderrInterceptor`]: writer installed as a context's error sink while a
//!   test runs, turning each completed line into a [`TestError`]

use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;

use crate::Sink;

/// A single failure recorded against a test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestError {
    /// Whitespace-trimmed error text.
    pub message: String,

    /// When the error was recorded.
    pub timestamp: DateTime<Utc>,
}

impl TestError {
    /// Create an error stamped with the current time.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Outcome of running one test entry.
#[derive(Debug, Clone)]
pub struct TestResult {
    /// Display name (entry name without the test prefix).
    pub name: String,

    /// When the entry was invoked.
    pub started: DateTime<Utc>,

    /// When the entry returned or failed.
    pub finished: DateTime<Utc>,

    /// Errors in the order they were recorded.
    pub errors: Vec<TestError>,

    /// Everything the test wrote to standard output.
    pub stdout: String,

    /// Everything the test wrote to standard error.
    pub stderr: String,
}

impl TestResult {
    /// A test passes when it recorded no errors.
    pub fn passed(&self) -> bool {
        self.errors.is_empty()
    }

    /// Wall-clock duration of the test.
    pub fn elapsed(&self) -> Duration {
        (self.finished - self.started).to_std().unwrap_or_default()
    }

    /// How long after the start of the test `error` was recorded.
    pub fn offset(&self, error: &TestError) -> Duration {
        (error.timestamp - self.started).to_std().unwrap_or_default()
    }
}

#[derive(Debug, Default)]
struct Capture {
    line: Vec<u8>,
    text: Vec<u8>,
    errors: Vec<TestError>,
}

impl Capture {
    fn emit_line(&mut self) {
        let message = String::from_utf8_lossy(&self.line).trim().to_string();
        self.line.clear();
        if !message.is_empty() {
            self.errors.push(TestError::new(message));
        }
    }
}

/// Line-buffering writer placed in front of the real error stream.
///
/// Bytes accumulate until a `\n` arrives; each completed line that is not
/// blank after trimming becomes one [`TestError`]. All bytes are mirrored to
/// the wrapped sink unchanged and kept as captured text.
#[derive(Debug, Clone)]
pub struct StderrInterceptor {
    capture: Arc<Mutex<Capture>>,
    mirror: Sink,
}

impl StderrInterceptor {
    /// Create an interceptor that mirrors to `mirror`.
    pub fn new(mirror: Sink) -> Self {
        Self {
            capture: Arc::new(Mutex::new(Capture::default())),
            mirror,
        }
    }

    /// Flush any partial line and return the recorded errors and captured
    /// text. The interceptor is left empty.
    pub fn finish(&self) -> (Vec<TestError>, String) {
        let mut capture = self.capture.lock();
        if !capture.line.is_empty() {
            capture.emit_line();
        }
        let errors = std::mem::take(&mut capture.errors);
        let text = String::from_utf8_lossy(&std::mem::take(&mut capture.text)).into_owned();
        (errors, text)
    }
}

impl Write for StderrInterceptor {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        {
            let mut capture = self.capture.lock();
            capture.text.extend_from_slice(buf);
            for &byte in buf {
                if byte == b'\n' {
                    capture.emit_line();
                } else {
                    capture.line.push(byte);
                }
            }
        }

        if let Err(e) = self.mirror.write_all(buf) {
            debug!(error = %e, "Failed to mirror test stderr");
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Err(e) = self.mirror.flush() {
            debug!(error = %e, "Failed to flush test stderr");
        }
        Ok(())
    }
}
