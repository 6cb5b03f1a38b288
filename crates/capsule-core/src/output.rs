//! Output sinks for script-produced text.
//!
//! A [`Sink`] is a cheaply clonable handle to a writer; every clone writes to
//! the same destination. Runtime contexts hold one sink for standard output
//! and one for standard error, and the test harness swaps them out while a
//! test runs.

use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;

use parking_lot::Mutex;

/// Shared, thread-safe output destination.
#[derive(Clone)]
pub struct Sink(Arc<Mutex<Box<dyn Write + Send>>>);

impl Sink {
    /// Wrap any writer.
    pub fn new<W: Write + Send + 'static>(writer: W) -> Self {
        Self(Arc::new(Mutex::new(Box::new(writer))))
    }

    /// The process's standard output.
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    /// The process's standard error.
    pub fn stderr() -> Self {
        Self::new(io::stderr())
    }

    /// A sink that discards everything.
    pub fn null() -> Self {
        Self::new(io::sink())
    }

    /// Write `text` followed by a newline.
    pub fn write_line(&self, text: &str) -> io::Result<()> {
        let mut writer = self.0.lock();
        writer.write_all(text.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()
    }

    /// Returns `true` if both handles point at the same destination.
    pub fn same_as(&self, other: &Sink) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().write(buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.0.lock().write_all(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.lock().flush()
    }
}

impl fmt::Debug for Sink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Sink").field(&Arc::as_ptr(&self.0)).finish()
    }
}

/// In-memory byte buffer that can be handed out as a [`Sink`] and read back.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far, decoded lossily as UTF-8.
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }

    /// Drop everything written so far.
    pub fn clear(&self) {
        self.0.lock().clear();
    }

    /// Returns `true` if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
