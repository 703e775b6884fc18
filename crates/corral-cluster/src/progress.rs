//! Operator-facing progress output.
//!
//! Deploys, moves, and rebalances narrate what they're doing to a
//! writer streamed back to the operator. `ProgressLog` wraps that
//! writer so actions can share it across tasks.

use std::io::Write;
use std::sync::{Arc, Mutex};

#[derive(Clone)]
pub struct ProgressLog {
    sink: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl ProgressLog {
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            sink: Arc::new(Mutex::new(writer)),
        }
    }

    /// A log that drops everything.
    pub fn discard() -> Self {
        Self::new(Box::new(std::io::sink()))
    }

    /// A log capturing into a buffer, plus a handle to read it back.
    pub fn memory() -> (Self, ProgressBuffer) {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let log = Self {
            sink: Arc::new(Mutex::new(Box::new(SharedBuffer(buffer.clone())))),
        };
        (log, ProgressBuffer(buffer))
    }

    pub fn line(&self, text: impl AsRef<str>) {
        let mut sink = self.sink.lock().unwrap();
        // Progress output is advisory; a broken writer never fails an op.
        let _ = writeln!(sink, "{}", text.as_ref());
    }
}

/// Read side of [`ProgressLog::memory`].
pub struct ProgressBuffer(Arc<Mutex<Vec<u8>>>);

impl ProgressBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_log_captures_lines() {
        let (log, buffer) = ProgressLog::memory();
        log.line("---- Starting 2 new units ----");
        log.line(" ---> Started unit abc123 [web]");
        let text = buffer.contents();
        assert!(text.contains("Starting 2 new units"));
        assert!(text.contains("abc123"));
    }

    #[test]
    fn discard_log_swallows() {
        let log = ProgressLog::discard();
        log.line("ignored");
    }
}
