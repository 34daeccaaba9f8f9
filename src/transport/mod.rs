//! Where batches of [`LogEntry`] values end up.

mod cloud;

pub use cloud::{CloudLoggingTransport, Credentials, Resource, DEFAULT_ENDPOINT};

use crate::entry::LogEntry;
use crate::error::Result;
use parking_lot::{Condvar, Mutex};
use std::io::{self, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Hands a batch of entries to a logging backend.
///
/// Called from the sink writer's delivery thread only, one batch at a time and
/// in enqueue order. An error drops the whole batch.
pub trait Transport: Send + Sync {
    fn deliver(&self, entries: &[LogEntry]) -> Result<()>;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn deliver(&self, entries: &[LogEntry]) -> Result<()> {
        (**self).deliver(entries)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn deliver(&self, entries: &[LogEntry]) -> Result<()> {
        (**self).deliver(entries)
    }
}

/// Writes one JSON object per line, the format the Cloud Logging agents on
/// Cloud Run, App Engine and GKE pick up from stdout/stderr.
pub struct WriterTransport {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl WriterTransport {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            writer: Mutex::new(Box::new(writer)),
        }
    }

    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    pub fn stderr() -> Self {
        Self::new(io::stderr())
    }
}

impl Transport for WriterTransport {
    fn deliver(&self, entries: &[LogEntry]) -> Result<()> {
        let mut writer = self.writer.lock();
        for entry in entries {
            writeln!(writer, "{}", entry.to_json()?)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Keeps every delivered batch in memory. Useful in tests.
#[derive(Default)]
pub struct MemoryTransport {
    batches: Mutex<Vec<Vec<LogEntry>>>,
    delivered: Condvar,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> Vec<Vec<LogEntry>> {
        self.batches.lock().clone()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.batches.lock().iter().flatten().cloned().collect()
    }

    /// Blocks until at least `count` batches were delivered or `timeout` passes.
    pub fn wait_for_batches(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut batches = self.batches.lock();
        while batches.len() < count {
            if self.delivered.wait_until(&mut batches, deadline).timed_out() {
                return batches.len() >= count;
            }
        }
        true
    }
}

impl Transport for MemoryTransport {
    fn deliver(&self, entries: &[LogEntry]) -> Result<()> {
        self.batches.lock().push(entries.to_vec());
        self.delivered.notify_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{build, LogEntry, Payload};
    use crate::severity::Severity;
    use crate::trace::TraceContext;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_writer_transport_json_lines() {
        let buf = SharedBuf::default();
        let transport = WriterTransport::new(buf.clone());
        let ctx = TraceContext::default();
        let entries = vec![
            build(Severity::Info, "first".into(), &ctx, None),
            build(Severity::Error, "second".into(), &ctx, None),
        ];
        transport.deliver(&entries).unwrap();

        let out = String::from_utf8(buf.0.lock().clone()).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed = LogEntry::from_json(lines[1]).unwrap();
        assert_eq!(parsed.severity, Severity::Error);
        assert_eq!(parsed.payload, Payload::Text("second".into()));
    }

    #[test]
    fn test_memory_transport_wait() {
        let transport = Arc::new(MemoryTransport::new());
        assert!(!transport.wait_for_batches(1, Duration::from_millis(10)));

        let t = transport.clone();
        let handle = std::thread::spawn(move || {
            let entry = build(Severity::Info, "x".into(), &TraceContext::default(), None);
            t.deliver(&[entry]).unwrap();
        });
        assert!(transport.wait_for_batches(1, Duration::from_secs(5)));
        handle.join().unwrap();
        assert_eq!(transport.entries().len(), 1);
    }
}
