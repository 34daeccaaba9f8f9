//! Batched, asynchronous delivery of log entries.
//!
//! Appends go into a mutex-guarded buffer. When the buffer reaches the batch
//! size, or after `flush_interval` without a full batch, its contents are
//! queued for a single delivery thread which hands them to the [`Transport`].
//! Because one thread drains the queue in order, entries appended by one
//! caller are delivered in append order.

use crate::entry::LogEntry;
use crate::error::{Error, Result};
use crate::transport::Transport;
use crate::INTERNAL_TARGET;
use parking_lot::Mutex;
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Shortest accepted `flush_interval`; anything lower would keep the
/// delivery thread spinning.
pub const MIN_FLUSH_INTERVAL: Duration = Duration::from_millis(10);

thread_local! {
    // Set on delivery threads. Whatever a transport logs while delivering
    // (including `log` records from the HTTP client) must not become new
    // entries, or every delivery would produce the next batch.
    static DELIVERY_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// Whether the current thread is a [`SinkWriter`] delivery thread.
pub(crate) fn on_delivery_thread() -> bool {
    DELIVERY_THREAD.with(Cell::get)
}

#[derive(Debug, Clone)]
pub struct SinkConfig {
    /// Number of buffered entries that triggers a delivery.
    pub batch_size: usize,
    /// Buffered entries are delivered after this long even if the batch is not full.
    pub flush_interval: Duration,
    /// Upper bound on how long [`SinkWriter::flush`] waits for the delivery thread.
    pub flush_timeout: Duration,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval: Duration::from_secs(1),
            flush_timeout: Duration::from_secs(5),
        }
    }
}

/// Counters since the writer was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub appended: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub batches: u64,
    pub flushes: u64,
}

#[derive(Default)]
struct Counters {
    appended: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    batches: AtomicU64,
    flushes: AtomicU64,
}

enum Command {
    Batch(Vec<LogEntry>),
    Flush(Sender<()>),
    Stop,
}

struct Inner {
    config: SinkConfig,
    buffer: Mutex<Vec<LogEntry>>,
    commands: Sender<Command>,
    counters: Counters,
    closed: AtomicBool,
    fatal: AtomicBool,
}

impl Inner {
    // Callers hold the buffer lock so queue order matches append order.
    fn enqueue(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|err| {
            if let Command::Batch(batch) = err.0 {
                self.counters
                    .dropped
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
            }
            Error::SinkClosed
        })
    }

    fn enqueue_buffered(&self) -> Result<()> {
        let mut buffer = self.buffer.lock();
        if buffer.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut *buffer);
        self.enqueue(Command::Batch(batch))
    }
}

/// Shared, thread-safe writer in front of a [`Transport`].
pub struct SinkWriter {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SinkWriter {
    pub fn new(transport: impl Transport + 'static, config: SinkConfig) -> Self {
        let config = SinkConfig {
            batch_size: config.batch_size.max(1),
            flush_interval: config.flush_interval.max(MIN_FLUSH_INTERVAL),
            ..config
        };
        let (commands, receiver) = mpsc::channel();
        let inner = Arc::new(Inner {
            config,
            buffer: Mutex::new(Vec::new()),
            commands,
            counters: Counters::default(),
            closed: AtomicBool::new(false),
            fatal: AtomicBool::new(false),
        });
        let worker = {
            let inner = inner.clone();
            thread::Builder::new()
                .name("gcplog-sink".into())
                .spawn(move || run_worker(inner, receiver, transport))
        };
        let worker = match worker {
            Ok(handle) => Some(handle),
            Err(err) => {
                error!(target: INTERNAL_TARGET, error = %err, "failed to spawn log delivery thread");
                inner.closed.store(true, Ordering::Release);
                None
            }
        };
        Self {
            inner,
            worker: Mutex::new(worker),
        }
    }

    pub fn config(&self) -> &SinkConfig {
        &self.inner.config
    }

    /// Buffers `entry`. Never blocks on the transport. Entries appended after
    /// shutdown are dropped and counted.
    pub fn append(&self, entry: LogEntry) {
        // Checked under the lock so a concurrent shutdown's flush sees the entry.
        let mut buffer = self.inner.buffer.lock();
        if self.inner.closed.load(Ordering::Acquire) {
            drop(buffer);
            self.inner.counters.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(target: INTERNAL_TARGET, "log entry appended after sink shutdown, dropping");
            return;
        }
        self.inner.counters.appended.fetch_add(1, Ordering::Relaxed);
        buffer.push(entry);
        if buffer.len() >= self.inner.config.batch_size {
            let batch = std::mem::take(&mut *buffer);
            if self.inner.enqueue(Command::Batch(batch)).is_err() {
                warn!(target: INTERNAL_TARGET, "log delivery thread is gone, dropping batch");
            }
        }
    }

    /// Entries waiting for the next batch.
    pub fn buffered(&self) -> usize {
        self.inner.buffer.lock().len()
    }

    pub fn stats(&self) -> SinkStats {
        let c = &self.inner.counters;
        SinkStats {
            appended: c.appended.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            batches: c.batches.load(Ordering::Relaxed),
            flushes: c.flushes.load(Ordering::Relaxed),
        }
    }

    /// Waits until everything appended before this call has been handed to the
    /// transport, or until `flush_timeout` passes.
    pub fn flush(&self) -> Result<()> {
        let (ack, acked) = mpsc::channel();
        {
            let mut buffer = self.inner.buffer.lock();
            if !buffer.is_empty() {
                let batch = std::mem::take(&mut *buffer);
                self.inner.enqueue(Command::Batch(batch))?;
            }
            self.inner.enqueue(Command::Flush(ack))?;
        }
        self.inner.counters.flushes.fetch_add(1, Ordering::Relaxed);
        let timeout = self.inner.config.flush_timeout;
        match acked.recv_timeout(timeout) {
            Ok(()) => Ok(()),
            Err(RecvTimeoutError::Timeout) => Err(Error::FlushTimeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(Error::SinkClosed),
        }
    }

    /// Flushes, stops the delivery thread and rejects further appends.
    ///
    /// If the flush times out the delivery thread is told to stop but not
    /// waited for, so a hung transport cannot block process exit.
    pub fn shutdown(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let flushed = self.flush();
        // The worker may already be gone; nothing left to stop then.
        let _ = self.inner.commands.send(Command::Stop);
        let handle = self.worker.lock().take();
        if flushed.is_ok() {
            if let Some(handle) = handle {
                if handle.join().is_err() {
                    error!(target: INTERNAL_TARGET, "log delivery thread panicked");
                }
            }
        }
        flushed
    }

    /// One-shot guard for the fatal flush-then-exit path. Only the first
    /// caller gets `true`; everyone after must not flush or exit.
    pub fn begin_fatal(&self) -> bool {
        self.inner
            .fatal
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Drop for SinkWriter {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!(target: INTERNAL_TARGET, error = %err, "log entries may have been lost at shutdown");
        }
    }
}

fn run_worker(inner: Arc<Inner>, receiver: Receiver<Command>, transport: impl Transport) {
    DELIVERY_THREAD.with(|flag| flag.set(true));
    let interval = inner.config.flush_interval;
    loop {
        match receiver.recv_timeout(interval) {
            Ok(Command::Batch(batch)) => deliver(&inner, &transport, batch),
            Ok(Command::Flush(ack)) => {
                // The flusher may have timed out and left.
                let _ = ack.send(());
            }
            Ok(Command::Stop) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                // Re-enqueued rather than delivered here so a batch queued
                // concurrently by an appender still goes out first.
                if inner.enqueue_buffered().is_err() {
                    break;
                }
            }
        }
    }
    debug!(target: INTERNAL_TARGET, "log delivery thread stopped");
}

fn deliver(inner: &Inner, transport: &impl Transport, batch: Vec<LogEntry>) {
    let count = batch.len() as u64;
    match transport.deliver(&batch) {
        Ok(()) => {
            inner.counters.delivered.fetch_add(count, Ordering::Relaxed);
            inner.counters.batches.fetch_add(1, Ordering::Relaxed);
        }
        Err(err) => {
            inner.counters.dropped.fetch_add(count, Ordering::Relaxed);
            warn!(target: INTERNAL_TARGET, error = %err, dropped = count, "failed to deliver log entries");
        }
    }
}
