use crate::entry::{self, Payload, SourceLocation};
use crate::error::{Error, Result};
use crate::severity::{Severity, SeverityTracker};
use crate::sink::SinkWriter;
use crate::trace::TraceContext;
use crate::INTERNAL_TARGET;
use serde_json::{Map, Value};
use std::fmt::Display;
use std::sync::Arc;
use tracing::error;

/// Application logger bound to one request's [`TraceContext`].
///
/// Every entry it writes carries the request's trace and span, and the highest
/// severity written is remembered for the request's access-log entry. One
/// logger belongs to one request; it is not meant to be shared.
///
/// All logging methods are `#[track_caller]`: the source location recorded is
/// the line that called the logger, not a line inside this crate. The
/// [`info!`](crate::info) family of macros also records the calling module.
pub struct RequestLogger {
    sink: Arc<SinkWriter>,
    flush_also: Option<Arc<SinkWriter>>,
    trace: TraceContext,
    level: Severity,
    tracker: SeverityTracker,
}

/// Outcome of the fatal flush, before the process exits.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum FatalOutcome {
    /// This call owns the shutdown; the sinks were flushed.
    Flushed,
    /// Another fatal call is already shutting the process down.
    AlreadyExiting,
}

impl RequestLogger {
    pub fn new(sink: Arc<SinkWriter>, trace: TraceContext, level: Severity) -> Self {
        Self {
            sink,
            flush_also: None,
            trace,
            level,
            tracker: SeverityTracker::new(),
        }
    }

    /// Also flush `other` before a fatal exit or a panic-level return, e.g. the
    /// sink holding access-log entries.
    pub fn flushing_also(mut self, other: Arc<SinkWriter>) -> Self {
        if !Arc::ptr_eq(&self.sink, &other) {
            self.flush_also = Some(other);
        }
        self
    }

    pub fn trace(&self) -> &TraceContext {
        &self.trace
    }

    /// The minimum severity that is written.
    pub fn level(&self) -> Severity {
        self.level
    }

    pub fn set_level(&mut self, level: Severity) {
        self.level = level;
    }

    pub fn enabled(&self, severity: Severity) -> bool {
        severity >= self.level
    }

    /// Highest severity written so far; `Default` if nothing was written.
    pub fn max_severity(&self) -> Severity {
        self.tracker.max()
    }

    /// Writes an entry if `severity` passes the level. `payload` is only
    /// called when it does.
    #[track_caller]
    pub fn log_with<F>(&mut self, severity: Severity, payload: F) -> bool
    where
        F: FnOnce() -> Payload,
    {
        if !self.enabled(severity) {
            return false;
        }
        self.emit(severity, SourceLocation::caller(), payload());
        true
    }

    /// Like [`log_with`](Self::log_with) with the source location supplied by
    /// the caller. Neither closure is called when `severity` is filtered out.
    pub fn log_at<L, F>(&mut self, severity: Severity, location: L, payload: F) -> bool
    where
        L: FnOnce() -> SourceLocation,
        F: FnOnce() -> Payload,
    {
        if !self.enabled(severity) {
            return false;
        }
        self.emit(severity, location(), payload());
        true
    }

    fn emit(&mut self, severity: Severity, location: SourceLocation, payload: Payload) {
        let entry = entry::build(severity, payload, &self.trace, Some(location));
        self.tracker.record(severity);
        self.sink.append(entry);
    }

    #[track_caller]
    pub fn log(&mut self, severity: Severity, payload: impl Into<Payload>) -> bool {
        self.log_with(severity, || payload.into())
    }

    #[track_caller]
    pub fn log_structured(&mut self, severity: Severity, fields: Map<String, Value>) -> bool {
        self.log_with(severity, || Payload::Structured(fields))
    }

    #[track_caller]
    pub fn print(&mut self, message: impl Display) {
        self.log_with(Severity::Default, || message.to_string().into());
    }

    #[track_caller]
    pub fn debug(&mut self, message: impl Display) {
        self.log_with(Severity::Debug, || message.to_string().into());
    }

    #[track_caller]
    pub fn info(&mut self, message: impl Display) {
        self.log_with(Severity::Info, || message.to_string().into());
    }

    #[track_caller]
    pub fn warn(&mut self, message: impl Display) {
        self.log_with(Severity::Warning, || message.to_string().into());
    }

    #[track_caller]
    pub fn error(&mut self, message: impl Display) {
        self.log_with(Severity::Error, || message.to_string().into());
    }

    /// Writes a `Critical` entry, flushes, and exits the process with status 1.
    ///
    /// If another thread is already in `fatal`, this call parks until that
    /// thread exits the process.
    #[track_caller]
    pub fn fatal(&mut self, message: impl Display) -> ! {
        if self.log_fatal(message.to_string().into()) == FatalOutcome::Flushed {
            std::process::exit(1);
        }
        loop {
            std::thread::park();
        }
    }

    /// Writes an `Alert` entry, flushes, and returns [`Error::Alert`] carrying
    /// the message, for the host framework's recovery layer to turn into an
    /// error response.
    #[track_caller]
    pub fn panic<T>(&mut self, message: impl Display) -> Result<T> {
        let message = message.to_string();
        self.log_with(Severity::Alert, || message.clone().into());
        self.flush_all();
        Err(Error::Alert(message))
    }

    #[track_caller]
    pub(crate) fn log_fatal(&mut self, payload: Payload) -> FatalOutcome {
        if !self.sink.begin_fatal() {
            return FatalOutcome::AlreadyExiting;
        }
        self.log_with(Severity::Critical, || payload);
        self.flush_all();
        FatalOutcome::Flushed
    }

    fn flush_all(&self) {
        for sink in std::iter::once(&self.sink).chain(self.flush_also.as_ref()) {
            if let Err(err) = sink.flush() {
                error!(target: INTERNAL_TARGET, error = %err, "failed to flush log entries");
            }
        }
    }
}
