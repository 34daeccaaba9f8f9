//! Structured logging for Google Cloud Logging with trace correlation.
//!
//! Entries are written either as JSON lines that the Cloud Run / App Engine
//! logging agents understand, or directly to the Cloud Logging API. Each
//! request gets a [`RequestLogger`] bound to the trace found in its
//! `traceparent` or `X-Cloud-Trace-Context` header, and one access-log entry
//! whose severity is the highest severity logged while handling it.

mod macros;

mod config;
pub mod entry;
mod error;
mod layer;
mod logger;
pub mod metadata;
mod middleware;
mod severity;
mod sink;
pub mod trace;
pub mod transport;

pub use config::{Config, Output};
pub use entry::{HttpRequest, LogEntry, Payload, SourceLocation};
pub use error::{Error, Result};
pub use layer::GcpLayer;
pub use logger::RequestLogger;
pub use middleware::{RequestInfo, RequestLog, ResponseMeta, CANCELLED_STATUS};
pub use severity::{Severity, SeverityTracker};
pub use sink::{SinkConfig, SinkStats, SinkWriter, MIN_FLUSH_INTERVAL};
pub use trace::{HeaderSource, TraceContext, TraceExtractor};

use std::sync::Arc;
use tracing::Subscriber;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{registry, Layer};

/// Target of the crate's own diagnostics. [`GcpLayer`] never turns these into
/// log entries, so a failing sink cannot feed itself.
pub(crate) const INTERNAL_TARGET: &str = "gcplog_rs::internal";

/// The configured sinks plus everything needed to create request loggers.
///
/// Cheap to share behind an `Arc`; there is no process-wide logger, pass this
/// (or the [`RequestLog`] it creates) to whatever handles requests.
pub struct Pipeline {
    pub(crate) project_id: Option<String>,
    pub(crate) extractor: TraceExtractor,
    pub(crate) min_severity: Severity,
    pub(crate) app_sink: Arc<SinkWriter>,
    pub(crate) request_sink: Arc<SinkWriter>,
}

impl Pipeline {
    pub fn project_id(&self) -> Option<&str> {
        self.project_id.as_deref()
    }

    pub fn min_severity(&self) -> Severity {
        self.min_severity
    }

    pub fn app_sink(&self) -> &Arc<SinkWriter> {
        &self.app_sink
    }

    pub fn request_sink(&self) -> &Arc<SinkWriter> {
        &self.request_sink
    }

    /// Middleware writing application entries and access entries to this
    /// pipeline's sinks.
    pub fn request_log(&self) -> RequestLog {
        RequestLog::new(
            self.app_sink.clone(),
            self.request_sink.clone(),
            self.extractor.clone(),
            self.min_severity,
        )
    }

    /// A logger outside any request, e.g. for startup messages.
    pub fn logger(&self) -> RequestLogger {
        RequestLogger::new(
            self.app_sink.clone(),
            TraceContext::default(),
            self.min_severity,
        )
        .flushing_also(self.request_sink.clone())
    }

    /// A `tracing` layer feeding the application sink, filtered at the
    /// configured minimum severity.
    pub fn layer<S>(&self) -> impl Layer<S>
    where
        S: Subscriber + for<'lookup> LookupSpan<'lookup> + 'static,
    {
        GcpLayer::new(self.app_sink.clone(), self.project_id.clone())
            .with_filter(self.min_severity.level_filter())
    }

    pub fn flush(&self) -> Result<()> {
        let app = self.app_sink.flush();
        let request = if Arc::ptr_eq(&self.app_sink, &self.request_sink) {
            Ok(())
        } else {
            self.request_sink.flush()
        };
        app.and(request)
    }

    /// Flushes and stops both sinks. Call before the process exits; entries
    /// still buffered afterwards are lost.
    pub fn shutdown(&self) -> Result<()> {
        let app = self.app_sink.shutdown();
        let request = self.request_sink.shutdown();
        app.and(request)
    }
}

/// Initialize the GCP structured logging pipeline and install its `tracing` layer.
///
/// This sets up a tracing subscriber that outputs logs in the JSON format
/// expected by Google Cloud Run and Cloud Logging. To associate logs with traces,
/// create spans with a `trace_id` field using `info_span!("trace_id", trace_id = %"your-trace-id")`,
/// or wrap request handling in [`Pipeline::request_log`].
///
/// If the config does not specify a project ID, this will attempt to fetch it from the
/// GCP metadata service. If that fails, trace ids are written unqualified.
///
/// # Arguments
///
/// * `config` - Configuration for the pipeline
///
/// # Examples
///
/// ```no_run
/// use tracing::info;
///
/// // Auto-detect project ID from metadata service
/// let pipeline = gcplog_rs::init(gcplog_rs::Config::new())?;
/// info!("Application started");
/// pipeline.shutdown()?;
/// # Ok::<(), gcplog_rs::Error>(())
/// ```
///
/// ```no_run
/// use tracing_subscriber::filter::LevelFilter;
///
/// // Use explicit project ID and a custom level
/// let config = gcplog_rs::Config::with_project_id("my-project-123")
///     .with_level(LevelFilter::DEBUG);
/// let pipeline = gcplog_rs::init(config)?;
/// let mut logger = pipeline.logger();
/// logger.debug("Application started");
/// # Ok::<(), gcplog_rs::Error>(())
/// ```
pub fn init(config: Config) -> Result<Pipeline> {
    let pipeline = config.build()?;
    registry().with(pipeline.layer()).try_init()?;
    Ok(pipeline)
}
