//! Access logging around one request.

use crate::entry::{self, HttpRequest};
use crate::error::Error;
use crate::logger::RequestLogger;
use crate::severity::{Severity, SharedSeverity};
use crate::sink::SinkWriter;
use crate::trace::{HeaderSource, TraceContext, TraceExtractor};
use std::sync::Arc;
use std::time::Instant;
use tracing::{span, Level, Span};
use tracing_subscriber::registry::{LookupSpan, Registry, SpanData};

pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
pub const USER_AGENT_HEADER: &str = "user-agent";

/// Status recorded when the handler never finished (it unwound or its future
/// was dropped): 499, "client closed request".
pub const CANCELLED_STATUS: u16 = 499;

/// What the middleware needs to know about an inbound request.
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    /// Address of the directly connected peer.
    pub peer_addr: Option<String>,
    pub request_size: Option<u64>,
}

impl RequestInfo {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_peer_addr(mut self, addr: impl Into<String>) -> Self {
        self.peer_addr = Some(addr.into());
        self
    }

    /// First address of `X-Forwarded-For` if present, else the peer address.
    pub fn remote_ip(&self) -> String {
        self.headers
            .header(FORWARDED_FOR_HEADER)
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
            .map(str::to_string)
            .or_else(|| self.peer_addr.clone())
            .unwrap_or_default()
    }
}

/// Status and size of whatever the handler produced, success or error.
pub trait ResponseMeta {
    fn status(&self) -> u16;

    fn response_size(&self) -> Option<u64> {
        None
    }
}

impl ResponseMeta for Error {
    fn status(&self) -> u16 {
        500
    }
}

/// Wraps request handling: hands the handler a [`RequestLogger`] bound to the
/// request's trace and writes one access-log entry when it is done.
///
/// The access entry's severity is the highest severity logged for the
/// request, through its [`RequestLogger`] or as `tracing` events inside its
/// span, so healthy requests are not flagged and failing ones stand out.
#[derive(Clone)]
pub struct RequestLog {
    app_sink: Arc<SinkWriter>,
    request_sink: Arc<SinkWriter>,
    extractor: TraceExtractor,
    level: Severity,
}

impl RequestLog {
    /// Application entries go to `app_sink`, access entries to `request_sink`.
    /// Both may be the same writer.
    pub fn new(
        app_sink: Arc<SinkWriter>,
        request_sink: Arc<SinkWriter>,
        extractor: TraceExtractor,
        level: Severity,
    ) -> Self {
        Self {
            app_sink,
            request_sink,
            extractor,
            level,
        }
    }

    pub fn extractor(&self) -> &TraceExtractor {
        &self.extractor
    }

    /// Runs `handler` and returns its result untouched; errors are for the
    /// host framework to render.
    ///
    /// While the handler runs, a `request` tracing span carrying `trace_id`,
    /// `span_id` and `sampled` is entered, so `tracing` events are correlated
    /// too when [`GcpLayer`](crate::GcpLayer) is installed.
    pub fn handle<R, E, F>(&self, request: &RequestInfo, handler: F) -> Result<R, E>
    where
        R: ResponseMeta,
        E: ResponseMeta,
        F: FnOnce(&mut RequestLogger) -> Result<R, E>,
    {
        let start = Instant::now();
        let trace = self.extractor.extract(&request.headers);
        // Error level keeps the span enabled under any minimum that lets
        // events through at all.
        let span = span!(
            Level::ERROR,
            "request",
            method = %request.method,
            url = %request.url,
            trace_id = %trace.trace_id,
            span_id = %trace.span_id,
            sampled = trace.sampled,
        );
        let shared = SharedSeverity::default();
        attach(&span, &shared);
        let _enter = span.enter();

        let logger = RequestLogger::new(self.app_sink.clone(), trace.clone(), self.level)
            .flushing_also(self.request_sink.clone());
        let mut guard = AccessLogGuard {
            sink: &self.request_sink,
            request,
            trace,
            start,
            logger,
            shared,
            outcome: None,
        };
        let result = handler(&mut guard.logger);
        guard.outcome = Some(match &result {
            Ok(response) => (response.status(), response.response_size()),
            Err(err) => (err.status(), err.response_size()),
        });
        drop(guard);
        result
    }
}

// Makes the request's severity reachable from `GcpLayer`. Without a registry
// underneath the current subscriber there is nothing to attach to.
fn attach(span: &Span, shared: &SharedSeverity) {
    span.with_subscriber(|(id, dispatch)| {
        if let Some(data) = dispatch
            .downcast_ref::<Registry>()
            .and_then(|registry| registry.span_data(id))
        {
            data.extensions_mut().insert(shared.clone());
        }
    });
}

// Writes the access entry on drop so an unwinding handler still gets one.
struct AccessLogGuard<'a> {
    sink: &'a SinkWriter,
    request: &'a RequestInfo,
    trace: TraceContext,
    start: Instant,
    logger: RequestLogger,
    shared: SharedSeverity,
    outcome: Option<(u16, Option<u64>)>,
}

impl Drop for AccessLogGuard<'_> {
    fn drop(&mut self) {
        let (status, response_size) = self.outcome.unwrap_or((CANCELLED_STATUS, None));
        let http_request = HttpRequest {
            method: self.request.method.clone(),
            url: self.request.url.clone(),
            status,
            latency: self.start.elapsed(),
            request_size: self.request.request_size,
            response_size,
            remote_ip: self.request.remote_ip(),
            user_agent: self
                .request
                .headers
                .header(USER_AGENT_HEADER)
                .map(str::to_string),
        };
        let severity = self.logger.max_severity().max(self.shared.max());
        let entry = entry::build_access(severity, &self.trace, http_request);
        self.sink.append(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::LogEntry;
    use crate::layer::GcpLayer;
    use crate::sink::SinkConfig;
    use crate::transport::MemoryTransport;
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::time::Duration;
    use tracing_subscriber::filter::LevelFilter;
    use tracing_subscriber::prelude::*;

    struct Reply {
        status: u16,
        body: &'static str,
    }

    impl ResponseMeta for Reply {
        fn status(&self) -> u16 {
            self.status
        }

        fn response_size(&self) -> Option<u64> {
            Some(self.body.len() as u64)
        }
    }

    #[derive(Debug, PartialEq)]
    struct NotFound;

    impl ResponseMeta for NotFound {
        fn status(&self) -> u16 {
            404
        }
    }

    struct Harness {
        app: Arc<MemoryTransport>,
        requests: Arc<MemoryTransport>,
        app_sink: Arc<SinkWriter>,
        request_sink: Arc<SinkWriter>,
        log: RequestLog,
    }

    impl Harness {
        fn new(project_id: Option<&str>) -> Self {
            let config = SinkConfig {
                batch_size: 100,
                flush_interval: Duration::from_secs(3600),
                flush_timeout: Duration::from_secs(5),
            };
            let app = Arc::new(MemoryTransport::new());
            let requests = Arc::new(MemoryTransport::new());
            let app_sink = Arc::new(SinkWriter::new(app.clone(), config.clone()));
            let request_sink = Arc::new(SinkWriter::new(requests.clone(), config));
            let log = RequestLog::new(
                app_sink.clone(),
                request_sink.clone(),
                TraceExtractor::new(project_id.map(str::to_string)),
                Severity::Default,
            );
            Self {
                app,
                requests,
                app_sink,
                request_sink,
                log,
            }
        }

        fn access_entries(&self) -> Vec<LogEntry> {
            self.request_sink.flush().unwrap();
            self.requests.entries()
        }
    }

    fn traced(url: &str) -> RequestInfo {
        RequestInfo::new("GET", url)
            .with_header(
                "X-Cloud-Trace-Context",
                "105445aa7843bc8bf206b12000100000/1;o=1",
            )
            .with_peer_addr("10.0.0.1")
    }

    #[test]
    fn test_quiet_request_logs_default_severity() {
        let h = Harness::new(None);
        let result: Result<Reply, NotFound> = h.log.handle(&traced("/"), |_logger| {
            Ok(Reply {
                status: 200,
                body: "Index!",
            })
        });
        assert!(result.is_ok());

        let entries = h.access_entries();
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.trace_id, "105445aa7843bc8bf206b12000100000");
        assert_eq!(entry.span_id, "1");
        assert!(entry.trace_sampled);
        assert_eq!(entry.severity, Severity::Default);
        let req = entry.http_request.as_ref().unwrap();
        assert_eq!(req.status, 200);
        assert_eq!(req.response_size, Some(6));
        assert_eq!(req.method, "GET");
        assert_eq!(req.url, "/");
        assert_eq!(req.remote_ip, "10.0.0.1");
    }

    #[test]
    fn test_access_severity_is_max_logged() {
        let h = Harness::new(Some("my-project"));
        let _: Result<Reply, NotFound> = h.log.handle(&traced("/hello"), |logger| {
            logger.error("Error");
            logger.info("Info");
            Ok(Reply {
                status: 200,
                body: "Hello, World!",
            })
        });

        let entries = h.access_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].severity, Severity::Error);
        assert_eq!(
            entries[0].trace_id,
            "projects/my-project/traces/105445aa7843bc8bf206b12000100000"
        );

        h.app_sink.flush().unwrap();
        let app = h.app.entries();
        assert_eq!(app.len(), 2);
        assert!(app.iter().all(|e| e.trace_id == entries[0].trace_id));
        assert!(app.iter().all(|e| e.http_request.is_none()));
    }

    #[test]
    fn test_tracing_events_raise_access_severity() {
        let h = Harness::new(Some("my-project"));
        let layer = GcpLayer::new(h.app_sink.clone(), Some("my-project".into()));
        let subscriber = tracing_subscriber::registry().with(layer.with_filter(LevelFilter::WARN));
        tracing::subscriber::with_default(subscriber, || {
            let _: Result<Reply, NotFound> = h.log.handle(&traced("/hello"), |logger| {
                logger.info("Info");
                tracing::error!("from tracing");
                Ok(Reply {
                    status: 200,
                    body: "ok",
                })
            });
        });

        let access = h.access_entries();
        assert_eq!(access.len(), 1);
        assert_eq!(access[0].severity, Severity::Error);

        h.app_sink.flush().unwrap();
        let app = h.app.entries();
        let event = app
            .iter()
            .find(|e| e.message() == Some("from tracing"))
            .unwrap();
        assert_eq!(event.severity, Severity::Error);
        assert_eq!(event.trace_id, access[0].trace_id);
    }

    #[test]
    fn test_tracing_events_outside_request_not_tracked() {
        let h = Harness::new(None);
        let layer = GcpLayer::new(h.app_sink.clone(), None);
        let subscriber = tracing_subscriber::registry().with(layer);
        tracing::subscriber::with_default(subscriber, || {
            tracing::error!("before the request");
            let _: Result<Reply, NotFound> = h.log.handle(&traced("/"), |_| {
                Ok(Reply {
                    status: 200,
                    body: "ok",
                })
            });
        });
        assert_eq!(h.access_entries()[0].severity, Severity::Default);
    }

    #[test]
    fn test_handler_error_is_returned_and_logged() {
        let h = Harness::new(None);
        let result: Result<Reply, NotFound> = h.log.handle(&traced("/missing"), |logger| {
            logger.warn("no such page");
            Err(NotFound)
        });
        assert_eq!(result.err(), Some(NotFound));

        let entries = h.access_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].http_request.as_ref().unwrap().status, 404);
        assert_eq!(entries[0].severity, Severity::Warning);
    }

    #[test]
    fn test_alert_error_reaches_host() {
        let h = Harness::new(None);
        let result: Result<Reply, Error> = h
            .log
            .handle(&traced("/"), |logger| logger.panic("invariant broken"));
        assert!(matches!(result, Err(Error::Alert(ref m)) if m == "invariant broken"));

        let entries = h.access_entries();
        assert_eq!(entries[0].severity, Severity::Alert);
        assert_eq!(entries[0].http_request.as_ref().unwrap().status, 500);
    }

    #[test]
    fn test_unwinding_handler_still_logged() {
        let h = Harness::new(None);
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let _: Result<Reply, NotFound> = h.log.handle(&traced("/boom"), |logger| {
                logger.error("about to fail");
                panic!("handler blew up");
            });
        }));
        assert!(outcome.is_err());

        let entries = h.access_entries();
        assert_eq!(entries.len(), 1);
        let req = entries[0].http_request.as_ref().unwrap();
        assert_eq!(req.status, CANCELLED_STATUS);
        assert_eq!(entries[0].severity, Severity::Error);
    }

    #[test]
    fn test_untraced_request() {
        let h = Harness::new(Some("p"));
        let request = RequestInfo::new("POST", "/submit").with_header("User-Agent", "curl/8.0");
        let _: Result<Reply, NotFound> = h.log.handle(&request, |_| {
            Ok(Reply {
                status: 204,
                body: "",
            })
        });

        let entries = h.access_entries();
        assert_eq!(entries[0].trace_id, "");
        assert_eq!(entries[0].span_id, "");
        assert!(!entries[0].trace_sampled);
        let req = entries[0].http_request.as_ref().unwrap();
        assert_eq!(req.user_agent.as_deref(), Some("curl/8.0"));
        assert_eq!(req.remote_ip, "");
    }

    #[test]
    fn test_remote_ip_prefers_forwarded_for() {
        let request = RequestInfo::new("GET", "/")
            .with_header("X-Forwarded-For", " 203.0.113.7 , 10.1.1.1")
            .with_peer_addr("10.0.0.1");
        assert_eq!(request.remote_ip(), "203.0.113.7");

        let request = RequestInfo::new("GET", "/")
            .with_header("X-Forwarded-For", "")
            .with_peer_addr("10.0.0.1");
        assert_eq!(request.remote_ip(), "10.0.0.1");
    }

    #[test]
    fn test_one_access_entry_per_request() {
        let h = Harness::new(None);
        for i in 0..5 {
            let _: Result<Reply, NotFound> = h.log.handle(&traced(&format!("/{i}")), |logger| {
                logger.info("working");
                Ok(Reply {
                    status: 200,
                    body: "ok",
                })
            });
        }
        let urls: Vec<String> = h
            .access_entries()
            .iter()
            .map(|e| e.http_request.as_ref().unwrap().url.clone())
            .collect();
        assert_eq!(urls, ["/0", "/1", "/2", "/3", "/4"]);
    }
}
