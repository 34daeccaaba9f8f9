use crate::entry::{self, is_reserved_key, Payload, SourceLocation};
use crate::severity::{Severity, SharedSeverity};
use crate::sink::{on_delivery_thread, SinkWriter};
use crate::trace::TraceContext;
use crate::INTERNAL_TARGET;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id, Record};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

#[derive(Default)]
struct TraceVisitor {
    trace_id: Option<String>,
    span_id: Option<String>,
    sampled: Option<bool>,
}

impl TraceVisitor {
    fn apply(self, ctx: &mut TraceContext) {
        if let Some(trace_id) = self.trace_id {
            ctx.trace_id = trace_id;
        }
        if let Some(span_id) = self.span_id {
            ctx.span_id = span_id;
        }
        if let Some(sampled) = self.sampled {
            ctx.sampled = sampled;
        }
    }
}

impl Visit for TraceVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.record_string(field, value.to_string());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        if field.name() == "sampled" {
            self.sampled = Some(value);
        }
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.record_string(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.record_string(field, format!("{value:?}"));
    }
}

impl TraceVisitor {
    fn record_string(&mut self, field: &Field, value: String) {
        match field.name() {
            "trace_id" => self.trace_id = Some(value),
            "span_id" => self.span_id = Some(value),
            _ => {}
        }
    }
}

#[derive(Default)]
struct EventVisitor {
    fields: Map<String, Value>,
}

impl EventVisitor {
    fn insert(&mut self, field: &Field, value: Value) {
        let name = field.name();
        if name == "message" || !is_reserved_key(name) {
            self.fields.insert(name.to_string(), value);
        }
    }

    fn into_payload(mut self) -> Payload {
        let text_only = self.fields.len() == 1 && self.fields.contains_key("message");
        match self.fields.remove("message") {
            Some(Value::String(text)) if text_only => Payload::Text(text),
            Some(message) => {
                self.fields.insert("message".into(), message);
                Payload::Structured(self.fields)
            }
            None if self.fields.is_empty() => Payload::default(),
            None => Payload::Structured(self.fields),
        }
    }
}

impl Visit for EventVisitor {
    fn record_f64(&mut self, field: &Field, value: f64) {
        self.insert(field, Value::from(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, Value::from(value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert(field, Value::from(value));
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.insert(field, Value::from(value.to_string()));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.insert(field, Value::from(format!("{value:?}")));
    }
}

/// A [`Layer`] that turns `tracing` events into [`LogEntry`](crate::LogEntry)
/// values and appends them to a [`SinkWriter`].
///
/// Trace correlation comes from the closest enclosing span that recorded a
/// `trace_id` field (plus optional `span_id` and `sampled`). A bare trace id
/// is expanded to `projects/<project_id>/traces/<trace_id>` when a project id
/// is known. Events the crate emits about its own delivery are skipped, as is
/// anything raised on a delivery thread (such as the HTTP client's `log`
/// records bridged into `tracing`).
///
/// Events inside a [`RequestLog`](crate::RequestLog) request also raise that
/// request's access-log severity.
pub struct GcpLayer {
    sink: Arc<SinkWriter>,
    gcp_project_id: Option<String>,
}

impl GcpLayer {
    pub fn new(sink: Arc<SinkWriter>, gcp_project_id: Option<String>) -> Self {
        Self {
            sink,
            gcp_project_id: gcp_project_id.filter(|p| !p.is_empty()),
        }
    }

    fn qualify(&self, mut trace: TraceContext) -> TraceContext {
        if let Some(project_id) = &self.gcp_project_id {
            if !trace.trace_id.starts_with("projects/") {
                trace.trace_id = format!("projects/{project_id}/traces/{}", trace.trace_id);
            }
        }
        trace
    }
}

impl<S> Layer<S> for GcpLayer
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut visitor = TraceVisitor::default();
        attrs.record(&mut visitor);
        let mut trace = TraceContext::default();
        visitor.apply(&mut trace);
        if !trace.is_empty() {
            span.extensions_mut().insert(trace);
        }
    }

    fn on_record(&self, id: &Id, values: &Record<'_>, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut visitor = TraceVisitor::default();
        values.record(&mut visitor);
        let mut extensions = span.extensions_mut();
        let mut trace = extensions.remove::<TraceContext>().unwrap_or_default();
        visitor.apply(&mut trace);
        if !trace.is_empty() {
            extensions.insert(trace);
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if metadata.target().starts_with(INTERNAL_TARGET) || on_delivery_thread() {
            return;
        }

        // Innermost span wins for both.
        let mut trace = None;
        let mut request_severity = None;
        if let Some(scope) = ctx.event_scope(event) {
            for span in scope {
                let extensions = span.extensions();
                if trace.is_none() {
                    trace = extensions.get::<TraceContext>().cloned();
                }
                if request_severity.is_none() {
                    request_severity = extensions.get::<SharedSeverity>().cloned();
                }
            }
        }
        let trace = match trace {
            Some(trace) if !trace.is_empty() => self.qualify(trace),
            _ => TraceContext::default(),
        };
        let severity = Severity::from(*metadata.level());
        if let Some(request_severity) = request_severity {
            request_severity.record(severity);
        }

        let mut visitor = EventVisitor::default();
        event.record(&mut visitor);

        let source_location = metadata.file().map(|file| SourceLocation {
            file: file.to_string(),
            line: metadata.line().unwrap_or(0),
            function: metadata.target().to_string(),
        });

        let entry = entry::build(
            severity,
            visitor.into_payload(),
            &trace,
            source_location,
        );
        self.sink.append(entry);
    }
}
