//! Structured log records and their JSON rendering.
//!
//! [`LogEntry::to_json`] produces the single-line format understood by the
//! Cloud Logging agents on Cloud Run, App Engine and GKE: a JSON object with
//! `severity`, `message` (or the structured payload's fields at top level),
//! `time`, and the `logging.googleapis.com/*` correlation keys.

use crate::error::{Error, Result};
use crate::severity::Severity;
use crate::trace::TraceContext;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::panic::Location;
use std::time::Duration;

pub const TRACE_KEY: &str = "logging.googleapis.com/trace";
pub const SPAN_ID_KEY: &str = "logging.googleapis.com/spanId";
pub const TRACE_SAMPLED_KEY: &str = "logging.googleapis.com/trace_sampled";
pub const SOURCE_LOCATION_KEY: &str = "logging.googleapis.com/sourceLocation";
pub const HTTP_REQUEST_KEY: &str = "httpRequest";

const RESERVED_KEYS: [&str; 8] = [
    "severity",
    "time",
    "message",
    TRACE_KEY,
    SPAN_ID_KEY,
    TRACE_SAMPLED_KEY,
    SOURCE_LOCATION_KEY,
    HTTP_REQUEST_KEY,
];

/// The body of a log entry: free text or a key-ordered JSON object, never both.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text(String),
    Structured(Map<String, Value>),
}

impl Default for Payload {
    fn default() -> Self {
        Payload::Text(String::new())
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Payload::Text(s)
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload::Text(s.to_string())
    }
}

impl From<Map<String, Value>> for Payload {
    fn from(map: Map<String, Value>) -> Self {
        Payload::Structured(map)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub file: String,
    #[serde(serialize_with = "line_to_string", deserialize_with = "line_from_any")]
    pub line: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub function: String,
}

impl SourceLocation {
    pub fn new(file: impl Into<String>, line: u32, function: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            line,
            function: function.into(),
        }
    }

    /// The location of the caller of the enclosing `#[track_caller]` chain.
    /// `function` is left empty; the logging macros fill it in.
    #[track_caller]
    pub fn caller() -> Self {
        let location = Location::caller();
        Self {
            file: location.file().to_string(),
            line: location.line(),
            function: String::new(),
        }
    }
}

fn line_to_string<S: Serializer>(line: &u32, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(line)
}

fn line_from_any<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) => s.parse().map_err(serde::de::Error::custom),
        Value::Number(n) => n
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| serde::de::Error::custom("line out of range")),
        other => Err(serde::de::Error::custom(format!("invalid line: {other}"))),
    }
}

/// Request metadata attached to access-log entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub status: u16,
    pub latency: Duration,
    pub request_size: Option<u64>,
    pub response_size: Option<u64>,
    pub remote_ip: String,
    pub user_agent: Option<String>,
}

/// Cloud Logging's `HttpRequest` JSON shape; int64 fields travel as strings.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireHttpRequest {
    request_method: String,
    request_url: String,
    status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    request_size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    response_size: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    remote_ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user_agent: Option<String>,
    latency: String,
}

impl From<&HttpRequest> for WireHttpRequest {
    fn from(req: &HttpRequest) -> Self {
        Self {
            request_method: req.method.clone(),
            request_url: req.url.clone(),
            status: req.status,
            request_size: req.request_size.map(|n| n.to_string()),
            response_size: req.response_size.map(|n| n.to_string()),
            remote_ip: req.remote_ip.clone(),
            user_agent: req.user_agent.clone(),
            latency: format_latency(req.latency),
        }
    }
}

impl TryFrom<WireHttpRequest> for HttpRequest {
    type Error = Error;

    fn try_from(wire: WireHttpRequest) -> Result<Self> {
        let size = |s: Option<String>| -> Result<Option<u64>> {
            s.map(|s| {
                s.parse()
                    .map_err(|_| Error::InvalidEntry(format!("invalid size: {s}")))
            })
            .transpose()
        };
        Ok(Self {
            method: wire.request_method,
            url: wire.request_url,
            status: wire.status,
            latency: parse_latency(&wire.latency)?,
            request_size: size(wire.request_size)?,
            response_size: size(wire.response_size)?,
            remote_ip: wire.remote_ip,
            user_agent: wire.user_agent,
        })
    }
}

/// Protobuf JSON duration: `"1.500000000s"`.
pub(crate) fn format_latency(latency: Duration) -> String {
    format!("{}.{:09}s", latency.as_secs(), latency.subsec_nanos())
}

pub(crate) fn parse_latency(s: &str) -> Result<Duration> {
    let invalid = || Error::InvalidEntry(format!("invalid latency: {s}"));
    let digits = s.strip_suffix('s').ok_or_else(invalid)?;
    let (secs, frac) = digits.split_once('.').unwrap_or((digits, ""));
    if frac.len() > 9 {
        return Err(invalid());
    }
    let secs: u64 = secs.parse().map_err(|_| invalid())?;
    let nanos: u32 = if frac.is_empty() {
        0
    } else {
        format!("{frac:0<9}").parse().map_err(|_| invalid())?
    };
    Ok(Duration::new(secs, nanos))
}

/// One structured log record. Built once, never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub payload: Payload,
    pub trace_id: String,
    pub span_id: String,
    pub trace_sampled: bool,
    pub source_location: Option<SourceLocation>,
    pub http_request: Option<HttpRequest>,
}

/// Builds an application log entry. Pure; performs no I/O.
pub fn build(
    severity: Severity,
    payload: Payload,
    trace: &TraceContext,
    source_location: Option<SourceLocation>,
) -> LogEntry {
    LogEntry {
        timestamp: Utc::now(),
        severity,
        payload,
        trace_id: trace.trace_id.clone(),
        span_id: trace.span_id.clone(),
        trace_sampled: trace.sampled,
        source_location,
        http_request: None,
    }
}

/// Builds the access-log entry summarizing one request.
pub fn build_access(
    severity: Severity,
    trace: &TraceContext,
    http_request: HttpRequest,
) -> LogEntry {
    LogEntry {
        http_request: Some(http_request),
        ..build(severity, Payload::default(), trace, None)
    }
}

impl LogEntry {
    pub fn time(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    pub fn message(&self) -> Option<&str> {
        match &self.payload {
            Payload::Text(text) => Some(text),
            Payload::Structured(fields) => fields.get("message").and_then(Value::as_str),
        }
    }

    /// Renders the agent JSON object. Structured payload keys that collide
    /// with the reserved keys (other than `message`) are overwritten.
    pub fn to_value(&self) -> Result<Value> {
        let mut obj = match &self.payload {
            Payload::Text(text) => {
                let mut obj = Map::new();
                obj.insert("message".into(), Value::String(text.clone()));
                obj
            }
            Payload::Structured(fields) => fields.clone(),
        };
        obj.insert("severity".into(), serde_json::to_value(self.severity)?);
        obj.insert("time".into(), Value::String(self.time()));
        if !self.trace_id.is_empty() {
            obj.insert(TRACE_KEY.into(), Value::String(self.trace_id.clone()));
        }
        if !self.span_id.is_empty() {
            obj.insert(SPAN_ID_KEY.into(), Value::String(self.span_id.clone()));
        }
        if self.trace_sampled {
            obj.insert(TRACE_SAMPLED_KEY.into(), Value::Bool(true));
        }
        if let Some(location) = &self.source_location {
            obj.insert(SOURCE_LOCATION_KEY.into(), serde_json::to_value(location)?);
        }
        if let Some(req) = &self.http_request {
            obj.insert(
                HTTP_REQUEST_KEY.into(),
                serde_json::to_value(WireHttpRequest::from(req))?,
            );
        }
        Ok(Value::Object(obj))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.to_value()?)?)
    }

    /// Parses a line produced by [`LogEntry::to_json`].
    ///
    /// A missing `severity` reads as [`Severity::Default`] and a missing `time`
    /// as now. An object whose only non-reserved key is a string `message`
    /// reads back as a text payload.
    pub fn from_json(line: &str) -> Result<Self> {
        let mut obj = match serde_json::from_str::<Value>(line)? {
            Value::Object(obj) => obj,
            other => {
                return Err(Error::InvalidEntry(format!("expected object, got {other}")));
            }
        };

        let severity = match obj.remove("severity") {
            Some(v) => serde_json::from_value(v)?,
            None => Severity::Default,
        };
        let timestamp = match obj.remove("time") {
            Some(Value::String(s)) => DateTime::parse_from_rfc3339(&s)
                .map_err(|e| Error::InvalidEntry(format!("invalid time {s:?}: {e}")))?
                .with_timezone(&Utc),
            Some(other) => return Err(Error::InvalidEntry(format!("invalid time: {other}"))),
            None => Utc::now(),
        };
        let string_field = |obj: &mut Map<String, Value>, key: &str| match obj.remove(key) {
            Some(Value::String(s)) => Ok(s),
            None => Ok(String::new()),
            Some(other) => Err(Error::InvalidEntry(format!("invalid {key}: {other}"))),
        };
        let trace_id = string_field(&mut obj, TRACE_KEY)?;
        let span_id = string_field(&mut obj, SPAN_ID_KEY)?;
        let trace_sampled = match obj.remove(TRACE_SAMPLED_KEY) {
            Some(Value::Bool(b)) => b,
            None => false,
            Some(other) => {
                return Err(Error::InvalidEntry(format!("invalid trace_sampled: {other}")));
            }
        };
        let source_location = obj
            .remove(SOURCE_LOCATION_KEY)
            .map(serde_json::from_value)
            .transpose()?;
        let http_request = obj
            .remove(HTTP_REQUEST_KEY)
            .map(|v| -> Result<HttpRequest> {
                HttpRequest::try_from(serde_json::from_value::<WireHttpRequest>(v)?)
            })
            .transpose()?;

        let text_only = obj.len() == 1 && matches!(obj.get("message"), Some(Value::String(_)));
        let payload = if obj.is_empty() {
            Payload::default()
        } else if text_only {
            match obj.remove("message") {
                Some(Value::String(text)) => Payload::Text(text),
                _ => Payload::default(),
            }
        } else {
            Payload::Structured(obj)
        };

        Ok(Self {
            timestamp,
            severity,
            payload,
            trace_id,
            span_id,
            trace_sampled,
            source_location,
            http_request,
        })
    }
}

pub(crate) fn is_reserved_key(key: &str) -> bool {
    RESERVED_KEYS.contains(&key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> TraceContext {
        TraceContext {
            trace_id: "projects/p/traces/abc".into(),
            span_id: "42".into(),
            sampled: true,
        }
    }

    #[test]
    fn test_build_copies_trace() {
        let entry = build(Severity::Warning, "careful".into(), &ctx(), None);
        assert_eq!(entry.severity, Severity::Warning);
        assert_eq!(entry.trace_id, "projects/p/traces/abc");
        assert_eq!(entry.span_id, "42");
        assert!(entry.trace_sampled);
        assert_eq!(entry.message(), Some("careful"));
        assert!(entry.http_request.is_none());
    }

    #[test]
    fn test_agent_format() {
        let location = SourceLocation {
            file: "src/main.rs".into(),
            line: 101,
            function: "index".into(),
        };
        let entry = build(Severity::Critical, "hello log!!".into(), &ctx(), Some(location));
        let value: Value = serde_json::from_str(&entry.to_json().unwrap()).unwrap();
        assert_eq!(value["severity"], "CRITICAL");
        assert_eq!(value["message"], "hello log!!");
        assert_eq!(value[TRACE_KEY], "projects/p/traces/abc");
        assert_eq!(value[SPAN_ID_KEY], "42");
        assert_eq!(value[TRACE_SAMPLED_KEY], true);
        assert_eq!(
            value[SOURCE_LOCATION_KEY],
            json!({"file": "src/main.rs", "line": "101", "function": "index"})
        );
        assert!(value["time"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn test_uncorrelated_entry_omits_trace_keys() {
        let entry = build(Severity::Default, "plain".into(), &TraceContext::default(), None);
        let value = entry.to_value().unwrap();
        let obj = value.as_object().unwrap();
        assert_eq!(obj["severity"], "DEFAULT");
        assert!(!obj.contains_key(TRACE_KEY));
        assert!(!obj.contains_key(SPAN_ID_KEY));
        assert!(!obj.contains_key(TRACE_SAMPLED_KEY));
    }

    #[test]
    fn test_structured_payload_flattened() {
        let mut fields = Map::new();
        fields.insert("user".into(), json!("ada"));
        fields.insert("attempts".into(), json!(3));
        fields.insert("severity".into(), json!("bogus"));
        let entry = build(Severity::Info, fields.into(), &ctx(), None);
        let value = entry.to_value().unwrap();
        assert_eq!(value["user"], "ada");
        assert_eq!(value["attempts"], 3);
        assert_eq!(value["severity"], "INFO");
        assert!(value.get("message").is_none());
    }

    #[test]
    fn test_round_trip_text() {
        let entry = build(Severity::Error, "boom".into(), &ctx(), Some(SourceLocation::caller()));
        let parsed = LogEntry::from_json(&entry.to_json().unwrap()).unwrap();
        assert_eq!(parsed.severity, entry.severity);
        assert_eq!(parsed.payload, entry.payload);
        assert_eq!(parsed.trace_id, entry.trace_id);
        assert_eq!(parsed.span_id, entry.span_id);
        assert_eq!(parsed.source_location, entry.source_location);
    }

    #[test]
    fn test_round_trip_structured() {
        let mut fields = Map::new();
        fields.insert("message".into(), json!("with extras"));
        fields.insert("nested".into(), json!({"a": [1, 2]}));
        let entry = build(Severity::Debug, fields.into(), &TraceContext::default(), None);
        let parsed = LogEntry::from_json(&entry.to_json().unwrap()).unwrap();
        assert_eq!(parsed.severity, Severity::Debug);
        assert_eq!(parsed.payload, entry.payload);
        assert_eq!(parsed.trace_id, "");
    }

    #[test]
    fn test_round_trip_access_entry() {
        let req = HttpRequest {
            method: "GET".into(),
            url: "/hello".into(),
            status: 418,
            latency: Duration::from_millis(1500),
            request_size: None,
            response_size: Some(6),
            remote_ip: "203.0.113.9".into(),
            user_agent: Some("curl/8".into()),
        };
        let entry = build_access(Severity::Error, &ctx(), req.clone());
        let json = entry.to_json().unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value[HTTP_REQUEST_KEY]["latency"], "1.500000000s");
        assert_eq!(value[HTTP_REQUEST_KEY]["responseSize"], "6");
        assert_eq!(value[HTTP_REQUEST_KEY]["requestMethod"], "GET");

        let parsed = LogEntry::from_json(&json).unwrap();
        assert_eq!(parsed.http_request, Some(req));
        assert_eq!(parsed.severity, Severity::Error);
    }

    #[test]
    fn test_from_json_defaults() {
        let parsed = LogEntry::from_json(r#"{"message": "hi"}"#).unwrap();
        assert_eq!(parsed.severity, Severity::Default);
        assert_eq!(parsed.payload, Payload::Text("hi".into()));
        assert!(!parsed.trace_sampled);
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(LogEntry::from_json("[1, 2]").is_err());
        assert!(LogEntry::from_json(r#"{"severity": "LOUD"}"#).is_err());
        assert!(LogEntry::from_json(r#"{"time": "yesterday"}"#).is_err());
        assert!(LogEntry::from_json("not json").is_err());
    }

    #[test]
    fn test_latency_format() {
        assert_eq!(format_latency(Duration::from_micros(2500)), "0.002500000s");
        assert_eq!(parse_latency("0.0025s").unwrap(), Duration::from_micros(2500));
        assert_eq!(parse_latency("3s").unwrap(), Duration::from_secs(3));
        assert!(parse_latency("3").is_err());
        assert!(parse_latency("0.1234567891s").is_err());
    }

    #[test]
    fn test_caller_location() {
        let location = SourceLocation::caller();
        assert!(location.file.ends_with("entry.rs"));
        assert_eq!(location.line, line!() - 2);
    }
}
