use std::collections::{BTreeMap, HashMap};

pub const TRACEPARENT_HEADER: &str = "traceparent";
pub const CLOUD_TRACE_HEADER: &str = "x-cloud-trace-context";

/// Case-insensitive access to a request's headers.
pub trait HeaderSource {
    fn header(&self, name: &str) -> Option<&str>;
}

impl<K: AsRef<str>, V: AsRef<str>> HeaderSource for [(K, V)] {
    fn header(&self, name: &str) -> Option<&str> {
        self.iter()
            .find(|(k, _)| k.as_ref().eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_ref())
    }
}

impl<K: AsRef<str>, V: AsRef<str>> HeaderSource for Vec<(K, V)> {
    fn header(&self, name: &str) -> Option<&str> {
        self.as_slice().header(name)
    }
}

impl<V: AsRef<str>> HeaderSource for HashMap<String, V> {
    fn header(&self, name: &str) -> Option<&str> {
        self.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_ref())
    }
}

impl<V: AsRef<str>> HeaderSource for BTreeMap<String, V> {
    fn header(&self, name: &str) -> Option<&str> {
        self.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_ref())
    }
}

/// Trace correlation for one request. Empty ids mean the request carried no
/// usable trace header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
    pub sampled: bool,
}

impl TraceContext {
    pub fn is_empty(&self) -> bool {
        self.trace_id.is_empty()
    }
}

/// Derives a [`TraceContext`] from request headers.
///
/// `traceparent` wins over `X-Cloud-Trace-Context` when both parse. A header
/// that fails to parse is ignored; if nothing parses the context is empty.
#[derive(Debug, Clone, Default)]
pub struct TraceExtractor {
    project_id: Option<String>,
}

impl TraceExtractor {
    /// With a non-empty `project_id`, trace ids are rendered as
    /// `projects/<project_id>/traces/<trace_id>`.
    pub fn new(project_id: Option<String>) -> Self {
        Self {
            project_id: project_id.filter(|p| !p.is_empty()),
        }
    }

    pub fn project_id(&self) -> Option<&str> {
        self.project_id.as_deref()
    }

    pub fn extract<H: HeaderSource + ?Sized>(&self, headers: &H) -> TraceContext {
        let parsed = headers
            .header(TRACEPARENT_HEADER)
            .and_then(parse_traceparent)
            .or_else(|| {
                headers
                    .header(CLOUD_TRACE_HEADER)
                    .and_then(parse_cloud_trace_context)
            });
        let Some(mut ctx) = parsed else {
            return TraceContext::default();
        };
        if let Some(project_id) = &self.project_id {
            ctx.trace_id = format!("projects/{project_id}/traces/{}", ctx.trace_id);
        }
        ctx
    }
}

fn is_hex_id(s: &str, len: usize) -> bool {
    s.len() == len
        && s.bytes().all(|b| b.is_ascii_hexdigit())
        && s.bytes().any(|b| b != b'0')
}

/// `VV-TTTTTTTTTTTTTTTTTTTTTTTTTTTTTTTT-SSSSSSSSSSSSSSSS-FF`
pub fn parse_traceparent(value: &str) -> Option<TraceContext> {
    let mut parts = value.trim().split('-');
    let version = parts.next()?;
    let trace_id = parts.next()?;
    let span_id = parts.next()?;
    let flags = parts.next()?;
    if version.len() != 2 || !version.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    if version.eq_ignore_ascii_case("ff") {
        return None;
    }
    // Version 00 has exactly four fields; later versions may append more.
    if version == "00" && parts.next().is_some() {
        return None;
    }
    if !is_hex_id(trace_id, 32) || !is_hex_id(span_id, 16) || flags.len() != 2 {
        return None;
    }
    let flags = u8::from_str_radix(flags, 16).ok()?;
    Some(TraceContext {
        trace_id: trace_id.to_ascii_lowercase(),
        span_id: span_id.to_ascii_lowercase(),
        sampled: flags & 1 == 1,
    })
}

/// `TRACE_ID/SPAN_ID;o=OPTIONS`, where SPAN_ID is decimal and `;o=` is optional.
/// The trace id is returned in lowercase.
pub fn parse_cloud_trace_context(value: &str) -> Option<TraceContext> {
    let (trace_id, rest) = value.trim().split_once('/')?;
    if !is_hex_id(trace_id, 32) {
        return None;
    }
    let (span, options) = match rest.split_once(';') {
        Some((span, options)) => (span, Some(options)),
        None => (rest, None),
    };
    let span_id: u64 = span.parse().ok()?;
    // Only `o=` is understood; any other option leaves the trace unsampled.
    let sampled = match options.and_then(|options| options.strip_prefix("o=")) {
        Some(o) => o.parse::<u64>().ok()? & 1 == 1,
        None => false,
    };
    Some(TraceContext {
        trace_id: trace_id.to_ascii_lowercase(),
        span_id: span_id.to_string(),
        sampled,
    })
}
