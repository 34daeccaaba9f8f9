use super::Transport;
use crate::entry::{LogEntry, Payload, SourceLocation, WireHttpRequest};
use crate::error::{Error, Result};
use crate::metadata::MetadataClient;
use crate::severity::Severity;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

pub const DEFAULT_ENDPOINT: &str = "https://logging.googleapis.com/v2/entries:write";

const TIMEOUT: Duration = Duration::from_secs(10);
// Refresh tokens a little before the metadata server says they expire.
const TOKEN_SLACK: Duration = Duration::from_secs(60);

/// The monitored resource every entry is attributed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resource {
    #[serde(rename = "type")]
    pub kind: String,
    pub labels: BTreeMap<String, String>,
}

impl Resource {
    pub fn global(project_id: &str) -> Self {
        Self {
            kind: "global".into(),
            labels: BTreeMap::from([("project_id".to_string(), project_id.to_string())]),
        }
    }

    /// An App Engine resource labelled with module, project, version and zone.
    pub fn gae_app(module_id: &str, project_id: &str, version_id: &str, zone: &str) -> Self {
        let labels = [
            ("module_id", module_id),
            ("project_id", project_id),
            ("version_id", version_id),
            ("zone", zone),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        Self {
            kind: "gae_app".into(),
            labels,
        }
    }
}

pub enum Credentials {
    /// No `Authorization` header; for emulators and local testing.
    None,
    Static(String),
    /// Default service account token from the metadata server, cached until
    /// shortly before it expires.
    MetadataServer(MetadataClient),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WriteRequest<'a> {
    log_name: &'a str,
    resource: &'a Resource,
    entries: Vec<ApiEntry<'a>>,
    partial_success: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ApiEntry<'a> {
    timestamp: String,
    severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    text_payload: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    json_payload: Option<&'a Map<String, Value>>,
    #[serde(skip_serializing_if = "str::is_empty")]
    trace: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    span_id: &'a str,
    trace_sampled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    source_location: Option<&'a SourceLocation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    http_request: Option<WireHttpRequest>,
}

impl<'a> From<&'a LogEntry> for ApiEntry<'a> {
    fn from(entry: &'a LogEntry) -> Self {
        let (text_payload, json_payload) = match &entry.payload {
            // Access-log entries carry no payload at all.
            Payload::Text(text) if text.is_empty() && entry.http_request.is_some() => (None, None),
            Payload::Text(text) => (Some(text.as_str()), None),
            Payload::Structured(fields) => (None, Some(fields)),
        };
        Self {
            timestamp: entry.time(),
            severity: entry.severity,
            text_payload,
            json_payload,
            trace: &entry.trace_id,
            span_id: &entry.span_id,
            trace_sampled: entry.trace_sampled,
            source_location: entry.source_location.as_ref(),
            http_request: entry.http_request.as_ref().map(WireHttpRequest::from),
        }
    }
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// Writes batches through the Cloud Logging `entries:write` REST method.
pub struct CloudLoggingTransport {
    agent: ureq::Agent,
    endpoint: String,
    log_name: String,
    resource: Resource,
    credentials: Credentials,
    token: Mutex<Option<CachedToken>>,
}

impl CloudLoggingTransport {
    /// `log_id` is the short name, e.g. `default_request`; it is expanded to
    /// `projects/<project_id>/logs/<log_id>`.
    pub fn new(project_id: &str, log_id: &str, resource: Resource, credentials: Credentials) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(TIMEOUT).build(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            log_name: format!("projects/{project_id}/logs/{}", log_id.replace('/', "%2F")),
            resource,
            credentials,
            token: Mutex::new(None),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn log_name(&self) -> &str {
        &self.log_name
    }

    fn bearer_token(&self) -> Result<Option<String>> {
        let client = match &self.credentials {
            Credentials::None => return Ok(None),
            Credentials::Static(token) => return Ok(Some(token.clone())),
            Credentials::MetadataServer(client) => client,
        };
        let mut cached = self.token.lock();
        if let Some(token) = cached.as_ref().filter(|t| t.expires_at > Instant::now()) {
            return Ok(Some(token.token.clone()));
        }
        let fresh = client.access_token()?;
        let lifetime = Duration::from_secs(fresh.expires_in).saturating_sub(TOKEN_SLACK);
        *cached = Some(CachedToken {
            token: fresh.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Ok(Some(fresh.access_token))
    }

    fn body(&self, entries: &[LogEntry]) -> Result<String> {
        let request = WriteRequest {
            log_name: &self.log_name,
            resource: &self.resource,
            entries: entries.iter().map(ApiEntry::from).collect(),
            partial_success: true,
        };
        Ok(serde_json::to_string(&request)?)
    }
}

impl Transport for CloudLoggingTransport {
    fn deliver(&self, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let body = self.body(entries)?;
        let mut request = self
            .agent
            .post(&self.endpoint)
            .set("Content-Type", "application/json");
        if let Some(token) = self.bearer_token()? {
            request = request.set("Authorization", &format!("Bearer {token}"));
        }
        match request.send_string(&body) {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(code, response)) => Err(Error::Transport {
                count: entries.len(),
                message: format!(
                    "status {code}: {}",
                    response.into_string().unwrap_or_default()
                ),
            }),
            Err(err) => Err(err.into()),
        }
    }
}
