use crate::error::{Error, Result};
use crate::metadata::MetadataClient;
use crate::severity::Severity;
use crate::sink::{SinkConfig, SinkWriter};
use crate::trace::TraceExtractor;
use crate::transport::{CloudLoggingTransport, Credentials, Resource, WriterTransport};
use crate::{Pipeline, INTERNAL_TARGET};
use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use tracing_subscriber::filter::LevelFilter;

const DEFAULT_SERVICE: &str = "default";

/// Where entries are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Output {
    Stdout,
    /// JSON lines on stderr, picked up by the Cloud Run / App Engine agent.
    #[default]
    Stderr,
    /// Directly to the Cloud Logging API.
    CloudLogging,
}

impl FromStr for Output {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stdout" => Ok(Output::Stdout),
            "stderr" => Ok(Output::Stderr),
            "cloud" | "cloud_logging" | "api" => Ok(Output::CloudLogging),
            _ => Err(Error::InvalidConfig(format!("unknown log output: {s}"))),
        }
    }
}

/// Configuration for the GCP structured logging pipeline.
#[derive(Debug, Clone)]
pub struct Config {
    /// Your GCP project ID used to construct the full trace path.
    /// If None, will attempt to fetch from the GCP metadata service.
    pub gcp_project_id: Option<String>,
    /// The minimum severity to emit (defaults to INFO if not specified)
    pub min_severity: Option<Severity>,
    /// Service (App Engine module) name; log names are derived from it.
    pub service: Option<String>,
    pub version: Option<String>,
    /// If None and writing to the Cloud Logging API, fetched from the metadata service.
    pub zone: Option<String>,
    pub output: Output,
    /// Overrides the `entries:write` URL, e.g. for an emulator.
    pub endpoint: Option<String>,
    pub sink: SinkConfig,
}

impl Config {
    /// Create a new config that will auto-detect the GCP project ID from the metadata service.
    /// The log level will default to INFO.
    pub fn new() -> Self {
        Self {
            gcp_project_id: None,
            min_severity: None,
            service: None,
            version: None,
            zone: None,
            output: Output::default(),
            endpoint: None,
            sink: SinkConfig::default(),
        }
    }

    /// Create a new config with the specified GCP project ID.
    /// The log level will default to INFO.
    pub fn with_project_id(gcp_project_id: impl Into<String>) -> Self {
        Self {
            gcp_project_id: Some(gcp_project_id.into()),
            ..Self::new()
        }
    }

    /// Reads `GOOGLE_CLOUD_PROJECT`, `GAE_SERVICE` (or `K_SERVICE`),
    /// `GAE_VERSION` (or `K_REVISION`), `LOG_LEVEL` and `LOG_OUTPUT`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |keys: &[&str]| {
            keys.iter()
                .find_map(|key| lookup(key))
                .filter(|v| !v.is_empty())
        };
        let mut config = Self::new();
        config.gcp_project_id = get(&["GOOGLE_CLOUD_PROJECT"]);
        config.service = get(&["GAE_SERVICE", "K_SERVICE"]);
        config.version = get(&["GAE_VERSION", "K_REVISION"]);
        if let Some(level) = get(&["LOG_LEVEL"]) {
            config.min_severity = Some(level.parse()?);
        }
        if let Some(output) = get(&["LOG_OUTPUT"]) {
            config.output = output.parse()?;
        }
        Ok(config)
    }

    /// Set the log level filter.
    pub fn with_level(mut self, level: LevelFilter) -> Self {
        self.min_severity = Some(level.into());
        self
    }

    pub fn with_min_severity(mut self, severity: Severity) -> Self {
        self.min_severity = Some(severity);
        self
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = Some(zone.into());
        self
    }

    pub fn with_output(mut self, output: Output) -> Self {
        self.output = output;
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.sink.batch_size = batch_size;
        self
    }

    /// Raised to [`MIN_FLUSH_INTERVAL`](crate::MIN_FLUSH_INTERVAL) if shorter.
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.sink.flush_interval = interval;
        self
    }

    pub fn with_flush_timeout(mut self, timeout: Duration) -> Self {
        self.sink.flush_timeout = timeout;
        self
    }

    pub fn min_severity(&self) -> Severity {
        self.min_severity.unwrap_or(Severity::Info)
    }

    pub fn service(&self) -> &str {
        self.service.as_deref().unwrap_or(DEFAULT_SERVICE)
    }

    pub fn request_log_id(&self) -> String {
        format!("{}_request", self.service())
    }

    pub fn application_log_id(&self) -> String {
        format!("{}_application", self.service())
    }

    /// Resolves missing values from the metadata service and creates the
    /// request and application sinks.
    pub fn build(self) -> Result<Pipeline> {
        let metadata = MetadataClient::from_env();
        self.build_with(&metadata)
    }

    pub(crate) fn build_with(self, metadata: &MetadataClient) -> Result<Pipeline> {
        let project_id = match self.gcp_project_id.clone().filter(|p| !p.is_empty()) {
            Some(project_id) => Some(project_id),
            None => match metadata.project_id() {
                Ok(project_id) => Some(project_id),
                Err(err) => {
                    debug!(target: INTERNAL_TARGET, error = %err, "could not fetch project id from metadata service");
                    None
                }
            },
        };

        let (app_sink, request_sink) = match self.output {
            Output::Stdout | Output::Stderr => {
                let writer = || match self.output {
                    Output::Stdout => WriterTransport::stdout(),
                    _ => WriterTransport::stderr(),
                };
                let sink = Arc::new(SinkWriter::new(writer(), self.sink.clone()));
                (sink.clone(), sink)
            }
            Output::CloudLogging => {
                let project_id = project_id.as_deref().ok_or_else(|| {
                    Error::InvalidConfig("a project id is required to write to Cloud Logging".into())
                })?;
                let zone = match &self.zone {
                    Some(zone) => zone.clone(),
                    None => metadata.zone().unwrap_or_else(|err| {
                        debug!(target: INTERNAL_TARGET, error = %err, "could not fetch zone from metadata service");
                        String::new()
                    }),
                };
                let resource = Resource::gae_app(
                    self.service(),
                    project_id,
                    self.version.as_deref().unwrap_or_default(),
                    &zone,
                );
                let transport = |log_id: String| {
                    let transport = CloudLoggingTransport::new(
                        project_id,
                        &log_id,
                        resource.clone(),
                        Credentials::MetadataServer(metadata.clone()),
                    );
                    match &self.endpoint {
                        Some(endpoint) => transport.with_endpoint(endpoint.clone()),
                        None => transport,
                    }
                };
                let app = SinkWriter::new(transport(self.application_log_id()), self.sink.clone());
                let request = SinkWriter::new(transport(self.request_log_id()), self.sink.clone());
                (Arc::new(app), Arc::new(request))
            }
        };

        Ok(Pipeline {
            extractor: TraceExtractor::new(project_id.clone()),
            project_id,
            min_severity: self.min_severity(),
            app_sink,
            request_sink,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_config_defaults() {
        let config = Config::new();
        assert_eq!(config.min_severity(), Severity::Info);
        assert_eq!(config.output, Output::Stderr);
        assert_eq!(config.service(), "default");
        assert_eq!(config.request_log_id(), "default_request");
        assert_eq!(config.application_log_id(), "default_application");
    }

    #[test]
    fn test_builder() {
        let config = Config::with_project_id("my-project-123")
            .with_level(LevelFilter::DEBUG)
            .with_service("frontend")
            .with_batch_size(3)
            .with_flush_interval(Duration::from_millis(10));
        assert_eq!(config.gcp_project_id.as_deref(), Some("my-project-123"));
        assert_eq!(config.min_severity(), Severity::Debug);
        assert_eq!(config.request_log_id(), "frontend_request");
        assert_eq!(config.sink.batch_size, 3);
    }

    #[test]
    fn test_from_env() {
        let config = Config::from_lookup(lookup(&[
            ("GOOGLE_CLOUD_PROJECT", "proj"),
            ("K_SERVICE", "api"),
            ("GAE_VERSION", "20240101t000000"),
            ("LOG_LEVEL", "warn"),
            ("LOG_OUTPUT", "stdout"),
        ]))
        .unwrap();
        assert_eq!(config.gcp_project_id.as_deref(), Some("proj"));
        assert_eq!(config.service(), "api");
        assert_eq!(config.version.as_deref(), Some("20240101t000000"));
        assert_eq!(config.min_severity(), Severity::Warning);
        assert_eq!(config.output, Output::Stdout);
    }

    #[test]
    fn test_from_env_prefers_gae_names() {
        let config =
            Config::from_lookup(lookup(&[("GAE_SERVICE", "gae"), ("K_SERVICE", "run")])).unwrap();
        assert_eq!(config.service(), "gae");
    }

    #[test]
    fn test_from_env_rejects_bad_values() {
        assert!(Config::from_lookup(lookup(&[("LOG_LEVEL", "loud")])).is_err());
        assert!(Config::from_lookup(lookup(&[("LOG_OUTPUT", "syslog")])).is_err());
    }

    #[test]
    fn test_build_stdout_shares_one_sink() {
        let pipeline = Config::with_project_id("p")
            .with_output(Output::Stdout)
            .build()
            .unwrap();
        assert!(Arc::ptr_eq(pipeline.app_sink(), pipeline.request_sink()));
        assert_eq!(pipeline.project_id(), Some("p"));
    }

    #[test]
    fn test_output_from_str() {
        assert_eq!("STDOUT".parse::<Output>().unwrap(), Output::Stdout);
        assert_eq!("cloud".parse::<Output>().unwrap(), Output::CloudLogging);
        assert!("file".parse::<Output>().is_err());
    }
}
