//! Lookups against the GCE metadata server.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::env;
use std::time::Duration;

const DEFAULT_HOST: &str = "169.254.169.254";
const TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
pub struct AccessToken {
    pub access_token: String,
    pub expires_in: u64,
    #[serde(default)]
    pub token_type: String,
}

/// Client for `http://<host>/computeMetadata/v1/...`.
#[derive(Debug, Clone)]
pub struct MetadataClient {
    host: String,
    agent: ureq::Agent,
}

impl MetadataClient {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            agent: ureq::AgentBuilder::new().timeout(TIMEOUT).build(),
        }
    }

    /// Uses `GCE_METADATA_HOST` when set, else the link-local address.
    pub fn from_env() -> Self {
        Self::new(env::var("GCE_METADATA_HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string()))
    }

    fn get(&self, path: &str) -> Result<String> {
        let url = format!("http://{}/computeMetadata/v1/{path}", self.host);
        let response = self
            .agent
            .get(&url)
            .set("Metadata-Flavor", "Google")
            .call()?;
        Ok(response.into_string()?.trim().to_string())
    }

    pub fn project_id(&self) -> Result<String> {
        self.get("project/project-id")
    }

    /// The instance zone, e.g. `us-central1-a`. The server answers with
    /// `projects/<number>/zones/<zone>`; only the last segment is kept.
    pub fn zone(&self) -> Result<String> {
        let zone = self.get("instance/zone")?;
        Ok(zone.rsplit('/').next().unwrap_or_default().to_string())
    }

    pub fn access_token(&self) -> Result<AccessToken> {
        let body = self.get("instance/service-accounts/default/token")?;
        let token: AccessToken = serde_json::from_str(&body)?;
        if token.access_token.is_empty() {
            return Err(Error::InvalidConfig(
                "metadata server returned an empty access token".into(),
            ));
        }
        Ok(token)
    }
}

/// Fetch the GCP project ID from the metadata service.
///
/// The metadata host can be overridden via the GCE_METADATA_HOST environment variable.
pub fn fetch_project_id() -> Result<String> {
    MetadataClient::from_env().project_id()
}

/// Fetch the instance zone from the metadata service.
pub fn fetch_zone() -> Result<String> {
    MetadataClient::from_env().zone()
}
