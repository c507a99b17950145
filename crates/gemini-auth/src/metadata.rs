//! Instance metadata-server client
//!
//! Inside GCP the metadata server hands out access tokens and project
//! identity with no key material at all. Reachability is decided by a short
//! probe: connection refused or a timeout means "not running on this
//! cloud", which is an answer, not an error. Real requests use a longer
//! timeout, and an HTTP error status from an actual response does surface
//! as an error.

use tracing::debug;

use crate::constants::{
    METADATA_BASE_URL, METADATA_FLAVOR_HEADER, METADATA_FLAVOR_VALUE, METADATA_PROBE_TIMEOUT,
    METADATA_PROJECT_PATH, METADATA_REQUEST_TIMEOUT, METADATA_TOKEN_PATH,
};
use crate::error::{Error, Result};
use crate::token::{TokenGrant, TokenResponse};

/// Client for the instance metadata endpoint.
#[derive(Debug, Clone)]
pub struct MetadataClient {
    client: reqwest::Client,
    base_url: String,
}

impl Default for MetadataClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataClient {
    /// Client against the standard metadata host.
    pub fn new() -> Self {
        Self::with_base_url(METADATA_BASE_URL)
    }

    /// Client against an alternate host; tests point this at a local server.
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        let base: String = base_url.into();
        Self {
            client: reqwest::Client::new(),
            base_url: base.trim_end_matches('/').to_string(),
        }
    }

    /// Fast reachability probe, never retried. Any HTTP response means the
    /// server exists; connect errors and timeouts mean it does not.
    pub async fn available(&self) -> bool {
        let result = self
            .client
            .get(&self.base_url)
            .header(METADATA_FLAVOR_HEADER, METADATA_FLAVOR_VALUE)
            .timeout(METADATA_PROBE_TIMEOUT)
            .send()
            .await;

        match result {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "metadata server not reachable");
                false
            }
        }
    }

    /// Fetch an access token for the instance's default service account.
    pub async fn fetch_token(&self) -> Result<TokenGrant> {
        let url = format!("{}{}", self.base_url, METADATA_TOKEN_PATH);
        let response = self.get(&url).await?;
        response
            .json::<TokenResponse>()
            .await
            .map(TokenGrant::from)
            .map_err(|e| Error::Metadata(format!("invalid token payload: {e}")))
    }

    /// Fetch the project id of the surrounding instance.
    pub async fn fetch_project_id(&self) -> Result<String> {
        let url = format!("{}{}", self.base_url, METADATA_PROJECT_PATH);
        let response = self.get(&url).await?;
        response
            .text()
            .await
            .map_err(|e| Error::Metadata(format!("invalid project-id payload: {e}")))
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response> {
        let response = self
            .client
            .get(url)
            .header(METADATA_FLAVOR_HEADER, METADATA_FLAVOR_VALUE)
            .timeout(METADATA_REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| Error::Http(format!("metadata request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Metadata(format!(
                "metadata server returned {status} for {url}"
            )));
        }
        Ok(response)
    }
}
