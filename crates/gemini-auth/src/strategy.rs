//! Header production and token refresh per credential variant
//!
//! One `Authenticator` is built from the resolved credentials and shared by
//! every dispatcher. API keys turn into a static header; the token-backed
//! variants read the shared cache and fall into a single-flight derivation
//! on miss, so a cold key costs one exchange no matter how many callers
//! race on it.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use sha2::{Digest, Sha256};
use tracing::debug;

use common::unix_now_secs;

use crate::cache::TokenCache;
use crate::constants::{
    API_KEY_HEADER, CLOUD_PLATFORM_SCOPE, DEFAULT_TOKEN_URI, QUOTA_PROJECT_HEADER,
};
use crate::credentials::Credentials;
use crate::error::{Error, Result};
use crate::jwt;
use crate::metadata::MetadataClient;
use crate::resolver::{CredentialResolver, ResolverConfig};
use crate::singleflight::FlightTable;
use crate::token::{self, TokenGrant};

/// Produces outbound auth headers for one resolved credential source and
/// owns that source's refresh behavior.
pub struct Authenticator {
    credentials: Credentials,
    scopes: Vec<String>,
    quota_project: Option<String>,
    /// Endpoint for the refresh-token grant; key files carry their own
    /// `token_uri` for the assertion flow
    user_token_uri: String,
    cache: Arc<TokenCache>,
    flights: FlightTable,
    http: reqwest::Client,
    metadata: MetadataClient,
    cache_key: String,
}

impl Authenticator {
    /// Authenticator with the default cloud-platform scope.
    pub fn new(credentials: Credentials, cache: Arc<TokenCache>) -> Self {
        Self::with_scopes(credentials, vec![CLOUD_PLATFORM_SCOPE.to_string()], cache)
    }

    /// Authenticator requesting a specific scope set.
    pub fn with_scopes(
        credentials: Credentials,
        scopes: Vec<String>,
        cache: Arc<TokenCache>,
    ) -> Self {
        // An authorized-user key names its own billing project; an explicit
        // `with_quota_project` still overrides it.
        let quota_project = match &credentials {
            Credentials::UserOAuth2(key) => key.quota_project_id.clone(),
            _ => None,
        };
        let cache_key = derive_cache_key(&credentials, &scopes);

        Self {
            credentials,
            scopes,
            quota_project,
            user_token_uri: DEFAULT_TOKEN_URI.to_string(),
            cache,
            flights: FlightTable::new(),
            http: reqwest::Client::new(),
            metadata: MetadataClient::new(),
            cache_key,
        }
    }

    /// Authenticator over already-resolved credentials, honoring the
    /// resolver snapshot's quota-project override. The env override wins
    /// over a key file's own quota project.
    pub fn from_resolved(
        config: &ResolverConfig,
        credentials: Credentials,
        cache: Arc<TokenCache>,
    ) -> Self {
        let auth = Self::new(credentials, cache);
        match &config.quota_project {
            Some(project) => auth.with_quota_project(project.clone()),
            None => auth,
        }
    }

    /// Run credential discovery over the process environment and build an
    /// authenticator over whatever it finds.
    pub async fn from_env(cache: Arc<TokenCache>) -> Result<Self> {
        let resolver = CredentialResolver::from_env();
        let credentials = resolver.resolve().await?;
        Ok(Self::from_resolved(resolver.config(), credentials, cache))
    }

    /// Bill quota to `project` via `x-goog-user-project`.
    pub fn with_quota_project(mut self, project: impl Into<String>) -> Self {
        self.quota_project = Some(project.into());
        self
    }

    /// Override the refresh-token grant endpoint (tests).
    pub fn with_token_uri(mut self, token_uri: impl Into<String>) -> Self {
        self.user_token_uri = token_uri.into();
        self
    }

    /// Use a specific metadata client (tests, or a custom base URL).
    pub fn with_metadata_client(mut self, metadata: MetadataClient) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Auth headers for one outbound request.
    ///
    /// Never falls back to an unauthenticated call: any derivation problem
    /// is the caller's error to handle.
    pub async fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();

        match &self.credentials {
            Credentials::ApiKey { key } => {
                if key.expose().trim().is_empty() {
                    return Err(Error::MalformedCredentials("API key is empty".to_string()));
                }
                let mut value = header_value(key.expose())?;
                value.set_sensitive(true);
                headers.insert(HeaderName::from_static(API_KEY_HEADER), value);
            }
            _ => {
                let token = self.bearer_token().await?;
                let mut value = header_value(&format!("Bearer {token}"))?;
                value.set_sensitive(true);
                headers.insert(AUTHORIZATION, value);
            }
        }

        if let Some(project) = &self.quota_project {
            headers.insert(
                HeaderName::from_static(QUOTA_PROJECT_HEADER),
                header_value(project)?,
            );
        }

        Ok(headers)
    }

    /// Drop the cached token and derive a new one. Called when the API
    /// rejects a request with 401: the cached token may be revoked even
    /// though its expiry has not passed. A no-op for API keys.
    pub async fn refresh(&self) -> Result<()> {
        if matches!(self.credentials, Credentials::ApiKey { .. }) {
            debug!("API key credentials have nothing to refresh");
            return Ok(());
        }
        self.cache.invalidate(&self.cache_key);
        self.flights
            .run(
                &self.cache_key,
                || self.cache.get(&self.cache_key),
                || self.derive_and_cache(),
            )
            .await
            .map(|_| ())
    }

    /// Derive and cache a token if none is currently valid. Returns whether
    /// a derivation ran. Used by the background refresh task; API keys
    /// always report `false`.
    pub async fn ensure_token(&self) -> Result<bool> {
        if matches!(self.credentials, Credentials::ApiKey { .. }) {
            return Ok(false);
        }
        if self.cache.get(&self.cache_key).is_some() {
            return Ok(false);
        }
        self.flights
            .run(
                &self.cache_key,
                || self.cache.get(&self.cache_key),
                || self.derive_and_cache(),
            )
            .await
            .map(|_| true)
    }

    /// Project the credentials belong to, when discoverable. Metadata
    /// credentials ask the metadata server lazily.
    pub async fn project_id(&self) -> Option<String> {
        match &self.credentials {
            Credentials::ApiKey { .. } => None,
            Credentials::ServiceAccount(key) => key.project_id.clone(),
            Credentials::UserOAuth2(key) => key.quota_project_id.clone(),
            Credentials::MetadataServer { project_id } => match project_id {
                Some(id) => Some(id.clone()),
                None => self.metadata.fetch_project_id().await.ok(),
            },
        }
    }

    async fn bearer_token(&self) -> Result<String> {
        if let Some(token) = self.cache.get(&self.cache_key) {
            return Ok(token);
        }
        self.flights
            .run(
                &self.cache_key,
                || self.cache.get(&self.cache_key),
                || self.derive_and_cache(),
            )
            .await
    }

    async fn derive_and_cache(&self) -> Result<String> {
        let grant = self.derive_token().await?;
        debug!(
            source = self.credentials.source(),
            expires_in = grant.expires_in,
            "derived fresh access token"
        );
        self.cache
            .put(&self.cache_key, grant.access_token.clone(), grant.expires_in);
        Ok(grant.access_token)
    }

    /// One network derivation, variant-dispatched.
    async fn derive_token(&self) -> Result<TokenGrant> {
        match &self.credentials {
            Credentials::ApiKey { .. } => Err(Error::MalformedCredentials(
                "API keys do not produce bearer tokens".to_string(),
            )),
            Credentials::ServiceAccount(key) => {
                let assertion =
                    jwt::sign_assertion(key, &self.scopes, &key.token_uri, unix_now_secs())?;
                token::exchange_jwt_bearer(&self.http, &key.token_uri, &assertion).await
            }
            Credentials::UserOAuth2(key) => {
                token::refresh_user_token(&self.http, &self.user_token_uri, key).await
            }
            Credentials::MetadataServer { .. } => self.metadata.fetch_token().await,
        }
    }
}

/// Cache keys bind the credential identity to the sorted scope set, so two
/// authenticators share a token only when both match.
fn derive_cache_key(credentials: &Credentials, scopes: &[String]) -> String {
    let mut sorted = scopes.to_vec();
    sorted.sort();

    let mut hasher = Sha256::new();
    hasher.update(credentials.identity().as_bytes());
    hasher.update([0u8]);
    hasher.update(sorted.join(" ").as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| Error::MalformedCredentials(format!("header value rejected: {e}")))
}
