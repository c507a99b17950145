//! OAuth2 token-endpoint exchange
//!
//! Two grant flows against the same endpoint:
//! 1. JWT-bearer assertion exchange (service accounts)
//! 2. Refresh-token grant (authorized users)
//!
//! Both POST form-encoded to the key's `token_uri` and parse
//! `{access_token, expires_in}` on success. `expires_in` is a delta in
//! seconds from the response time; the token cache converts it to an
//! absolute expiry when storing.

use serde::Deserialize;
use tracing::warn;

use crate::constants::{DEFAULT_EXPIRES_IN_SECS, JWT_BEARER_GRANT};
use crate::credentials::AuthorizedUserKey;
use crate::error::{Error, Result};

/// Raw response from the token endpoint for both grant flows.
///
/// Some endpoints omit `expires_in`; [`TokenGrant`] fills the default.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    /// Seconds until the access token expires (delta, not absolute)
    pub expires_in: Option<u64>,
}

/// A usable access token plus its lifetime in seconds.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: String,
    pub expires_in: u64,
}

impl From<TokenResponse> for TokenGrant {
    fn from(response: TokenResponse) -> Self {
        let expires_in = match response.expires_in {
            Some(secs) => secs,
            None => {
                warn!(
                    assumed = DEFAULT_EXPIRES_IN_SECS,
                    "token endpoint omitted expires_in, assuming default lifetime"
                );
                DEFAULT_EXPIRES_IN_SECS
            }
        };
        Self {
            access_token: response.access_token,
            expires_in,
        }
    }
}

/// Exchange a signed service-account assertion for an access token.
pub async fn exchange_jwt_bearer(
    client: &reqwest::Client,
    token_uri: &str,
    assertion: &str,
) -> Result<TokenGrant> {
    let response = client
        .post(token_uri)
        .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion)])
        .send()
        .await
        .map_err(|e| Error::Http(format!("assertion exchange request failed: {e}")))?;

    read_grant(response, "assertion exchange").await
}

/// Redeem a long-lived refresh token for a fresh access token.
pub async fn refresh_user_token(
    client: &reqwest::Client,
    token_uri: &str,
    key: &AuthorizedUserKey,
) -> Result<TokenGrant> {
    let response = client
        .post(token_uri)
        .form(&[
            ("grant_type", "refresh_token"),
            ("client_id", key.client_id.as_str()),
            ("client_secret", key.client_secret.expose().as_str()),
            ("refresh_token", key.refresh_token.expose().as_str()),
        ])
        .send()
        .await
        .map_err(|e| Error::Http(format!("token refresh request failed: {e}")))?;

    read_grant(response, "token refresh").await
}

async fn read_grant(response: reqwest::Response, operation: &str) -> Result<TokenGrant> {
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));
        return Err(Error::TokenExchange {
            status: status.as_u16(),
            message: format!("{operation} returned {status}: {body}"),
        });
    }

    response
        .json::<TokenResponse>()
        .await
        .map(TokenGrant::from)
        .map_err(|e| Error::TokenExchange {
            status: status.as_u16(),
            message: format!("invalid {operation} response: {e}"),
        })
}
