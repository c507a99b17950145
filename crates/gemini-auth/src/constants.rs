//! Google OAuth and metadata-server constants
//!
//! Endpoint, header, and environment names from Google's published
//! authentication contract. None of these are secrets; the secrets (API
//! keys, private keys, refresh tokens) live in resolved credentials and
//! the token cache.

use std::time::Duration;

/// Environment variable holding a static Gemini API key
pub const API_KEY_ENV: &str = "GEMINI_API_KEY";

/// Environment variable holding inline credential JSON (containerized secrets)
pub const CREDENTIALS_JSON_ENV: &str = "GOOGLE_APPLICATION_CREDENTIALS_JSON";

/// Environment variable holding a path to a credential JSON file
pub const CREDENTIALS_FILE_ENV: &str = "GOOGLE_APPLICATION_CREDENTIALS";

/// Environment variable naming the project billed for API quota
pub const QUOTA_PROJECT_ENV: &str = "GOOGLE_CLOUD_QUOTA_PROJECT";

/// Well-known credentials file written by `gcloud auth application-default
/// login`, relative to the home directory
pub const USER_CREDENTIALS_RELATIVE_PATH: &str =
    ".config/gcloud/application_default_credentials.json";

/// Token endpoint used when a key file carries no `token_uri` of its own
pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// OAuth scope granting access to Google Cloud APIs, Gemini included
pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

/// Grant type for service-account assertion exchange
pub const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Metadata server base URL (resolvable only inside GCP)
pub const METADATA_BASE_URL: &str = "http://metadata.google.internal";

/// Metadata path serving access tokens for the default service account
pub const METADATA_TOKEN_PATH: &str =
    "/computeMetadata/v1/instance/service-accounts/default/token";

/// Metadata path serving the surrounding project's id
pub const METADATA_PROJECT_PATH: &str = "/computeMetadata/v1/project/project-id";

/// Header every metadata request must carry
pub const METADATA_FLAVOR_HEADER: &str = "Metadata-Flavor";

/// Required value of the metadata header
pub const METADATA_FLAVOR_VALUE: &str = "Google";

/// Header carrying a static API key
pub const API_KEY_HEADER: &str = "x-goog-api-key";

/// Header attributing quota/billing to a project
pub const QUOTA_PROJECT_HEADER: &str = "x-goog-user-project";

/// Lifetime of a signed service-account assertion, in seconds
pub const ASSERTION_LIFETIME_SECS: u64 = 3600;

/// Assumed access-token lifetime when the endpoint omits `expires_in`
pub const DEFAULT_EXPIRES_IN_SECS: u64 = 3600;

/// Safety margin subtracted from token lifetimes before caching, so
/// refresh happens ahead of the real expiry
pub const DEFAULT_REFRESH_BUFFER_SECS: u64 = 300;

/// Probe timeout deciding whether the metadata server exists at all
pub const METADATA_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Timeout for metadata requests once the server is known reachable
pub const METADATA_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
