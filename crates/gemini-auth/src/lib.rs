//! Gemini credential resolution and token management library
//!
//! Provides application-default credential discovery, RS256 assertion
//! signing, OAuth2 token exchange, metadata-server access, and a shared
//! token cache for the Gemini client core. This crate is a standalone
//! library with no dependency on the dispatch layer, so it can be tested
//! and used independently.
//!
//! Credential flow:
//! 1. `resolver::CredentialResolver::resolve()` walks the discovery chain
//!    and fixes one `Credentials` variant for the process lifetime
//! 2. `strategy::Authenticator::headers()` produces auth headers, deriving
//!    an access token through the shared `cache::TokenCache` on miss
//! 3. Concurrent misses collapse into one derivation per cache key
//! 4. The API rejecting a token with 401 triggers
//!    `strategy::Authenticator::refresh()`
//! 5. `refresh::spawn_refresh_task()` optionally keeps the token warm in
//!    the background

pub mod cache;
pub mod constants;
pub mod credentials;
pub mod error;
pub mod jwt;
pub mod metadata;
pub mod refresh;
pub mod resolver;
pub mod strategy;
pub mod token;

mod singleflight;

pub use cache::TokenCache;
pub use credentials::{AuthorizedUserKey, Credentials, KeyFile, ServiceAccountKey};
pub use error::{Error, Result};
pub use metadata::MetadataClient;
pub use refresh::spawn_refresh_task;
pub use resolver::{CredentialResolver, ResolverConfig, default_user_credentials_path};
pub use strategy::Authenticator;
pub use token::{TokenGrant, TokenResponse};
