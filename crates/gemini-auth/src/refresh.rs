//! Proactive background token refresh
//!
//! Spawns a periodic task that re-derives the access token before it
//! expires, so request paths normally find a warm cache. The task runs
//! independently of the request path and shares the authenticator's
//! single-flight table, so a cycle and a request racing on a cold cache
//! still cost one exchange.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::strategy::Authenticator;

/// Spawn a background task that keeps the access token warm.
///
/// Runs every `interval` and derives a fresh token whenever the cached one
/// has expired (the cache's refresh buffer makes that happen before the
/// real expiry). Errors are logged and retried next cycle.
///
/// Returns a `JoinHandle` for the spawned task.
pub fn spawn_refresh_task(
    auth: Arc<Authenticator>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick; the first request warms the cache
        ticker.tick().await;

        loop {
            ticker.tick().await;
            refresh_cycle(&auth).await;
        }
    })
}

/// Run one refresh cycle: derive a token if the cached one is gone.
async fn refresh_cycle(auth: &Authenticator) {
    match auth.ensure_token().await {
        Ok(true) => {
            info!(
                source = auth.credentials().source(),
                "background token refresh succeeded"
            );
        }
        Ok(false) => {
            debug!("cached token still valid, skipping refresh");
        }
        Err(e) => {
            warn!(error = %e, "background refresh failed, will retry next cycle");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TokenCache;
    use crate::credentials::{Credentials, ServiceAccountKey};

    fn service_auth(server: &wiremock::MockServer) -> Authenticator {
        let key = ServiceAccountKey {
            client_email: "runner@demo-project.iam.gserviceaccount.com".into(),
            private_key: crate::jwt::test_pems::PRIVATE.into(),
            token_uri: format!("{}/token", server.uri()),
            project_id: None,
        };
        Authenticator::new(
            Credentials::ServiceAccount(key),
            Arc::new(TokenCache::new()),
        )
    }

    fn mock_grant() -> wiremock::ResponseTemplate {
        wiremock::ResponseTemplate::new(200).set_body_raw(
            r#"{"access_token":"ya29.background","expires_in":3600}"#,
            "application/json",
        )
    }

    #[tokio::test]
    async fn cycle_derives_on_cold_cache() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .respond_with(mock_grant())
            .expect(1)
            .mount(&server)
            .await;

        let auth = service_auth(&server);
        refresh_cycle(&auth).await;

        // The derived token is in the cache; headers must not re-exchange
        let headers = auth.headers().await.unwrap();
        assert_eq!(
            headers.get(reqwest::header::AUTHORIZATION).unwrap(),
            "Bearer ya29.background"
        );
    }

    #[tokio::test]
    async fn cycle_skips_warm_cache() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .respond_with(mock_grant())
            .expect(1)
            .mount(&server)
            .await;

        let auth = service_auth(&server);
        auth.headers().await.unwrap();

        // Cache is warm; a second exchange would trip the mock's limit
        refresh_cycle(&auth).await;
        refresh_cycle(&auth).await;
    }

    #[tokio::test]
    async fn cycle_tolerates_endpoint_failure() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .respond_with(wiremock::ResponseTemplate::new(503))
            .mount(&server)
            .await;

        // Must log and return, not panic
        refresh_cycle(&service_auth(&server)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn spawned_task_refreshes_periodically() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .respond_with(mock_grant())
            .mount(&server)
            .await;

        let auth = Arc::new(service_auth(&server));
        let handle = spawn_refresh_task(auth, Duration::from_millis(50));
        tokio::time::sleep(Duration::from_millis(220)).await;
        handle.abort();

        // First tick is skipped, then one cycle derives; later cycles see
        // the warm cache
        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
    }
}
