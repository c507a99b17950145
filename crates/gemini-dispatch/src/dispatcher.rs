//! Single entry point tying credentials, rate limiting, and retries together
//!
//! `Dispatcher::call` is the one path a request takes to the API:
//!
//! 1. Reserve rate-limiter capacity for the resource, waiting out denials.
//! 2. Attach fresh auth headers and execute the request.
//! 3. On retryable failures, back off and re-attempt under the retry policy.
//! 4. Release the permit with the terminal outcome so the limiter learns
//!    what the server said.
//!
//! A configured deadline bounds the whole sequence, waiting included;
//! abandoning a call midway releases its permit as cancelled. Streaming
//! calls follow the same path and, when the stream drops midway, re-open
//! from the last cursor-bearing event instead of replaying from the start.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use gemini_auth::Authenticator;

use crate::classify::{classify_response, ErrorClass};
use crate::error::{Error, Result};
use crate::limiter::{LimiterConfig, Outcome, RateLimiterManager};
use crate::retry::{RetryCoordinator, RetryPolicy};
use crate::transport::{ApiRequest, ApiResponse, StreamEvent, StreamStart, Transport};

/// Request dispatcher for one API client instance.
pub struct Dispatcher {
    auth: Arc<Authenticator>,
    transport: Arc<dyn Transport>,
    limiter: RateLimiterManager,
    coordinator: RetryCoordinator,
    deadline: Option<Duration>,
}

impl Dispatcher {
    pub fn new(auth: Arc<Authenticator>, transport: Arc<dyn Transport>) -> Self {
        Self {
            auth,
            transport,
            limiter: RateLimiterManager::default(),
            coordinator: RetryCoordinator::new(RetryPolicy::default()),
            deadline: None,
        }
    }

    pub fn with_limiter_config(mut self, config: LimiterConfig) -> Self {
        self.limiter = RateLimiterManager::new(config);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.coordinator = RetryCoordinator::new(policy);
        self
    }

    /// Overall budget for one call, covering rate-limit waits, every retry
    /// attempt, and the backoff between them.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Execute a unary request against the given resource.
    pub async fn call(&self, resource_key: &str, request: ApiRequest) -> Result<ApiResponse> {
        let request_id = Uuid::new_v4();
        debug!(
            %request_id,
            resource = resource_key,
            method = %request.method,
            "dispatching request"
        );
        self.guard(request_id, self.call_inner(resource_key, request, request_id))
            .await
    }

    /// Execute a streaming request, handing each event to `on_event` as it
    /// arrives. Delivered events are never replayed: a resumed stream
    /// continues after the last event that carried a cursor.
    pub async fn call_streaming<F>(
        &self,
        resource_key: &str,
        request: ApiRequest,
        on_event: F,
    ) -> Result<()>
    where
        F: FnMut(StreamEvent) + Send,
    {
        let request_id = Uuid::new_v4();
        debug!(
            %request_id,
            resource = resource_key,
            "dispatching streaming request"
        );
        self.guard(
            request_id,
            self.stream_inner(resource_key, request, on_event, request_id),
        )
        .await
    }

    /// Point-in-time view of credential source and limiter state.
    pub fn health(&self) -> serde_json::Value {
        serde_json::json!({
            "credentials": self.auth.credentials().source(),
            "limiter": self.limiter.health(),
        })
    }

    // Dropping the inner future at the deadline releases its permit as
    // cancelled and abandons any in-flight request or backoff sleep
    async fn guard<T>(
        &self,
        request_id: Uuid,
        inner: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    out = inner => out,
                    _ = tokio::time::sleep(deadline) => {
                        warn!(
                            %request_id,
                            deadline_ms = deadline.as_millis() as u64,
                            "deadline exceeded, abandoning call"
                        );
                        Err(Error::DeadlineExceeded { deadline })
                    }
                }
            }
            None => inner.await,
        }
    }

    async fn call_inner(
        &self,
        resource_key: &str,
        request: ApiRequest,
        request_id: Uuid,
    ) -> Result<ApiResponse> {
        let permit = self
            .limiter
            .acquire_when_ready(resource_key, request.estimated_cost)
            .await;

        let result = self
            .coordinator
            .run(
                |attempt| {
                    let request = request.clone();
                    async move { self.attempt(request, attempt, request_id).await }
                },
                || {
                    let auth = Arc::clone(&self.auth);
                    async move { auth.refresh().await.map_err(Error::from) }
                },
            )
            .await;

        match &result {
            Ok(response) => {
                debug!(%request_id, status = response.status, "request completed");
                self.limiter.release(permit, Outcome::Success);
            }
            Err(Error::RateLimited {
                retry_after,
                attempts,
            }) => {
                warn!(
                    %request_id,
                    attempts = *attempts,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "request rate limited"
                );
                self.limiter.release(
                    permit,
                    Outcome::RateLimited {
                        retry_hint: Some(*retry_after),
                    },
                );
            }
            Err(e) => {
                warn!(%request_id, error = %e, "request failed");
                self.limiter.release(permit, Outcome::Failed);
            }
        }
        result
    }

    async fn attempt(
        &self,
        mut request: ApiRequest,
        attempt: u32,
        request_id: Uuid,
    ) -> Result<ApiResponse> {
        let headers = self.auth.headers().await?;
        request.headers.extend(headers);
        debug!(%request_id, attempt, "sending request");
        let response = self.transport.execute(request).await?;
        debug!(%request_id, attempt, status = response.status, "response received");
        Ok(response)
    }

    async fn stream_inner<F>(
        &self,
        resource_key: &str,
        request: ApiRequest,
        mut on_event: F,
        request_id: Uuid,
    ) -> Result<()>
    where
        F: FnMut(StreamEvent) + Send,
    {
        let permit = self
            .limiter
            .acquire_when_ready(resource_key, request.estimated_cost)
            .await;

        let result = self.drive_stream(request, &mut on_event, request_id).await;
        match &result {
            Ok(()) => {
                debug!(%request_id, "stream completed");
                self.limiter.release(permit, Outcome::Success);
            }
            Err(Error::RateLimited { retry_after, .. }) => {
                self.limiter.release(
                    permit,
                    Outcome::RateLimited {
                        retry_hint: Some(*retry_after),
                    },
                );
            }
            Err(e) => {
                warn!(%request_id, error = %e, "stream failed");
                self.limiter.release(permit, Outcome::Failed);
            }
        }
        result
    }

    async fn drive_stream<F>(
        &self,
        template: ApiRequest,
        on_event: &mut F,
        request_id: Uuid,
    ) -> Result<()>
    where
        F: FnMut(StreamEvent) + Send,
    {
        let policy = self.coordinator.policy();
        let mut cursor = template.resume_from.clone();
        let mut refreshed = false;
        let mut attempt = 0u32;
        'attempts: loop {
            attempt += 1;
            let mut request = template.clone();
            request.resume_from = cursor.clone();
            let headers = self.auth.headers().await?;
            request.headers.extend(headers);

            let start = match self.transport.open_stream(request).await {
                Ok(start) => start,
                Err(e) => {
                    if attempt >= policy.max_attempts {
                        return Err(Error::TransientFailure {
                            attempts: attempt,
                            last_cause: e.to_string(),
                        });
                    }
                    let delay = policy.jittered_delay(attempt);
                    debug!(
                        %request_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "stream open failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            let mut events = match start {
                StreamStart::Open(events) => events,
                StreamStart::Failed(response) => {
                    match classify_response(response.status, response.retry_after(), &response.body)
                    {
                        ErrorClass::Fatal => {
                            return Err(Error::Fatal {
                                status: response.status,
                                body: response.body,
                            });
                        }
                        ErrorClass::AuthExpired => {
                            if refreshed || attempt >= policy.max_attempts {
                                return Err(Error::Fatal {
                                    status: response.status,
                                    body: response.body,
                                });
                            }
                            info!(%request_id, attempt, "credentials rejected, refreshing token");
                            self.auth.refresh().await?;
                            refreshed = true;
                            continue;
                        }
                        ErrorClass::RateLimited { retry_hint } => {
                            let delay =
                                retry_hint.unwrap_or_else(|| policy.jittered_delay(attempt));
                            if attempt >= policy.max_attempts {
                                return Err(Error::RateLimited {
                                    retry_after: delay,
                                    attempts: attempt,
                                });
                            }
                            info!(
                                %request_id,
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                "stream open rate limited, backing off"
                            );
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                        ErrorClass::Transient => {
                            if attempt >= policy.max_attempts {
                                return Err(Error::TransientFailure {
                                    attempts: attempt,
                                    last_cause: format!("status {}", response.status),
                                });
                            }
                            let delay = policy.jittered_delay(attempt);
                            debug!(
                                %request_id,
                                attempt,
                                status = response.status,
                                delay_ms = delay.as_millis() as u64,
                                "stream open returned transient status, backing off"
                            );
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                    }
                }
            };

            loop {
                match events.next().await {
                    None => return Ok(()),
                    Some(Ok(event)) => {
                        if event.cursor.is_some() {
                            cursor = event.cursor.clone();
                        }
                        on_event(event);
                    }
                    Some(Err(e)) => {
                        if attempt >= policy.max_attempts {
                            return Err(Error::TransientFailure {
                                attempts: attempt,
                                last_cause: e.to_string(),
                            });
                        }
                        let delay = policy.jittered_delay(attempt);
                        warn!(
                            %request_id,
                            attempt,
                            cursor = cursor.as_deref().unwrap_or(""),
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "stream interrupted, will resume"
                        );
                        tokio::time::sleep(delay).await;
                        continue 'attempts;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::pin::Pin;
    use std::sync::Mutex;

    use reqwest::header::HeaderMap;

    use gemini_auth::{AuthorizedUserKey, Credentials, TokenCache};

    use crate::transport::{HttpTransport, TransportError};

    const KEY: &str = "models/gemini-pro:generateContent";

    #[derive(Debug)]
    enum Step {
        Respond(ApiResponse),
        Fail(TransportError),
        Hang,
        OpenStream(Vec<std::result::Result<StreamEvent, TransportError>>),
        FailOpen(ApiResponse),
    }

    struct ScriptedTransport {
        steps: Mutex<VecDeque<Step>>,
        requests: Mutex<Vec<ApiRequest>>,
    }

    impl ScriptedTransport {
        fn new(steps: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                steps: Mutex::new(steps.into()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        fn request(&self, index: usize) -> ApiRequest {
            self.requests.lock().unwrap()[index].clone()
        }
    }

    impl Transport for ScriptedTransport {
        fn execute(
            &self,
            request: ApiRequest,
        ) -> Pin<
            Box<
                dyn Future<Output = std::result::Result<ApiResponse, TransportError>> + Send + '_,
            >,
        > {
            self.requests.lock().unwrap().push(request);
            let step = self
                .steps
                .lock()
                .unwrap()
                .pop_front()
                .expect("script exhausted");
            Box::pin(async move {
                match step {
                    Step::Respond(response) => Ok(response),
                    Step::Fail(e) => Err(e),
                    Step::Hang => {
                        futures::future::pending::<()>().await;
                        unreachable!()
                    }
                    other => panic!("unary call got {other:?}"),
                }
            })
        }

        fn open_stream(
            &self,
            request: ApiRequest,
        ) -> Pin<Box<dyn Future<Output = std::result::Result<StreamStart, TransportError>> + Send + '_>>
        {
            self.requests.lock().unwrap().push(request);
            let step = self
                .steps
                .lock()
                .unwrap()
                .pop_front()
                .expect("script exhausted");
            Box::pin(async move {
                match step {
                    Step::OpenStream(events) => {
                        Ok(StreamStart::Open(Box::pin(futures::stream::iter(events))))
                    }
                    Step::FailOpen(response) => Ok(StreamStart::Failed(response)),
                    Step::Fail(e) => Err(e),
                    other => panic!("stream open got {other:?}"),
                }
            })
        }
    }

    fn response(status: u16) -> ApiResponse {
        ApiResponse {
            status,
            headers: HeaderMap::new(),
            body: format!("{{\"status\":{status}}}"),
        }
    }

    fn rate_limited(hint: &str) -> ApiResponse {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", hint.parse().unwrap());
        ApiResponse {
            status: 429,
            headers,
            body: String::new(),
        }
    }

    fn event(data: &str, cursor: Option<&str>) -> StreamEvent {
        StreamEvent {
            data: data.to_string(),
            cursor: cursor.map(ToString::to_string),
        }
    }

    fn api_key_auth(key: &str) -> Arc<Authenticator> {
        Arc::new(Authenticator::new(
            Credentials::ApiKey { key: key.into() },
            Arc::new(TokenCache::new()),
        ))
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            initial_delay: Duration::from_millis(1),
            base: 2.0,
            max_delay: Duration::from_millis(10),
            jitter_fraction: 0.0,
        }
    }

    fn dispatcher(transport: Arc<ScriptedTransport>) -> Dispatcher {
        Dispatcher::new(api_key_auth("test-key"), transport).with_retry_policy(fast_policy())
    }

    fn available_permits(dispatcher: &Dispatcher) -> serde_json::Value {
        dispatcher.health()["limiter"]["resources"][KEY]["available_permits"].clone()
    }

    #[tokio::test]
    async fn call_attaches_auth_headers_and_succeeds() {
        let transport = ScriptedTransport::new(vec![Step::Respond(response(200))]);
        let dispatcher = dispatcher(Arc::clone(&transport));

        let out = dispatcher.call(KEY, ApiRequest::post("/v1/gen")).await.unwrap();
        assert_eq!(out.status, 200);
        assert_eq!(
            transport.request(0).headers.get("x-goog-api-key").unwrap(),
            "test-key"
        );
        assert_eq!(available_permits(&dispatcher), 8);
    }

    #[tokio::test]
    async fn transient_status_is_retried() {
        let transport = ScriptedTransport::new(vec![
            Step::Respond(response(503)),
            Step::Respond(response(200)),
        ]);
        let dispatcher = dispatcher(Arc::clone(&transport));

        let out = dispatcher.call(KEY, ApiRequest::post("/v1/gen")).await.unwrap();
        assert_eq!(out.status, 200);
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn transport_failure_is_retried() {
        let transport = ScriptedTransport::new(vec![
            Step::Fail(TransportError::Timeout("deadline elapsed".into())),
            Step::Respond(response(200)),
        ]);
        let dispatcher = dispatcher(Arc::clone(&transport));

        let out = dispatcher.call(KEY, ApiRequest::post("/v1/gen")).await.unwrap();
        assert_eq!(out.status, 200);
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn fatal_status_aborts_and_releases_permit() {
        let transport = ScriptedTransport::new(vec![Step::Respond(response(400))]);
        let dispatcher = dispatcher(Arc::clone(&transport));

        let err = dispatcher
            .call(KEY, ApiRequest::post("/v1/gen"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Fatal { status: 400, .. }), "got: {err:?}");
        assert_eq!(transport.calls(), 1);
        assert_eq!(available_permits(&dispatcher), 8);
    }

    #[tokio::test]
    async fn unauthorized_triggers_refresh_and_reattempt() {
        let transport = ScriptedTransport::new(vec![
            Step::Respond(response(401)),
            Step::Respond(response(200)),
        ]);
        let dispatcher = dispatcher(Arc::clone(&transport));

        let out = dispatcher.call(KEY, ApiRequest::post("/v1/gen")).await.unwrap();
        assert_eq!(out.status, 200);
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn rate_limit_exhaustion_stores_hint_for_the_resource() {
        let transport = ScriptedTransport::new(vec![Step::Respond(rate_limited("7"))]);
        let dispatcher = dispatcher(Arc::clone(&transport)).with_retry_policy(RetryPolicy {
            max_attempts: 1,
            ..fast_policy()
        });

        let err = dispatcher
            .call(KEY, ApiRequest::post("/v1/gen"))
            .await
            .unwrap_err();
        match err {
            Error::RateLimited {
                retry_after,
                attempts,
            } => {
                assert_eq!(retry_after, Duration::from_secs(7));
                assert_eq!(attempts, 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let health = dispatcher.health();
        assert_eq!(health["limiter"]["resources"][KEY]["hint_active"], true);
    }

    #[tokio::test]
    async fn deadline_abandons_call_and_frees_capacity() {
        let transport = ScriptedTransport::new(vec![Step::Hang]);
        let dispatcher =
            dispatcher(Arc::clone(&transport)).with_deadline(Duration::from_millis(50));

        let err = dispatcher
            .call(KEY, ApiRequest::post("/v1/gen"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded { .. }), "got: {err:?}");
        assert_eq!(available_permits(&dispatcher), 8);
    }

    #[tokio::test]
    async fn deadline_covers_the_wait_for_a_permit() {
        let transport = ScriptedTransport::new(vec![Step::Hang]);
        let dispatcher = dispatcher(Arc::clone(&transport))
            .with_limiter_config(LimiterConfig {
                max_permits: 1,
                ..LimiterConfig::default()
            })
            .with_deadline(Duration::from_millis(100));

        let (first, second) = tokio::join!(
            dispatcher.call(KEY, ApiRequest::post("/v1/gen")),
            dispatcher.call(KEY, ApiRequest::post("/v1/gen")),
        );
        assert!(matches!(first, Err(Error::DeadlineExceeded { .. })));
        assert!(matches!(second, Err(Error::DeadlineExceeded { .. })));
        assert_eq!(transport.calls(), 1);
        assert_eq!(available_permits(&dispatcher), 1);
    }

    #[tokio::test]
    async fn credential_failure_never_reaches_the_transport() {
        let transport = ScriptedTransport::new(vec![]);
        let dispatcher = Dispatcher::new(
            api_key_auth("   "),
            Arc::clone(&transport) as Arc<dyn Transport>,
        )
            .with_retry_policy(fast_policy());

        let err = dispatcher
            .call(KEY, ApiRequest::post("/v1/gen"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Auth(_)), "got: {err:?}");
        assert_eq!(transport.calls(), 0);
        assert_eq!(available_permits(&dispatcher), 8);
    }

    #[tokio::test]
    async fn health_names_the_credential_source() {
        let transport = ScriptedTransport::new(vec![]);
        let dispatcher = dispatcher(transport);
        assert_eq!(dispatcher.health()["credentials"], "api_key");
    }

    #[tokio::test]
    async fn streaming_delivers_events_in_order() {
        let transport = ScriptedTransport::new(vec![Step::OpenStream(vec![
            Ok(event("hello", None)),
            Ok(event("world", Some("c2"))),
        ])]);
        let dispatcher = dispatcher(Arc::clone(&transport));

        let mut seen = Vec::new();
        dispatcher
            .call_streaming(KEY, ApiRequest::post("/v1/stream"), |event| {
                seen.push(event.data)
            })
            .await
            .unwrap();
        assert_eq!(seen, vec!["hello", "world"]);
        assert_eq!(available_permits(&dispatcher), 8);
    }

    #[tokio::test]
    async fn interrupted_stream_resumes_from_last_cursor() {
        let transport = ScriptedTransport::new(vec![
            Step::OpenStream(vec![
                Ok(event("a", Some("c1"))),
                Err(TransportError::Timeout("stream cut".into())),
            ]),
            Step::OpenStream(vec![Ok(event("b", None))]),
        ]);
        let dispatcher = dispatcher(Arc::clone(&transport));

        let mut seen = Vec::new();
        dispatcher
            .call_streaming(KEY, ApiRequest::post("/v1/stream"), |event| {
                seen.push(event.data)
            })
            .await
            .unwrap();

        // Delivered events are not replayed after the resume
        assert_eq!(seen, vec!["a", "b"]);
        assert_eq!(transport.request(0).resume_from, None);
        assert_eq!(transport.request(1).resume_from, Some("c1".to_string()));
    }

    #[tokio::test]
    async fn failed_stream_open_is_classified_like_unary() {
        let transport = ScriptedTransport::new(vec![Step::FailOpen(response(400))]);
        let dispatcher = dispatcher(Arc::clone(&transport));

        let err = dispatcher
            .call_streaming(KEY, ApiRequest::post("/v1/stream"), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Fatal { status: 400, .. }), "got: {err:?}");
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn rate_limited_stream_open_retries_after_hint() {
        let transport = ScriptedTransport::new(vec![
            Step::FailOpen(rate_limited("0")),
            Step::OpenStream(vec![Ok(event("ok", None))]),
        ]);
        let dispatcher = dispatcher(Arc::clone(&transport));

        let mut seen = Vec::new();
        dispatcher
            .call_streaming(KEY, ApiRequest::post("/v1/stream"), |event| {
                seen.push(event.data)
            })
            .await
            .unwrap();
        assert_eq!(seen, vec!["ok"]);
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn unauthorized_stream_open_refreshes_once() {
        let transport = ScriptedTransport::new(vec![
            Step::FailOpen(response(401)),
            Step::OpenStream(vec![Ok(event("ok", None))]),
        ]);
        let dispatcher = dispatcher(Arc::clone(&transport));

        dispatcher
            .call_streaming(KEY, ApiRequest::post("/v1/stream"), |_| {})
            .await
            .unwrap();
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn exhausted_stream_interruptions_fail_transiently() {
        let transport = ScriptedTransport::new(vec![
            Step::OpenStream(vec![Err(TransportError::Timeout("cut".into()))]),
            Step::OpenStream(vec![Err(TransportError::Timeout("cut".into()))]),
        ]);
        let dispatcher = dispatcher(Arc::clone(&transport)).with_retry_policy(RetryPolicy {
            max_attempts: 2,
            ..fast_policy()
        });

        let err = dispatcher
            .call_streaming(KEY, ApiRequest::post("/v1/stream"), |_| {})
            .await
            .unwrap_err();
        match err {
            Error::TransientFailure {
                attempts,
                last_cause,
            } => {
                assert_eq!(attempts, 2);
                assert!(last_cause.contains("cut"), "got: {last_cause}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn end_to_end_flow_over_http() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let server = wiremock::MockServer::start().await;

        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .and(wiremock::matchers::path("/token"))
            .and(wiremock::matchers::body_string_contains("refresh_token"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_raw(
                r#"{"access_token":"ya29.dispatch","expires_in":3600}"#,
                "application/json",
            ))
            .expect(1)
            .mount(&server)
            .await;

        // First generateContent call is rate limited with an immediate hint,
        // the retried call succeeds
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .and(wiremock::matchers::path(
                "/v1beta/models/gemini-pro:generateContent",
            ))
            .and(wiremock::matchers::header(
                "authorization",
                "Bearer ya29.dispatch",
            ))
            .respond_with(wiremock::ResponseTemplate::new(429).insert_header("retry-after", "0"))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .and(wiremock::matchers::path(
                "/v1beta/models/gemini-pro:generateContent",
            ))
            .and(wiremock::matchers::header(
                "authorization",
                "Bearer ya29.dispatch",
            ))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_raw(
                r#"{"candidates":[{"content":"pong"}]}"#,
                "application/json",
            ))
            .expect(1)
            .mount(&server)
            .await;

        let credentials = Credentials::UserOAuth2(AuthorizedUserKey {
            client_id: "client".into(),
            client_secret: "secret".into(),
            refresh_token: "refresh".into(),
            quota_project_id: None,
        });
        let auth = Arc::new(
            Authenticator::new(credentials, Arc::new(TokenCache::new()))
                .with_token_uri(format!("{}/token", server.uri())),
        );
        let dispatcher =
            Dispatcher::new(auth, Arc::new(HttpTransport::new())).with_retry_policy(fast_policy());

        let request = ApiRequest::post(format!(
            "{}/v1beta/models/gemini-pro:generateContent",
            server.uri()
        ))
        .with_body(serde_json::json!({"contents":[{"parts":[{"text":"ping"}]}]}));

        let response = dispatcher.call(KEY, request).await.unwrap();
        assert_eq!(response.status, 200);
        assert!(response.body.contains("pong"));
    }

    #[tokio::test]
    async fn end_to_end_streaming_over_http() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .and(wiremock::matchers::path(
                "/v1beta/models/gemini-pro:streamGenerateContent",
            ))
            .and(wiremock::matchers::header("x-goog-api-key", "stream-key"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_raw(
                "data: {\"text\":\"partial\"}\n\n",
                "text/event-stream",
            ))
            .expect(1)
            .mount(&server)
            .await;

        let dispatcher =
            Dispatcher::new(api_key_auth("stream-key"), Arc::new(HttpTransport::new()))
                .with_retry_policy(fast_policy());

        let mut collected = String::new();
        dispatcher
            .call_streaming(
                "models/gemini-pro:streamGenerateContent",
                ApiRequest::post(format!(
                    "{}/v1beta/models/gemini-pro:streamGenerateContent",
                    server.uri()
                )),
                |event| collected.push_str(&event.data),
            )
            .await
            .unwrap();
        assert!(collected.contains("partial"));
    }
}
