use std::fmt;
use std::sync::Arc;

use tokio::time::{sleep, timeout, Instant};

use super::error::TransportError;
use super::http::{HttpClient, HttpRequest, HttpResponse};
use super::policy::{Disposition, RetryPolicy};
use crate::metrics::{MetricsErrorKind, MetricsRecorder};
use crate::observability::ErrorTracker;
use crate::prelude::{debug, warn};

// Consecutive identical retry warnings logged at WARN before downgrading to DEBUG.
const MAX_CONSECUTIVE_SAME_ERROR: u32 = 3;

/// Successful exchange plus the number of attempts it took.
#[derive(Debug, Clone)]
pub struct Exchange {
    /// The 2xx response.
    pub response: HttpResponse,
    /// Attempts made, including the successful one.
    pub attempts: u32,
}

/// Retrying HTTP executor shared by every call site.
///
/// Cheap to clone; clones share the underlying [`HttpClient`].
#[derive(Clone)]
pub struct HttpTransport {
    client: Arc<dyn HttpClient>,
    metrics: Option<Arc<dyn MetricsRecorder>>,
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("client", &"<HttpClient>")
            .field(
                "metrics",
                &self.metrics.as_ref().map(|_| "<MetricsRecorder>"),
            )
            .finish()
    }
}

enum Failure {
    Status { status: u16, body: String },
    Client(String),
}

impl HttpTransport {
    /// Creates a transport over `client`.
    pub fn new(client: Arc<dyn HttpClient>) -> Self {
        Self {
            client,
            metrics: None,
        }
    }

    /// Attaches a metrics recorder.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Runs one logical operation under `policy`.
    ///
    /// `build` is called before every attempt, so a retry always carries the
    /// caller's current state (credentials, continuation token) rather than a
    /// copy captured before an earlier failure. `operation` is a stable label
    /// used in logs and metrics.
    ///
    /// Each attempt is bounded by the policy's attempt timeout; a timeout or a
    /// client-level failure is retried exactly like a 5xx.
    ///
    /// # Errors
    ///
    /// - [`TransportError::Transient`] once the attempt budget (or overall
    ///   timeout) is exhausted on retryable failures,
    /// - [`TransportError::Request`] immediately on a fail-fast status,
    /// - [`TransportError::Reauthenticate`] immediately on 401,
    /// - whatever `build` returns.
    pub async fn execute<F>(
        &self,
        operation: &'static str,
        policy: &RetryPolicy,
        mut build: F,
    ) -> Result<Exchange, TransportError>
    where
        F: FnMut() -> Result<HttpRequest, TransportError>,
    {
        let started = Instant::now();
        let mut tracker = ErrorTracker::<Option<u16>>::new(MAX_CONSECUTIVE_SAME_ERROR);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let request = build()?;

            let failure =
                match timeout(policy.attempt_timeout(), self.client.send(request)).await {
                    Err(_) => Failure::Client(format!(
                        "attempt timed out after {:?}",
                        policy.attempt_timeout()
                    )),
                    Ok(Err(e)) => Failure::Client(e.to_string()),
                    Ok(Ok(response)) => {
                        let status = response.status();
                        match policy.classify(status) {
                            Disposition::Success => {
                                if attempt > 1 {
                                    debug!(
                                        "Request succeeded after retries: operation={}, attempts={}",
                                        operation, attempt
                                    );
                                }
                                return Ok(Exchange {
                                    response,
                                    attempts: attempt,
                                });
                            }
                            Disposition::FailFast => {
                                let body = response.text().into_owned();
                                warn!(
                                    "Request rejected: operation={}, status={}, body={}",
                                    operation, status, body
                                );
                                self.record_error(MetricsErrorKind::RequestRejected);
                                return Err(TransportError::Request { status, body });
                            }
                            Disposition::Reauthenticate => {
                                debug!(
                                    "Credential rejected: operation={}, status={}",
                                    operation, status
                                );
                                return Err(TransportError::Reauthenticate {
                                    body: response.text().into_owned(),
                                    attempts: attempt,
                                });
                            }
                            Disposition::Retry => Failure::Status {
                                status,
                                body: response.text().into_owned(),
                            },
                        }
                    }
                };

            let (last_status, body) = match failure {
                Failure::Status { status, body } => (Some(status), body),
                Failure::Client(message) => (None, message),
            };

            let exhausted = || {
                warn!(
                    "Retry budget exhausted: operation={}, attempts={}, last_status={:?}",
                    operation, attempt, last_status
                );
                self.record_error(MetricsErrorKind::TransientExhausted);
            };

            if attempt >= policy.max_attempts() {
                exhausted();
                return Err(TransportError::Transient {
                    last_status,
                    body,
                    attempts: attempt,
                });
            }

            let delay = policy.backoff(attempt);
            if let Some(budget) = policy.overall_timeout() {
                if started.elapsed() + delay > budget {
                    exhausted();
                    return Err(TransportError::Transient {
                        last_status,
                        body,
                        attempts: attempt,
                    });
                }
            }

            if tracker.record(last_status) {
                warn!(
                    "Retrying request: operation={}, attempt={}, status={:?}, backoff_ms={}, error={}",
                    operation,
                    attempt,
                    last_status,
                    delay.as_millis(),
                    body
                );
            } else {
                debug!(
                    "Retrying request (repeated): operation={}, attempt={}, status={:?}, consecutive={}",
                    operation,
                    attempt,
                    last_status,
                    tracker.consecutive()
                );
            }
            if let Some(m) = self.metrics.as_deref() {
                m.record_retry(operation);
            }

            sleep(delay).await;
        }
    }

    fn record_error(&self, kind: MetricsErrorKind) {
        if let Some(m) = self.metrics.as_deref() {
            m.record_error(kind);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::http::{HttpClientError, Method, ResponseFuture};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;
    use url::Url;

    struct Scripted {
        replies: Mutex<VecDeque<Result<HttpResponse, HttpClientError>>>,
        seen: Mutex<Vec<HttpRequest>>,
    }

    impl Scripted {
        fn new(replies: Vec<Result<HttpResponse, HttpClientError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    impl HttpClient for Scripted {
        fn send(&self, request: HttpRequest) -> ResponseFuture<'_> {
            self.seen.lock().unwrap().push(request);
            let reply = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(HttpResponse::new(200, "{}")));
            Box::pin(async move { reply })
        }
    }

    fn request() -> Result<HttpRequest, TransportError> {
        Ok(HttpRequest::new(
            Method::Get,
            Url::parse("https://example.com/x").unwrap(),
        ))
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::default()
            .with_base_delay(Duration::from_millis(10))
            .with_jitter(0.0)
            .with_max_attempts(3)
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_then_succeeds() {
        let client = Scripted::new(vec![
            Ok(HttpResponse::new(503, "busy")),
            Err(HttpClientError::Connect("reset".into())),
            Ok(HttpResponse::new(200, "ok")),
        ]);
        let transport = HttpTransport::new(client.clone());

        let exchange = transport
            .execute("test", &fast_policy(), request)
            .await
            .unwrap();
        assert_eq!(exchange.attempts, 3);
        assert_eq!(exchange.response.text(), "ok");
        assert_eq!(client.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_fast_does_not_retry() {
        let client = Scripted::new(vec![Ok(HttpResponse::new(413, r#"{"code":"too big"}"#))]);
        let transport = HttpTransport::new(client.clone());

        let err = transport
            .execute("test", &fast_policy(), request)
            .await
            .unwrap_err();
        match err {
            TransportError::Request { status, body } => {
                assert_eq!(status, 413);
                assert_eq!(body, r#"{"code":"too big"}"#);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_signals_reauthenticate() {
        let client = Scripted::new(vec![Ok(HttpResponse::new(401, "expired"))]);
        let transport = HttpTransport::new(client.clone());

        let err = transport
            .execute("test", &fast_policy(), request)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Reauthenticate { .. }));
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overall_timeout_stops_retrying() {
        let client = Scripted::new(vec![
            Ok(HttpResponse::new(500, "a")),
            Ok(HttpResponse::new(500, "b")),
            Ok(HttpResponse::new(500, "c")),
        ]);
        let transport = HttpTransport::new(client.clone());
        let policy = fast_policy()
            .with_max_attempts(10)
            .with_base_delay(Duration::from_secs(1))
            .with_overall_timeout(Duration::from_millis(1500));

        let err = transport.execute("test", &policy, request).await.unwrap_err();
        // 1s sleep fits, the following 2s sleep would not.
        assert_eq!(err.attempts(), Some(2));
        assert_eq!(client.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_is_transient() {
        struct Hanging;
        impl HttpClient for Hanging {
            fn send(&self, _request: HttpRequest) -> ResponseFuture<'_> {
                Box::pin(std::future::pending())
            }
        }

        let transport = HttpTransport::new(Arc::new(Hanging));
        let policy = fast_policy()
            .with_max_attempts(2)
            .with_attempt_timeout(Duration::from_secs(5));

        let err = transport.execute("test", &policy, request).await.unwrap_err();
        match err {
            TransportError::Transient {
                last_status,
                attempts,
                ..
            } => {
                assert_eq!(last_status, None);
                assert_eq!(attempts, 2);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
