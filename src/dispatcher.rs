//! Reliable delivery of payloads to the ingestion API.
//!
//! The dispatcher POSTs a JSON payload and retries every recoverable failure
//! (timeouts, connection errors, other transport errors, non-200 responses)
//! with exponential backoff. After the retry budget is spent the payload is
//! dropped; nothing is queued for later redelivery.

use std::future::Future;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;

/// Upper bound on a single backoff sleep.
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Longest response body kept for logging.
const MAX_LOGGED_BODY: usize = 512;

/// Recoverable failure of one delivery attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchError {
    /// Request exceeded the configured timeout
    Timeout(String),

    /// Could not connect to the API
    Connection(String),

    /// Any other transport-level failure
    Transport(String),

    /// The API answered with a status other than 200
    ServerRejected { status: StatusCode, body: String },
}

impl DispatchError {
    /// Short classification used as a log field.
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::Timeout(_) => "timeout",
            DispatchError::Connection(_) => "connection",
            DispatchError::Transport(_) => "transport",
            DispatchError::ServerRejected { .. } => "server_rejected",
        }
    }
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchError::Timeout(e) => write!(f, "Request timed out: {}", e),
            DispatchError::Connection(e) => write!(f, "Connection failed: {}", e),
            DispatchError::Transport(e) => write!(f, "HTTP request failed: {}", e),
            DispatchError::ServerRejected { status, body } => {
                write!(f, "Server error ({}): {}", status, body)
            }
        }
    }
}

impl std::error::Error for DispatchError {}

impl From<reqwest::Error> for DispatchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            DispatchError::Timeout(err.to_string())
        } else if err.is_connect() {
            DispatchError::Connection(err.to_string())
        } else {
            DispatchError::Transport(err.to_string())
        }
    }
}

/// Terminal result of one `send` call.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// The API accepted the payload
    Delivered { attempts: u32 },

    /// Every attempt failed; the payload is lost
    GaveUp {
        attempts: u32,
        last_error: DispatchError,
    },
}

impl DispatchOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DispatchOutcome::Delivered { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            DispatchOutcome::Delivered { attempts } => *attempts,
            DispatchOutcome::GaveUp { attempts, .. } => *attempts,
        }
    }
}

/// Errors building the HTTP transport.
#[derive(Debug)]
pub enum SetupError {
    /// The credential cannot be used as a header value
    InvalidCredential,

    /// The HTTP client could not be built
    Client(reqwest::Error),
}

impl std::fmt::Display for SetupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SetupError::InvalidCredential => {
                write!(f, "API credential contains characters not allowed in a header")
            }
            SetupError::Client(e) => write!(f, "Client configuration error: {}", e),
        }
    }
}

impl std::error::Error for SetupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SetupError::Client(e) => Some(e),
            SetupError::InvalidCredential => None,
        }
    }
}

/// Status and body of an HTTP response.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub body: String,
}

/// A single POST of a JSON body.
///
/// Implementations perform exactly one request and never retry.
pub trait Transport: Send + Sync {
    fn post(
        &self,
        url: &str,
        body: &Value,
        timeout: Duration,
    ) -> impl Future<Output = Result<TransportResponse, DispatchError>> + Send;
}

/// Production transport backed by a pooled reqwest client.
///
/// Every request carries `Authorization: Bearer <credential>`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Build a transport that authenticates with `api_key`.
    ///
    /// # Errors
    ///
    /// Returns `SetupError` if the credential is not a valid header value or
    /// the HTTP client cannot be built.
    pub fn new(api_key: &str, timeout: Duration) -> Result<Self, SetupError> {
        let mut bearer = HeaderValue::from_str(&format!("Bearer {}", api_key))
            .map_err(|_| SetupError::InvalidCredential)?;
        bearer.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, bearer);

        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(SetupError::Client)?;

        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    async fn post(
        &self,
        url: &str,
        body: &Value,
        timeout: Duration,
    ) -> Result<TransportResponse, DispatchError> {
        let response = self
            .client
            .post(url)
            .timeout(timeout)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable body>".to_string());

        Ok(TransportResponse { status, body })
    }
}

/// Timeout and retry settings, fixed at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per payload
    pub max_retries: u32,

    /// Base of the exponential backoff, in seconds
    pub backoff_base: f64,

    /// Per-request timeout
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff_base: config.backoff_base,
            timeout: config.request_timeout,
        }
    }

    /// Sleep before the retry that follows failed attempt `attempt_index`
    /// (zero-based): `backoff_base ^ attempt_index` seconds.
    pub fn backoff_delay(&self, attempt_index: u32) -> Duration {
        let exponent = attempt_index.min(i32::MAX as u32) as i32;
        let secs = self.backoff_base.powi(exponent);

        if !secs.is_finite() || secs >= MAX_BACKOFF.as_secs_f64() {
            MAX_BACKOFF
        } else {
            Duration::from_secs_f64(secs.max(0.0))
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: 2.0,
            timeout: Duration::from_secs(5),
        }
    }
}

/// Retrying sender shared by the sensor and diagnostics paths.
///
/// # Example
///
/// ```no_run
/// use telemetry_agent::config::Config;
/// use telemetry_agent::dispatcher::Dispatcher;
///
/// #[tokio::main]
/// async fn main() {
///     let config = Config::default();
///     let dispatcher = Dispatcher::from_config(&config).expect("Failed to create dispatcher");
///
///     let payload = serde_json::json!({"readings": []});
///     let outcome = dispatcher.send(&config.sensors_url, &payload).await;
///     println!("delivered: {}", outcome.is_delivered());
/// }
/// ```
#[derive(Debug)]
pub struct Dispatcher<T = HttpTransport> {
    transport: T,
    policy: RetryPolicy,
}

impl Dispatcher<HttpTransport> {
    /// Create an HTTP dispatcher from the process configuration.
    pub fn from_config(config: &Config) -> Result<Self, SetupError> {
        let transport = HttpTransport::new(&config.api_key, config.request_timeout)?;
        Ok(Self::new(transport, RetryPolicy::from_config(config)))
    }
}

impl<T: Transport> Dispatcher<T> {
    pub fn new(transport: T, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Deliver `payload` to `endpoint`, retrying recoverable failures.
    ///
    /// Returns on the first 200 response. Otherwise sleeps
    /// `backoff_base ^ attempt` between attempts and gives up after
    /// `max_retries` attempts, with no sleep after the last one.
    pub async fn send(&self, endpoint: &str, payload: &Value) -> DispatchOutcome {
        let delivery_id = Uuid::new_v4();
        let max_attempts = self.policy.max_retries.max(1);

        debug!(
            %delivery_id,
            endpoint,
            payload = %summarize(payload),
            "Dispatching payload"
        );

        let mut attempt: u32 = 0;
        loop {
            let error = match self
                .transport
                .post(endpoint, payload, self.policy.timeout)
                .await
            {
                Ok(response) if response.status == StatusCode::OK => {
                    info!(
                        %delivery_id,
                        endpoint,
                        attempt = attempt + 1,
                        "Payload delivered"
                    );
                    return DispatchOutcome::Delivered {
                        attempts: attempt + 1,
                    };
                }
                Ok(response) => DispatchError::ServerRejected {
                    status: response.status,
                    body: truncate(&response.body),
                },
                Err(e) => e,
            };

            attempt += 1;

            if attempt >= max_attempts {
                error!(
                    %delivery_id,
                    endpoint,
                    attempts = attempt,
                    error_kind = error.kind(),
                    error = %error,
                    payload = %summarize(payload),
                    "Giving up on payload after exhausting retries"
                );
                return DispatchOutcome::GaveUp {
                    attempts: attempt,
                    last_error: error,
                };
            }

            let delay = self.policy.backoff_delay(attempt - 1);
            warn!(
                %delivery_id,
                endpoint,
                attempt,
                max_retries = max_attempts,
                error_kind = error.kind(),
                error = %error,
                delay_ms = delay.as_millis() as u64,
                "Delivery attempt failed, will retry"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

fn truncate(body: &str) -> String {
    if body.len() <= MAX_LOGGED_BODY {
        return body.to_string();
    }
    let mut end = MAX_LOGGED_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}

/// One-line description of a payload for log fields.
fn summarize(payload: &Value) -> String {
    match payload.get("readings").and_then(Value::as_array) {
        Some(readings) => format!("{} readings", readings.len()),
        None => match payload.as_object() {
            Some(object) => format!("object with {} fields", object.len()),
            None => "non-object payload".to_string(),
        },
    }
}


#[cfg(test)]
mod tests {
    use super::scripted::ScriptedTransport;
    use super::*;
    use serde_json::json;
    use tokio::time::Instant;

    fn assert_elapsed(start: Instant, expected: Duration) {
        let elapsed = start.elapsed();
        assert!(
            elapsed >= expected && elapsed < expected + Duration::from_millis(50),
            "elapsed {:?}, expected {:?}",
            elapsed,
            expected
        );
    }

    fn dispatcher(transport: ScriptedTransport, max_retries: u32) -> Dispatcher<ScriptedTransport> {
        Dispatcher::new(
            transport,
            RetryPolicy {
                max_retries,
                ..RetryPolicy::default()
            },
        )
    }

    #[test]
    fn test_dispatch_error_display() {
        let err = DispatchError::Timeout("operation timed out".to_string());
        assert_eq!(format!("{}", err), "Request timed out: operation timed out");

        let err = DispatchError::ServerRejected {
            status: StatusCode::BAD_REQUEST,
            body: "Invalid JSON".to_string(),
        };
        assert!(format!("{}", err).contains("400"));
        assert!(format!("{}", err).contains("Invalid JSON"));
    }

    #[test]
    fn test_dispatch_error_kinds() {
        assert_eq!(DispatchError::Timeout(String::new()).kind(), "timeout");
        assert_eq!(DispatchError::Connection(String::new()).kind(), "connection");
        assert_eq!(DispatchError::Transport(String::new()).kind(), "transport");
        assert_eq!(
            DispatchError::ServerRejected {
                status: StatusCode::BAD_GATEWAY,
                body: String::new()
            }
            .kind(),
            "server_rejected"
        );
    }

    #[test]
    fn test_backoff_sequence() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_delay(0), Duration::from_secs(1));
        assert_eq!(policy.backoff_delay(1), Duration::from_secs(2));
        assert_eq!(policy.backoff_delay(2), Duration::from_secs(4));
        assert_eq!(policy.backoff_delay(3), Duration::from_secs(8));
    }

    #[test]
    fn test_backoff_caps_at_max() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_delay(20), MAX_BACKOFF);
        assert_eq!(policy.backoff_delay(u32::MAX), MAX_BACKOFF);
    }

    #[test]
    fn test_http_transport_creation() {
        assert!(HttpTransport::new("secret", Duration::from_secs(5)).is_ok());

        let err = HttpTransport::new("bad\nkey", Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, SetupError::InvalidCredential));
    }

    #[test]
    fn test_dispatcher_from_config() {
        let config = Config::default();
        let dispatcher = Dispatcher::from_config(&config).unwrap();
        assert_eq!(dispatcher.policy().max_retries, 3);
        assert_eq!(dispatcher.policy().timeout, Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivered_on_first_attempt() {
        let transport = ScriptedTransport::new();
        let dispatcher = dispatcher(transport.clone(), 3);
        let start = Instant::now();

        let outcome = dispatcher.send("http://api/api/sensors", &json!({"readings": []})).await;

        assert_eq!(outcome, DispatchOutcome::Delivered { attempts: 1 });
        assert_eq!(transport.attempts(), 1);
        assert_elapsed(start, Duration::ZERO);
        assert_eq!(transport.requests()[0].0, "http://api/api/sensors");
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivered_after_failures_stops_retrying() {
        let transport = ScriptedTransport::with_script([
            Err(DispatchError::Timeout("deadline".to_string())),
            Ok(StatusCode::INTERNAL_SERVER_ERROR),
            Ok(StatusCode::OK),
            Ok(StatusCode::INTERNAL_SERVER_ERROR),
        ]);
        let dispatcher = dispatcher(transport.clone(), 5);
        let start = Instant::now();

        let outcome = dispatcher.send("http://api/x", &json!({})).await;

        assert_eq!(outcome, DispatchOutcome::Delivered { attempts: 3 });
        assert_eq!(transport.attempts(), 3);
        // 1s after the first failure, 2s after the second
        assert_elapsed(start, Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_three_connection_failures() {
        let transport = ScriptedTransport::failing(3);
        let dispatcher = dispatcher(transport.clone(), 3);
        let start = Instant::now();

        let outcome = dispatcher.send("http://api/x", &json!({})).await;

        assert_eq!(
            outcome,
            DispatchOutcome::GaveUp {
                attempts: 3,
                last_error: DispatchError::Connection("refused".to_string()),
            }
        );
        assert_eq!(transport.attempts(), 3);
        // No sleep after the final attempt
        assert_elapsed(start, Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_200_success_status_is_retried() {
        let transport = ScriptedTransport::with_script([Ok(StatusCode::CREATED)]);
        let dispatcher = dispatcher(transport.clone(), 3);

        let outcome = dispatcher.send("http://api/x", &json!({})).await;

        assert_eq!(outcome, DispatchOutcome::Delivered { attempts: 2 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_rejection_reported_when_giving_up() {
        let transport = ScriptedTransport::with_script([
            Ok(StatusCode::SERVICE_UNAVAILABLE),
            Ok(StatusCode::SERVICE_UNAVAILABLE),
        ]);
        let dispatcher = dispatcher(transport.clone(), 2);
        let start = Instant::now();

        let outcome = dispatcher.send("http://api/x", &json!({})).await;

        assert!(!outcome.is_delivered());
        assert_eq!(outcome.attempts(), 2);
        assert!(matches!(
            outcome,
            DispatchOutcome::GaveUp {
                last_error: DispatchError::ServerRejected { status: StatusCode::SERVICE_UNAVAILABLE, .. },
                ..
            }
        ));
        assert_elapsed(start, Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_attempt_policy_never_sleeps() {
        let transport = ScriptedTransport::failing(1);
        let dispatcher = dispatcher(transport.clone(), 1);
        let start = Instant::now();

        let outcome = dispatcher.send("http://api/x", &json!({})).await;

        assert_eq!(outcome.attempts(), 1);
        assert_elapsed(start, Duration::ZERO);
    }

    #[test]
    fn test_truncate_long_body() {
        let body = "é".repeat(600);
        let truncated = truncate(&body);
        assert!(truncated.ends_with("..."));
        assert!(truncated.len() <= MAX_LOGGED_BODY + 3);
        assert_eq!(truncate("short"), "short");
    }

    #[test]
    fn test_summarize_payloads() {
        assert_eq!(summarize(&json!({"readings": [1, 2]})), "2 readings");
        assert_eq!(summarize(&json!({"a": 1})), "object with 1 fields");
        assert_eq!(summarize(&json!(3)), "non-object payload");
    }
}
