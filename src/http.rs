// ===============================
// src/http.rs (retrying HTTP executor)
// ===============================
//
// Transient failures stay in this layer: transport errors, 429 and 5xx are
// retried with exponential backoff (±20% jitter) or the server's Retry-After.
// Other statuses fail immediately with the (capped) response body.
// Every wait observes the caller's cancellation token.
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const BACKOFF_BASE: Duration = Duration::from_millis(500);
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);
pub const MAX_ERR_BODY: usize = 8192;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("http {status}: {body}")]
    Status { status: u16, body: String },
    #[error("request cancelled")]
    Cancelled,
    #[error("request body cannot be replayed")]
    NotReplayable,
    #[error("build request: {0}")]
    Build(String),
    #[error("decode response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Total attempts including the first; 0 = retry until cancelled.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self { Self { base: BACKOFF_BASE, max: MAX_BACKOFF, max_attempts: 8 } }
}

/// `base * 2^attempt`, capped at `max`, before jitter.
pub fn backoff_ceiling(base: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 2f64.powi(attempt.min(62) as i32);
    let delay = base.as_secs_f64() * factor;
    if delay >= max.as_secs_f64() { max } else { Duration::from_secs_f64(delay) }
}

pub fn compute_backoff(base: Duration, max: Duration, attempt: u32) -> Duration {
    let ceiling = backoff_ceiling(base, max, attempt);
    let jitter: f64 = rand::thread_rng().gen_range(-0.2..=0.2);
    ceiling.mul_f64(1.0 + jitter)
}

/// `Retry-After` as delta-seconds or HTTP-date; past dates mean "now".
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

pub fn truncate_body(body: &str, max: usize) -> String {
    if body.len() <= max {
        return body.to_string();
    }
    let mut cut = max;
    while !body.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…", &body[..cut])
}

fn is_retryable(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

async fn wait(delay: Duration, token: &CancellationToken) -> Result<(), HttpError> {
    tokio::select! {
        _ = sleep(delay) => Ok(()),
        _ = token.cancelled() => Err(HttpError::Cancelled),
    }
}

enum Attempt {
    Done(Vec<u8>),
    Fatal(HttpError),
    Retry { last: String, retry_after: Option<Duration> },
}

#[derive(Clone)]
pub struct RetryClient {
    http: reqwest::Client,
    policy: RetryPolicy,
}

impl Default for RetryClient {
    fn default() -> Self { Self::new(RetryPolicy::default()) }
}

impl RetryClient {
    pub fn new(policy: RetryPolicy) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { http, policy }
    }

    pub fn inner(&self) -> &reqwest::Client { &self.http }

    /// Run `req` until it succeeds, fails permanently, or `token` fires.
    pub async fn execute(&self, req: reqwest::Request, token: &CancellationToken) -> Result<Vec<u8>, HttpError> {
        self.execute_with(|| req.try_clone().ok_or(HttpError::NotReplayable), token).await
    }

    /// Like `execute`, but `build` is called for every attempt, so requests
    /// carrying a nonce or signature are fresh on each retry.
    pub async fn execute_with<F>(&self, build: F, token: &CancellationToken) -> Result<Vec<u8>, HttpError>
    where
        F: Fn() -> Result<reqwest::Request, HttpError>,
    {
        let mut attempt: u32 = 0;

        loop {
            if token.is_cancelled() {
                return Err(HttpError::Cancelled);
            }
            let req = build()?;
            let url = req.url().to_string();

            let outcome = tokio::select! {
                r = self.send(req) => r,
                _ = token.cancelled() => return Err(HttpError::Cancelled),
            };

            let (last, delay) = match outcome {
                Attempt::Done(body) => return Ok(body),
                Attempt::Fatal(e) => return Err(e),
                Attempt::Retry { last, retry_after } => {
                    let delay = retry_after
                        .unwrap_or_else(|| compute_backoff(self.policy.base, self.policy.max, attempt));
                    (last, delay)
                }
            };

            attempt += 1;
            if self.policy.max_attempts > 0 && attempt >= self.policy.max_attempts {
                warn!(%url, attempts = attempt, error = %last, "giving up");
                return Err(HttpError::Exhausted { attempts: attempt, last });
            }
            debug!(%url, attempt, delay_ms = delay.as_millis() as u64, error = %last, "retrying");
            wait(delay, token).await?;
        }
    }

    // One request/response exchange, body included.
    async fn send(&self, req: reqwest::Request) -> Attempt {
        let resp = match self.http.execute(req).await {
            Ok(r) => r,
            Err(e) => return Attempt::Retry { last: format!("transport: {e}"), retry_after: None },
        };
        let status = resp.status();
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| parse_retry_after(v, Utc::now()));
        let body = match resp.bytes().await {
            Ok(b) => b,
            // body cut off mid-read: same as any other transport failure
            Err(e) => return Attempt::Retry { last: format!("transport (body): {e}"), retry_after: None },
        };

        if status.is_success() {
            return Attempt::Done(body.to_vec());
        }
        let text = truncate_body(&String::from_utf8_lossy(&body), MAX_ERR_BODY);
        if !is_retryable(status) {
            return Attempt::Fatal(HttpError::Status { status: status.as_u16(), body: text });
        }
        Attempt::Retry { last: format!("http {}: {text}", status.as_u16()), retry_after }
    }

    pub async fn post_json<B, T>(&self, url: &str, body: &B, token: &CancellationToken) -> Result<T, HttpError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let req = self
            .http
            .post(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(body)
            .build()?;
        let bytes = self.execute(req, token).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_millis(500);
        let max = Duration::from_secs(30);
        assert_eq!(backoff_ceiling(base, max, 0), Duration::from_millis(500));
        assert_eq!(backoff_ceiling(base, max, 1), Duration::from_secs(1));
        assert_eq!(backoff_ceiling(base, max, 3), Duration::from_secs(4));
        assert_eq!(backoff_ceiling(base, max, 10), max);
        assert_eq!(backoff_ceiling(base, max, 500), max);
    }

    #[test]
    fn jitter_stays_within_twenty_percent() {
        let base = Duration::from_millis(500);
        let max = Duration::from_secs(30);
        for attempt in 0..8 {
            let ceiling = backoff_ceiling(base, max, attempt).as_secs_f64();
            for _ in 0..50 {
                let d = compute_backoff(base, max, attempt).as_secs_f64();
                assert!(d >= ceiling * 0.8 - 1e-9 && d <= ceiling * 1.2 + 1e-9, "{d} vs {ceiling}");
            }
        }
    }

    #[test]
    fn retry_after_forms() {
        let now = DateTime::parse_from_rfc2822("Wed, 21 Oct 2015 07:28:00 GMT").unwrap().with_timezone(&Utc);
        assert_eq!(parse_retry_after("120", now), Some(Duration::from_secs(120)));
        assert_eq!(parse_retry_after(" 0 ", now), Some(Duration::ZERO));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:30 GMT", now), Some(Duration::from_secs(30)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:00:00 GMT", now), Some(Duration::ZERO));
        assert_eq!(parse_retry_after("-5", now), None);
        assert_eq!(parse_retry_after("soon", now), None);
    }

    #[test]
    fn body_is_capped_on_char_boundary() {
        assert_eq!(truncate_body("short", 10), "short");
        assert_eq!(truncate_body("abcdef", 3), "abc…");
        // 'é' is two bytes; cutting at 1 must not split it
        assert_eq!(truncate_body("éé", 1), "…");
    }

    /// Serves one scripted raw response per connection.
    async fn scripted_server(responses: Vec<&'static str>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            for resp in responses {
                let Ok((mut stream, _)) = listener.accept().await else { return };
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf).await;
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = stream.write_all(resp.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });
        (format!("http://{addr}/info"), hits)
    }

    const OK: &str = "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 11\r\nConnection: close\r\n\r\n{\"ok\":true}";
    const BUSY: &str = "HTTP/1.1 503 Service Unavailable\r\nRetry-After: 0\r\nContent-Length: 4\r\nConnection: close\r\n\r\nbusy";
    const LIMITED: &str = "HTTP/1.1 429 Too Many Requests\r\nContent-Length: 4\r\nConnection: close\r\n\r\nslow";
    const TRUNCATED: &str = "HTTP/1.1 200 OK\r\nContent-Length: 100\r\nConnection: close\r\n\r\n{\"ok\"";
    const MISSING: &str = "HTTP/1.1 404 Not Found\r\nContent-Length: 4\r\nConnection: close\r\n\r\nnope";

    fn fast() -> RetryClient {
        RetryClient::new(RetryPolicy { base: Duration::from_millis(1), max: Duration::from_millis(5), max_attempts: 4 })
    }

    #[tokio::test]
    async fn retries_server_errors_then_succeeds() {
        let (url, hits) = scripted_server(vec![BUSY, LIMITED, OK]).await;
        let v: serde_json::Value = fast()
            .post_json(&url, &serde_json::json!({"type": "userFills"}), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(v["ok"], true);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let (url, hits) = scripted_server(vec![MISSING, OK]).await;
        let err = fast()
            .post_json::<_, serde_json::Value>(&url, &serde_json::json!({}), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HttpError::Status { status: 404, ref body } if body == "nope"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let (url, hits) = scripted_server(vec![BUSY, BUSY, BUSY, BUSY, OK]).await;
        let err = fast()
            .post_json::<_, serde_json::Value>(&url, &serde_json::json!({}), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HttpError::Exhausted { attempts: 4, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_sending() {
        let token = CancellationToken::new();
        token.cancel();
        let err = fast()
            .post_json::<_, serde_json::Value>("http://127.0.0.1:9/info", &serde_json::json!({}), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, HttpError::Cancelled));
    }

    #[tokio::test]
    async fn cut_off_body_is_retried() {
        let (url, hits) = scripted_server(vec![TRUNCATED, OK]).await;
        let v: serde_json::Value = fast()
            .post_json(&url, &serde_json::json!({}), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(v["ok"], true);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn builder_runs_once_per_attempt() {
        let (url, hits) = scripted_server(vec![BUSY, BUSY, OK]).await;
        let client = fast();
        let builds = AtomicUsize::new(0);
        let body = client
            .execute_with(
                || {
                    let n = builds.fetch_add(1, Ordering::SeqCst);
                    Ok(client.inner().post(&url).body(format!("nonce={n}")).build()?)
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(body, b"{\"ok\":true}".to_vec());
        assert_eq!(builds.load(Ordering::SeqCst), 3);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn builder_error_is_not_retried() {
        let builds = AtomicUsize::new(0);
        let err = fast()
            .execute_with(
                || {
                    builds.fetch_add(1, Ordering::SeqCst);
                    Err(HttpError::Build("bad key".into()))
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HttpError::Build(_)));
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }
}
