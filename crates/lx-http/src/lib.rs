//! HTTP RPC channel to the remote execution endpoint.
//!
//! One shared hyper client (TLS via rustls, HTTP/1.1 + HTTP/2, pooled
//! connections) behind a retry loop: connection errors, 5xx, and read
//! timeouts back off with full jitter and re-send, bounded by a retry count
//! and an overall deadline. The Authorization header is re-read from the
//! token provider immediately before every attempt, so a token refreshed
//! mid-retry is picked up.

use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use thiserror::Error;
use tracing::{debug, warn};

type HttpsConnector =
    hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>;

/// Error kinds surfaced by the channel, categorizing where a call died.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("invalid URI: {0}")]
    InvalidUri(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("TLS failure: {0}")]
    Tls(String),

    #[error("request write failed: {0}")]
    Write(String),

    #[error("response read timed out")]
    ReadTimeout,

    #[error("HTTP {0}")]
    Status(u16),

    #[error("malformed response: {0}")]
    Parse(String),

    #[error("deadline exceeded after {attempts} attempts; last error: {last}")]
    DeadlineExceeded { attempts: u32, last: String },
}

impl HttpError {
    /// Errors worth another attempt: transport failures and server errors.
    pub fn is_retryable(&self) -> bool {
        match self {
            HttpError::Connect(_)
            | HttpError::Tls(_)
            | HttpError::Write(_)
            | HttpError::ReadTimeout => true,
            HttpError::Status(code) => *code >= 500,
            _ => false,
        }
    }
}

/// Supplies the `Authorization` header value, e.g. `Bearer ya29...`.
/// An empty answer means "send no header".
pub trait TokenProvider: Send + Sync {
    fn authorization(&self) -> Option<String>;
}

/// A provider that never authenticates.
pub struct NoAuth;

impl TokenProvider for NoAuth {
    fn authorization(&self) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone)]
pub struct HttpRpcOptions {
    /// Scheme + authority, e.g. `https://exec.example.com:443`
    pub endpoint: String,
    pub user_agent: String,
    pub content_type: String,
    pub max_retries: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    /// Overall per-call deadline, spanning all retries
    pub deadline: Duration,
}

impl Default for HttpRpcOptions {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            user_agent: "lynx-proxy".to_string(),
            content_type: "binary/x-protocol-buffer".to_string(),
            max_retries: 5,
            min_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
            deadline: Duration::from_secs(300),
        }
    }
}

/// Get the shared HTTPS client instance
fn client() -> &'static Client<HttpsConnector, Full<Bytes>> {
    static CLIENT: OnceLock<Client<HttpsConnector, Full<Bytes>>> = OnceLock::new();
    CLIENT.get_or_init(|| {
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()
            .expect("failed to load native roots")
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();

        Client::builder(TokioExecutor::new()).build(https)
    })
}

/// One-shot request through the shared client, no retries. The credential
/// refresher uses this for token endpoints (metadata server, oauth2, LUCI
/// local auth), which have their own retry policy.
pub async fn fetch(
    req: Request<Full<Bytes>>,
    timeout: Duration,
) -> Result<(u16, Vec<u8>), HttpError> {
    let response = tokio::time::timeout(timeout, client().request(req))
        .await
        .map_err(|_| HttpError::ReadTimeout)?
        .map_err(classify_client_error)?;

    let status = response.status().as_u16();
    let collected = tokio::time::timeout(timeout, response.into_body().collect())
        .await
        .map_err(|_| HttpError::ReadTimeout)?
        .map_err(|e| HttpError::Parse(e.to_string()))?;

    Ok((status, collected.to_bytes().to_vec()))
}

/// The RPC channel.
#[derive(Clone)]
pub struct HttpRpc {
    options: HttpRpcOptions,
    auth: Arc<dyn TokenProvider>,
}

impl HttpRpc {
    pub fn new(options: HttpRpcOptions, auth: Arc<dyn TokenProvider>) -> Self {
        Self { options, auth }
    }

    pub fn options(&self) -> &HttpRpcOptions {
        &self.options
    }

    /// POST `body` to `path`, retrying per the configured policy. Returns
    /// the response body bytes on HTTP 200.
    pub async fn call(&self, path: &str, body: Vec<u8>) -> Result<Vec<u8>, HttpError> {
        let start = Instant::now();
        let body = Bytes::from(body);
        let mut backoff = self.options.min_backoff.max(Duration::from_millis(1));
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let remaining = match self.options.deadline.checked_sub(start.elapsed()) {
                Some(r) if !r.is_zero() => r,
                _ => {
                    return Err(HttpError::DeadlineExceeded {
                        attempts,
                        last: "deadline elapsed before send".to_string(),
                    })
                }
            };

            let (error, retry_after) = match self.attempt(path, body.clone(), remaining).await {
                Ok(bytes) => return Ok(bytes),
                Err(pair) => pair,
            };

            let out_of_attempts = attempts > self.options.max_retries;
            if !error.is_retryable() || out_of_attempts {
                if out_of_attempts && error.is_retryable() {
                    return Err(HttpError::DeadlineExceeded {
                        attempts,
                        last: error.to_string(),
                    });
                }
                return Err(error);
            }

            // full jitter, but Retry-After wins when the server sent one
            let sleep = match retry_after {
                Some(after) => after,
                None => jitter(backoff),
            };
            if start.elapsed() + sleep >= self.options.deadline {
                return Err(HttpError::DeadlineExceeded {
                    attempts,
                    last: error.to_string(),
                });
            }

            debug!(
                attempt = attempts,
                sleep_ms = sleep.as_millis() as u64,
                error = %error,
                "rpc retry"
            );
            tokio::time::sleep(sleep).await;
            backoff = (backoff * 2).min(self.options.max_backoff);
        }
    }

    /// Probe `GET /healthz` on the endpoint; no retries. Used when responses
    /// stall to tell "server is gone" from "compile is slow".
    pub async fn healthz(&self) -> Result<(), HttpError> {
        let uri = format!("{}/healthz", self.options.endpoint);
        let req = Request::get(&uri)
            .header(hyper::header::USER_AGENT, &self.options.user_agent)
            .body(Full::new(Bytes::new()))
            .map_err(|e| HttpError::InvalidUri(e.to_string()))?;

        let response = tokio::time::timeout(Duration::from_secs(5), client().request(req))
            .await
            .map_err(|_| HttpError::ReadTimeout)?
            .map_err(classify_client_error)?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(HttpError::Status(response.status().as_u16()))
        }
    }

    async fn attempt(
        &self,
        path: &str,
        body: Bytes,
        timeout: Duration,
    ) -> Result<Vec<u8>, (HttpError, Option<Duration>)> {
        let uri = format!("{}{}", self.options.endpoint, path);

        let mut builder = Request::post(&uri)
            .header(hyper::header::CONTENT_TYPE, &self.options.content_type)
            .header(hyper::header::USER_AGENT, &self.options.user_agent);
        if let Some(auth) = self.auth.authorization() {
            if !auth.is_empty() {
                builder = builder.header(hyper::header::AUTHORIZATION, auth);
            }
        }
        let req = builder
            .body(Full::new(body))
            .map_err(|e| (HttpError::InvalidUri(e.to_string()), None))?;

        let response: Response<Incoming> = tokio::time::timeout(timeout, client().request(req))
            .await
            .map_err(|_| (HttpError::ReadTimeout, None))?
            .map_err(|e| (classify_client_error(e), None))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(&response);
            if status.as_u16() >= 500 {
                warn!(status = status.as_u16(), uri = %uri, "rpc server error");
            }
            return Err((HttpError::Status(status.as_u16()), retry_after));
        }

        let collected = tokio::time::timeout(timeout, response.into_body().collect())
            .await
            .map_err(|_| (HttpError::ReadTimeout, None))?
            .map_err(|e| (HttpError::Parse(e.to_string()), None))?;

        Ok(collected.to_bytes().to_vec())
    }
}

fn classify_client_error(e: hyper_util::client::legacy::Error) -> HttpError {
    let text = format!("{e:?}");
    if e.is_connect() {
        // rustls failures surface through the connector
        if text.contains("Tls") || text.contains("tls") || text.contains("certificate") {
            return HttpError::Tls(e.to_string());
        }
        return HttpError::Connect(e.to_string());
    }
    HttpError::Write(e.to_string())
}

fn parse_retry_after(response: &Response<Incoming>) -> Option<Duration> {
    let value = response.headers().get(hyper::header::RETRY_AFTER)?;
    let seconds: u64 = value.to_str().ok()?.trim().parse().ok()?;
    Some(Duration::from_secs(seconds))
}

fn jitter(backoff: Duration) -> Duration {
    let max = backoff.as_millis().max(1) as u64;
    Duration::from_millis(rand::random_range(0..=max))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// A scripted HTTP/1.1 server: each accepted connection gets the next
    /// canned response.
    async fn scripted_server(responses: Vec<String>) -> (String, Arc<AtomicU32>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicU32::new(0));
        let hits_clone = hits.clone();

        tokio::spawn(async move {
            for response in responses {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                hits_clone.fetch_add(1, Ordering::SeqCst);
                let mut buf = vec![0u8; 65536];
                // read at least the headers; requests here are small
                let _ = stream.read(&mut buf).await;
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });

        (format!("http://{addr}"), hits)
    }

    fn ok_response(body: &str) -> String {
        format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        )
    }

    fn error_response(code: u16) -> String {
        format!("HTTP/1.1 {code} X\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
    }

    fn options(endpoint: String) -> HttpRpcOptions {
        HttpRpcOptions {
            endpoint,
            min_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            max_retries: 3,
            deadline: Duration::from_secs(10),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn success_returns_body() {
        let (endpoint, hits) = scripted_server(vec![ok_response("pong")]).await;
        let rpc = HttpRpc::new(options(endpoint), Arc::new(NoAuth));
        let body = rpc.call("/exec", b"ping".to_vec()).await.unwrap();
        assert_eq!(body, b"pong");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_5xx_then_succeeds() {
        let (endpoint, hits) =
            scripted_server(vec![error_response(503), error_response(500), ok_response("ok")])
                .await;
        let rpc = HttpRpc::new(options(endpoint), Arc::new(NoAuth));
        let body = rpc.call("/exec", vec![]).await.unwrap();
        assert_eq!(body, b"ok");
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_after_header_is_honored() {
        let (endpoint, hits) = scripted_server(vec![
            "HTTP/1.1 503 X\r\nRetry-After: 0\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                .to_string(),
            ok_response("ok"),
        ])
        .await;
        let rpc = HttpRpc::new(options(endpoint), Arc::new(NoAuth));
        let body = rpc.call("/exec", vec![]).await.unwrap();
        assert_eq!(body, b"ok");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn does_not_retry_4xx() {
        let (endpoint, hits) = scripted_server(vec![error_response(403)]).await;
        let rpc = HttpRpc::new(options(endpoint), Arc::new(NoAuth));
        let err = rpc.call("/exec", vec![]).await.unwrap_err();
        assert!(matches!(err, HttpError::Status(403)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_deadline_error() {
        let responses: Vec<String> = (0..8).map(|_| error_response(500)).collect();
        let (endpoint, hits) = scripted_server(responses).await;
        let rpc = HttpRpc::new(options(endpoint), Arc::new(NoAuth));
        let err = rpc.call("/exec", vec![]).await.unwrap_err();
        assert!(matches!(err, HttpError::DeadlineExceeded { attempts: 4, .. }));
        // max_retries=3 means 4 attempts total
        assert_eq!(hits.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn connection_refused_is_retryable_connect_error() {
        // bind and drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut opts = options(format!("http://{addr}"));
        opts.max_retries = 1;
        let rpc = HttpRpc::new(opts, Arc::new(NoAuth));
        let err = rpc.call("/exec", vec![]).await.unwrap_err();
        assert!(matches!(err, HttpError::DeadlineExceeded { attempts: 2, .. }));
    }

    struct StaticToken;

    impl TokenProvider for StaticToken {
        fn authorization(&self) -> Option<String> {
            Some("Bearer sesame".to_string())
        }
    }

    #[tokio::test]
    async fn authorization_header_is_sent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 65536];
            let n = stream.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            let _ = stream.write_all(ok_response("").as_bytes()).await;
            let _ = stream.shutdown().await;
            request
        });

        let rpc = HttpRpc::new(options(format!("http://{addr}")), Arc::new(StaticToken));
        rpc.call("/exec", vec![]).await.unwrap();

        let request = server.await.unwrap();
        assert!(request.contains("authorization: Bearer sesame"));
    }

    #[tokio::test]
    async fn healthz_probes_endpoint() {
        let (endpoint, _) = scripted_server(vec![ok_response("ok")]).await;
        let rpc = HttpRpc::new(options(endpoint), Arc::new(NoAuth));
        rpc.healthz().await.unwrap();
    }
}
