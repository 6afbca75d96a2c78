//! Forwarding to the upstream dev server
//!
//! Connection establishment is retried with a fixed delay because the dev
//! server usually starts listening a few seconds after it is spawned. Only the
//! connect phase is retried: once a connection exists the request body is
//! streamed into it and cannot be replayed.

use crate::error::{booting_response, error_response, ProxyErrorCode};
use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Body, Bytes, Incoming};
use hyper::{Request, Response, Uri};
use hyper_util::rt::TokioIo;
use std::fmt;
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Body type of every response the proxy returns
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Upstream endpoint the proxy forwards to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetAddress {
    pub host: String,
    pub port: u16,
}

impl NetAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// The loopback address the dev server is expected to bind
    pub fn loopback(port: u16) -> Self {
        Self::new("127.0.0.1", port)
    }
}

impl fmt::Display for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Bounded retry with a fixed delay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub retries: u32,
    /// Pause before each retry
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 5,
            delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn start(&self) -> RetryState {
        RetryState {
            remaining: self.retries,
            delay: self.delay,
            attempts: 0,
        }
    }
}

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStep {
    /// Sleep for the given delay, then attempt again
    Wait(Duration),
    /// Retries are exhausted
    GiveUp,
}

/// Retry bookkeeping for one forwarded request
#[derive(Debug, Clone)]
pub struct RetryState {
    remaining: u32,
    delay: Duration,
    attempts: u32,
}

impl RetryState {
    /// Record a failed attempt and decide whether to try again
    pub fn on_failure(&mut self) -> RetryStep {
        self.attempts += 1;
        if self.remaining == 0 {
            return RetryStep::GiveUp;
        }
        self.remaining -= 1;
        RetryStep::Wait(self.delay)
    }

    /// Attempts that have failed so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Shared, immutable forwarding context for all proxy connections
#[derive(Debug)]
pub struct Upstream {
    target: NetAddress,
    domain: String,
    retry: RetryPolicy,
    connect_timeout: Duration,
}

impl Upstream {
    pub fn new(target: NetAddress, domain: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            target,
            domain: domain.into(),
            retry,
            connect_timeout: Duration::from_secs(2),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn target(&self) -> &NetAddress {
        &self.target
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// A single connect attempt, bounded by the connect timeout
    pub async fn connect_once(&self) -> io::Result<TcpStream> {
        let connect = TcpStream::connect((self.target.host.as_str(), self.target.port));
        let stream = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "upstream connect timed out"))??;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// Connect, retrying per the retry policy while the upstream is not listening
    pub async fn connect_with_retry(&self) -> io::Result<TcpStream> {
        let mut state = self.retry.start();
        loop {
            match self.connect_once().await {
                Ok(stream) => return Ok(stream),
                Err(e) => match state.on_failure() {
                    RetryStep::Wait(delay) => {
                        debug!(
                            upstream = %self.target,
                            attempt = state.attempts(),
                            error = %e,
                            "Upstream not reachable yet, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    RetryStep::GiveUp => {
                        warn!(
                            upstream = %self.target,
                            attempts = state.attempts(),
                            error = %e,
                            "Upstream unreachable, giving up"
                        );
                        return Err(e);
                    }
                },
            }
        }
    }

    /// Forward a request and relay the upstream response as-is.
    ///
    /// Exhausted connect retries turn into the 502 "booting or unreachable"
    /// response; they never surface as an error.
    pub async fn forward(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let method = req.method().clone();
        let path = origin_form(req.uri()).to_string();

        let stream = match self.connect_with_retry().await {
            Ok(stream) => stream,
            Err(_) => return booting_response(&self.domain),
        };

        match send_over(stream, rewrite_request(req)).await {
            Ok(response) => {
                debug!(%method, %path, status = %response.status(), "Proxied request");
                response.map(|body| body.boxed())
            }
            Err(e) => {
                warn!(%method, %path, upstream = %self.target, error = %e, "Upstream request failed");
                error_response(
                    ProxyErrorCode::UpstreamFailed,
                    format!("[Portlens] {} failed to respond.", self.domain),
                )
            }
        }
    }
}

/// Send one request over a fresh HTTP/1.1 connection
async fn send_over<B>(stream: TcpStream, req: Request<B>) -> Result<Response<Incoming>, hyper::Error>
where
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "Upstream connection closed with error");
        }
    });
    sender.send_request(req).await
}

/// Keep method, headers and body; point the URI at the path and query only
pub(crate) fn rewrite_request<B>(req: Request<B>) -> Request<B> {
    let (mut parts, body) = req.into_parts();
    parts.uri = origin_uri(&parts.uri);
    Request::from_parts(parts, body)
}

pub(crate) fn origin_form(uri: &Uri) -> &str {
    uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
}

fn origin_uri(uri: &Uri) -> Uri {
    origin_form(uri)
        .parse()
        .unwrap_or_else(|_| Uri::from_static("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_state_is_bounded() {
        let policy = RetryPolicy {
            retries: 2,
            delay: Duration::from_millis(10),
        };
        let mut state = policy.start();

        assert_eq!(state.on_failure(), RetryStep::Wait(Duration::from_millis(10)));
        assert_eq!(state.on_failure(), RetryStep::Wait(Duration::from_millis(10)));
        assert_eq!(state.on_failure(), RetryStep::GiveUp);
        assert_eq!(state.attempts(), 3);
    }

    #[test]
    fn test_zero_retries_gives_up_immediately() {
        let policy = RetryPolicy {
            retries: 0,
            delay: Duration::from_secs(1),
        };
        let mut state = policy.start();
        assert_eq!(state.on_failure(), RetryStep::GiveUp);
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.retries, 5);
        assert_eq!(policy.delay, Duration::from_millis(500));
    }

    #[test]
    fn test_rewrite_request_keeps_headers() {
        let req = Request::builder()
            .method("POST")
            .uri("http://my-app.localhost/api/items?page=2")
            .header("host", "my-app.localhost")
            .header("x-custom", "1")
            .body(())
            .unwrap();

        let rewritten = rewrite_request(req);
        assert_eq!(rewritten.method(), "POST");
        assert_eq!(rewritten.uri(), "/api/items?page=2");
        assert_eq!(rewritten.headers().get("host").unwrap(), "my-app.localhost");
        assert_eq!(rewritten.headers().get("x-custom").unwrap(), "1");
    }

    #[test]
    fn test_origin_form_defaults_to_root() {
        let uri: Uri = "http://example.localhost".parse().unwrap();
        assert_eq!(origin_form(&uri), "/");
    }

    #[test]
    fn test_net_address_display() {
        assert_eq!(NetAddress::loopback(4001).to_string(), "127.0.0.1:4001");
    }

    #[tokio::test]
    async fn test_connect_with_retry_gives_up() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let upstream = Upstream::new(
            NetAddress::loopback(port),
            "gone.localhost",
            RetryPolicy {
                retries: 2,
                delay: Duration::from_millis(10),
            },
        );

        assert!(upstream.connect_with_retry().await.is_err());
    }
}
