//! The public-facing reverse proxy
//!
//! A [`ProxySession`] owns the listening socket. It is bound once, trying the
//! configured primary port and then each fallback port in order, and then
//! consumed by [`ProxySession::serve`]. Every connection shares the same
//! immutable [`Upstream`].

use crate::config::ProxySettings;
use crate::error::PortlensError;
use crate::upstream::{origin_form, NetAddress, ProxyBody, Upstream};
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// A bound proxy listener, ready to serve
pub struct ProxySession {
    listener: TcpListener,
    local_addr: SocketAddr,
    primary_port: u16,
    remaining_fallbacks: Vec<u16>,
    upstream: Arc<Upstream>,
}

impl ProxySession {
    /// Bind the public port.
    ///
    /// `AddrInUse` and `PermissionDenied` move on to the next fallback port;
    /// any other error, or running out of fallbacks, is fatal.
    pub async fn bind(
        settings: &ProxySettings,
        target: NetAddress,
        domain: impl Into<String>,
    ) -> Result<Self, PortlensError> {
        let mut fallbacks: VecDeque<u16> = settings.fallback_ports.iter().copied().collect();
        let mut port = settings.port;

        let listener = loop {
            let addr = SocketAddr::new(settings.bind, port);
            match TcpListener::bind(addr).await {
                Ok(listener) => break listener,
                Err(e) if is_recoverable_bind_error(&e) => {
                    let Some(next) = fallbacks.pop_front() else {
                        error!(port = settings.port, error = %e, "All proxy ports rejected");
                        return Err(PortlensError::ProxyBindExhausted {
                            port: settings.port,
                        });
                    };
                    warn!(port, next, error = %e, "Port busy or restricted, trying fallback port");
                    port = next;
                }
                Err(source) => return Err(PortlensError::ProxyListen { addr, source }),
            }
        };

        let local_addr = listener
            .local_addr()
            .map_err(|source| PortlensError::ProxyListen {
                addr: SocketAddr::new(settings.bind, port),
                source,
            })?;

        let upstream = Upstream::new(target, domain, settings.retry_policy())
            .with_connect_timeout(settings.connect_timeout());

        info!(addr = %local_addr, upstream = %upstream.target(), domain = upstream.domain(), "Proxy bound");

        Ok(Self {
            listener,
            local_addr,
            primary_port: settings.port,
            remaining_fallbacks: fallbacks.into_iter().collect(),
            upstream: Arc::new(upstream),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// True when the listener ended up on a fallback port
    pub fn fell_back(&self) -> bool {
        self.primary_port != 0 && self.local_addr.port() != self.primary_port
    }

    pub fn primary_port(&self) -> u16 {
        self.primary_port
    }

    /// Fallback ports that were not needed
    pub fn remaining_fallbacks(&self) -> &[u16] {
        &self.remaining_fallbacks
    }

    pub fn upstream(&self) -> &Upstream {
        &self.upstream
    }

    /// Accept connections until the shutdown channel flips to `true`
    pub async fn serve(self, mut shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<()> {
        info!(addr = %self.local_addr, "Proxy server listening");

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let _ = stream.set_nodelay(true);
                            let upstream = Arc::clone(&self.upstream);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, upstream).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    // A dropped sender can never signal again
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

fn is_recoverable_bind_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::AddrInUse | io::ErrorKind::PermissionDenied
    )
}

async fn handle_connection<S>(stream: S, upstream: Arc<Upstream>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let upstream = Arc::clone(&upstream);
        async move { handle_request(req, upstream).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

/// Returning `Err` makes hyper drop the client connection without a response
async fn handle_request(
    req: Request<Incoming>,
    upstream: Arc<Upstream>,
) -> Result<Response<ProxyBody>, io::Error> {
    debug!(method = %req.method(), uri = %req.uri(), "Incoming request");

    if is_upgrade_request(&req) {
        return handle_upgrade(req, upstream).await;
    }

    Ok(upstream.forward(req).await)
}

/// Check if a request asks for a protocol upgrade (WebSocket and friends)
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    // Check for Connection: Upgrade header (case-insensitive value check)
    let has_upgrade_connection = req
        .headers()
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.to_ascii_lowercase().contains("upgrade"));

    let has_upgrade_header = req.headers().contains_key(hyper::header::UPGRADE);

    has_upgrade_connection && has_upgrade_header
}

/// Forward the handshake on its own upstream connection and, once upstream
/// switches protocols, splice client and upstream byte for byte.
async fn handle_upgrade(
    mut req: Request<Incoming>,
    upstream: Arc<Upstream>,
) -> Result<Response<ProxyBody>, io::Error> {
    let upgrade_type = req
        .headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_lowercase();
    let path = origin_form(req.uri()).to_string();
    debug!(path, upgrade_type, "Handling upgrade request");

    let client_upgrade = hyper::upgrade::on(&mut req);

    let stream = upstream.connect_once().await.map_err(|e| {
        warn!(upstream = %upstream.target(), error = %e, "Failed to connect to upstream for upgrade");
        e
    })?;

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(io::Error::other)?;
    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            debug!(error = %e, "Upstream upgrade connection error");
        }
    });

    let (parts, _body) = req.into_parts();
    let mut upstream_req = Request::new(Empty::<Bytes>::new());
    *upstream_req.method_mut() = parts.method;
    *upstream_req.uri_mut() = path.parse().map_err(io::Error::other)?;
    *upstream_req.headers_mut() = parts.headers;

    let mut upstream_res = sender.send_request(upstream_req).await.map_err(|e| {
        warn!(upstream = %upstream.target(), error = %e, "Upstream upgrade handshake failed");
        io::Error::other(e)
    })?;

    if upstream_res.status() != StatusCode::SWITCHING_PROTOCOLS {
        warn!(status = %upstream_res.status(), path, "Upstream rejected upgrade request");
        return Ok(upstream_res.map(|body| body.boxed()));
    }

    let upstream_upgrade = hyper::upgrade::on(&mut upstream_res);

    let mut response = Response::new(Empty::<Bytes>::new().map_err(|never| match never {}).boxed());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    *response.headers_mut() = upstream_res.headers().clone();

    tokio::spawn(async move {
        let (client, backend) = match tokio::try_join!(client_upgrade, upstream_upgrade) {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, "Upgrade did not complete");
                return;
            }
        };
        let mut client_io = TokioIo::new(client);
        let mut backend_io = TokioIo::new(backend);

        match tokio::io::copy_bidirectional(&mut client_io, &mut backend_io).await {
            Ok((client_to_upstream, upstream_to_client)) => {
                debug!(
                    path,
                    client_to_upstream,
                    upstream_to_client,
                    "Upgraded connection closed normally"
                );
            }
            Err(e) => {
                debug!(path, error = %e, "Upgraded connection closed with error");
            }
        }
    });

    info!(upgrade_type, "Upgrade successful");
    Ok(response)
}
