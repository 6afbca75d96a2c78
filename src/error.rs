//! Error types for startup failures and error responses served by the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Errors that abort a portlens session before or during startup.
///
/// Every variant is fatal: the CLI reports it once, together with
/// [`PortlensError::hint`], and exits with code 1.
#[derive(Debug, thiserror::Error)]
pub enum PortlensError {
    /// No port in the scanned range could be bound
    #[error("No free ports found in range {start}-{end}")]
    NoPortAvailable { start: u16, end: u16 },

    /// The hosts file could not be read or the privileged write was refused
    #[error("{message}")]
    PermissionDenied {
        message: String,
        hint: &'static str,
    },

    /// The current operating system has no domain mapping support
    #[error("Platform {platform} is not supported")]
    PlatformUnsupported { platform: String },

    /// Neither a project config file nor a package manifest was found
    #[error("No project detected in {}", dir.display())]
    NoProjectDetected { dir: PathBuf },

    /// The resolved name cannot form a hostname
    #[error("Invalid domain name '{name}'")]
    InvalidDomain { name: String },

    /// The primary proxy port and every fallback were rejected
    #[error("Permission Denied: Cannot bind the proxy to port {port}")]
    ProxyBindExhausted { port: u16 },

    /// The proxy listener failed for a reason other than a busy or restricted port
    #[error("Proxy Error: failed to listen on {addr}: {source}")]
    ProxyListen {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The wrapped command could not be started
    #[error("Failed to start '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

impl PortlensError {
    /// Remediation hint printed under the error message
    pub fn hint(&self) -> Option<&str> {
        match self {
            PortlensError::PermissionDenied { hint, .. } => Some(*hint),
            PortlensError::NoProjectDetected { .. } => Some(
                "Run portlens inside a project (portlens.json or package.json), or pass a name: portlens my-app <command>",
            ),
            PortlensError::ProxyBindExhausted { .. } => {
                Some("Portlens needs sudo/administrator rights to use Port 80.")
            }
            PortlensError::NoPortAvailable { .. } => {
                Some("Stop some local servers or widen the \"ports\" range in portlens.json.")
            }
            PortlensError::InvalidDomain { .. } => {
                Some("Use letters, digits and dashes for the project name.")
            }
            _ => None,
        }
    }
}

/// Error codes for responses the proxy generates itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyErrorCode {
    /// The upstream dev server never accepted a connection
    UpstreamUnreachable,
    /// The upstream accepted the connection but the exchange failed
    UpstreamFailed,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::UpstreamUnreachable => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::UpstreamFailed => StatusCode::BAD_GATEWAY,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::UpstreamUnreachable => "UPSTREAM_UNREACHABLE",
            ProxyErrorCode::UpstreamFailed => "UPSTREAM_FAILED",
        }
    }
}

/// Create a plain-text error response with X-Proxy-Error header
pub fn error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut response = Response::new(
        Full::new(Bytes::from(message.into()))
            .map_err(|never| match never {})
            .boxed(),
    );
    *response.status_mut() = code.status_code();
    let headers = response.headers_mut();
    headers.insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(
        "x-proxy-error",
        hyper::header::HeaderValue::from_static(code.as_header_value()),
    );
    response
}

/// The 502 served once retries against a booting upstream are exhausted
pub fn booting_response(domain: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    error_response(
        ProxyErrorCode::UpstreamUnreachable,
        format!("[Portlens] {} is booting or unreachable.", domain),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            ProxyErrorCode::UpstreamUnreachable.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyErrorCode::UpstreamFailed.status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[tokio::test]
    async fn test_booting_response_names_domain() {
        let response = booting_response("my-app.localhost");

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            response.headers().get("x-proxy-error").unwrap(),
            "UPSTREAM_UNREACHABLE"
        );
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/plain; charset=utf-8"
        );

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(
            body,
            Bytes::from("[Portlens] my-app.localhost is booting or unreachable.")
        );
    }

    #[test]
    fn test_fatal_errors_carry_hints() {
        let err = PortlensError::NoProjectDetected {
            dir: PathBuf::from("/tmp"),
        };
        assert!(err.to_string().contains("No project detected"));
        assert!(err.hint().is_some());

        let err = PortlensError::ProxyBindExhausted { port: 80 };
        assert!(err.to_string().contains("port 80"));
        assert!(err.hint().unwrap().contains("Port 80"));

        let err = PortlensError::PlatformUnsupported {
            platform: "plan9".to_string(),
        };
        assert_eq!(err.to_string(), "Platform plan9 is not supported");
        assert!(err.hint().is_none());
    }
}
