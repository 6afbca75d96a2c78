//! Internal port allocation
//!
//! Ports are probed sequentially on the loopback address. A probe binds a
//! throwaway listener and drops it immediately, so another process can still
//! claim the port before the dev server binds it. The wide default range keeps
//! that window small in practice.

use crate::config::PortRange;
use crate::error::PortlensError;
use std::net::{Ipv4Addr, SocketAddr};
use tokio::net::TcpListener;
use tracing::{debug, trace};

/// Return the first port in `start..=end` that can be bound on 127.0.0.1
pub async fn find_available_port(start: u16, end: u16) -> Result<u16, PortlensError> {
    for port in start..=end {
        if port == 0 {
            continue;
        }
        if probe(port).await {
            debug!(port, "Found available port");
            return Ok(port);
        }
        trace!(port, "Port unavailable");
    }

    Err(PortlensError::NoPortAvailable { start, end })
}

impl PortRange {
    pub async fn find_available(&self) -> Result<u16, PortlensError> {
        find_available_port(self.start, self.end).await
    }
}

async fn probe(port: u16) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    match TcpListener::bind(addr).await {
        Ok(listener) => {
            drop(listener);
            true
        }
        Err(_) => false,
    }
}
