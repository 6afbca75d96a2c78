//! Portlens - serve a local dev server on a stable domain
//!
//! A single `portlens` session:
//! - Resolves the project name and picks a free internal port (4000-4999)
//! - Maps `<name>.localhost` to 127.0.0.1 in the system hosts file
//! - Runs a reverse proxy on port 80 (or a fallback) that forwards HTTP and
//!   WebSocket traffic to the internal port, retrying while the server boots
//! - Runs the dev command with `PORT` set and removes the mapping on exit

pub mod cli;
pub mod config;
pub mod doctor;
pub mod error;
pub mod frameworks;
pub mod hosts;
pub mod orchestrator;
pub mod ports;
pub mod proxy;
pub mod supervisor;
pub mod upstream;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
