//! # Holdfast Gateway
//!
//! Session-aware TCP front-end for the Holdfast system.
//!
//! This crate provides:
//! - Per-connection handling with worker-pool dispatch of inbound payloads
//! - A process-wide registry of connections indexed by connection id and,
//!   after logon, session id
//! - A TCP server that mints connection ids and registers handlers
//! - Gateway configuration with TOML and environment overrides
//!
//! Framing is the application's concern: whatever one socket read yields is
//! handed to the [`Service`] hook as one opaque payload, and whatever bytes
//! are passed to `send` are written verbatim.
//!
//! ## Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use holdfast_core::{Channel, WorkerPool};
//! use holdfast_gateway::{ConnectionManager, GatewayConfig, TcpServer, UpstreamService};
//!
//! # async fn example() -> holdfast_core::Result<()> {
//! let config = GatewayConfig::default();
//! let manager = ConnectionManager::new();
//! let upstream = Channel::new();
//! let service = Arc::new(UpstreamService::new(upstream.clone()));
//!
//! let mut server = TcpServer::new(
//!     config.network,
//!     Arc::clone(&manager),
//!     service,
//!     WorkerPool::global(),
//! );
//! let addr = server.start().await?;
//! println!("listening on {addr}");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod handler;
pub mod manager;
pub mod server;

pub use config::{GatewayConfig, NetworkConfig, RuntimeConfig, StorageConfig};
pub use handler::{
    ConnectionHandler, ConnectionId, InboundFrame, Service, SessionId, UpstreamService,
};
pub use manager::ConnectionManager;
pub use server::TcpServer;

pub use holdfast_core::{Error, Result};
