//! TCP front-end: bind/accept loop, connection id minting, registration.

use crate::config::NetworkConfig;
use crate::handler::{ConnectionHandler, ConnectionId, Service};
use crate::manager::ConnectionManager;
use chrono::Utc;
use holdfast_core::{Error, Result, WorkerPool};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Mint the next connection id.
///
/// The counter is process-local and seeded from wall-clock milliseconds at
/// first use, making ids unique across restarts with high probability. Do
/// not rely on global uniqueness.
fn next_connection_id() -> ConnectionId {
    static NEXT: OnceLock<AtomicU64> = OnceLock::new();
    let next = NEXT.get_or_init(|| AtomicU64::new(Utc::now().timestamp_millis().unsigned_abs()));
    ConnectionId::new(next.fetch_add(1, Ordering::Relaxed))
}

/// TCP server accepting client connections for the gateway.
///
/// Each accepted socket gets a freshly minted [`ConnectionId`], a
/// [`ConnectionHandler`] registered with the manager, and its own
/// reader/writer tasks.
pub struct TcpServer {
    config: NetworkConfig,
    manager: Arc<ConnectionManager>,
    service: Arc<dyn Service>,
    pool: Arc<WorkerPool>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    accept_task: Option<JoinHandle<()>>,
}

impl TcpServer {
    /// Create a server over `manager`, dispatching payloads to `service`
    /// via `pool`.
    #[must_use]
    pub fn new(
        config: NetworkConfig,
        manager: Arc<ConnectionManager>,
        service: Arc<dyn Service>,
        pool: Arc<WorkerPool>,
    ) -> Self {
        Self { config, manager, service, pool, shutdown_tx: None, accept_task: None }
    }

    /// Bind the configured address and start accepting connections.
    ///
    /// Returns the actually bound address (useful with port 0).
    ///
    /// # Errors
    /// Returns an error when the server is already running or the bind
    /// fails.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if self.is_running() {
            return Err(Error::Network { message: "server is already running".into() });
        }

        let listener = TcpListener::bind(self.config.bind_address).await.map_err(|e| {
            Error::Network {
                message: format!("failed to bind {}: {e}", self.config.bind_address),
            }
        })?;
        let local_addr = listener.local_addr().map_err(|e| Error::Network {
            message: format!("failed to read local address: {e}"),
        })?;

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx);

        let config = self.config.clone();
        let manager = Arc::clone(&self.manager);
        let service = Arc::clone(&self.service);
        let pool = Arc::clone(&self.pool);
        self.accept_task = Some(tokio::spawn(accept_loop(
            listener,
            config,
            manager,
            service,
            pool,
            shutdown_rx,
        )));

        info!(
            "gateway listening on {local_addr} (max connections: {})",
            self.config.max_connections
        );
        Ok(local_addr)
    }

    /// Signal shutdown and wait for the accept loop to stop.
    ///
    /// Already-accepted connections keep running; only new accepts stop.
    pub async fn stop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }
        info!("gateway stopped");
    }

    /// Whether the accept loop is currently running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.accept_task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

async fn accept_loop(
    listener: TcpListener,
    config: NetworkConfig,
    manager: Arc<ConnectionManager>,
    service: Arc<dyn Service>,
    pool: Arc<WorkerPool>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    handle_accept(stream, peer, &config, &manager, &service, &pool);
                },
                Err(e) => {
                    error!(error = %e, "accept failed");
                    // Brief delay to prevent a tight error loop.
                    tokio::time::sleep(Duration::from_millis(100)).await;
                },
            },
            _ = shutdown_rx.recv() => {
                info!("shutdown signal received; stopping accept loop");
                break;
            },
        }
    }
}

fn handle_accept(
    stream: TcpStream,
    peer: SocketAddr,
    config: &NetworkConfig,
    manager: &Arc<ConnectionManager>,
    service: &Arc<dyn Service>,
    pool: &Arc<WorkerPool>,
) {
    if manager.len() >= config.max_connections {
        warn!(%peer, limit = config.max_connections, "rejecting connection at capacity");
        drop(stream);
        return;
    }

    if let Err(e) = configure_socket(&stream) {
        warn!(%peer, error = %e, "socket tuning failed");
    }

    let id = next_connection_id();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let handler = ConnectionHandler::new(
        id,
        peer,
        outbound_tx,
        Arc::clone(service),
        Arc::clone(pool),
        Arc::downgrade(manager),
    );

    manager.register(id, Arc::clone(&handler));
    handler.spawn_io(stream, outbound_rx);

    info!(connection = %id, %peer, total = manager.len(), "accepted connection");
}

/// Low-latency socket options for accepted connections.
fn configure_socket(stream: &TcpStream) -> std::io::Result<()> {
    use socket2::{SockRef, TcpKeepalive};

    let socket = SockRef::from(stream);
    socket.set_nodelay(true)?;

    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(60))
        .with_interval(Duration::from_secs(10));
    socket.set_tcp_keepalive(&keepalive)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::UpstreamService;
    use holdfast_core::Channel;

    fn test_server(max_connections: usize) -> TcpServer {
        let config = NetworkConfig {
            bind_address: "127.0.0.1:0".parse().unwrap(),
            max_connections,
        };
        TcpServer::new(
            config,
            ConnectionManager::new(),
            Arc::new(UpstreamService::new(Channel::new())),
            Arc::new(WorkerPool::new(1)),
        )
    }

    #[test]
    fn test_connection_ids_are_monotonic() {
        let first = next_connection_id();
        let second = next_connection_id();
        assert!(second.value() > first.value());
    }

    #[tokio::test]
    async fn test_server_lifecycle() {
        let mut server = test_server(4);
        assert!(!server.is_running());

        let addr = server.start().await.unwrap();
        assert!(server.is_running());
        assert_ne!(addr.port(), 0);

        assert!(server.start().await.is_err(), "double start must fail");

        server.stop().await;
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_stop_without_start_is_harmless() {
        let mut server = test_server(4);
        server.stop().await;
        assert!(!server.is_running());
    }
}
