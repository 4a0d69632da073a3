//! WebSocket sync server.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!            ├── accept ── SyncSession (per connection) ──┐
//! Client B ──┘                                            ├── Replica
//!                                                         │   (shared log)
//!     Update from any session's DIFF ◄────────────────────┘
//!            └──► forwarded as DIFF to every other session
//! ```
//!
//! Every connection runs its own session against the server's replica.
//! Ops merged from one peer surface as log events and flow out to the rest.

use std::net::SocketAddr;
use std::sync::Arc;

use spore_core::Replica;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, RwLock};

use crate::duplex;
use crate::protocol::ProtocolError;
use crate::session::SessionState;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub failed_connections: u64,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    replica: Replica,
    stats: Arc<RwLock<ServerStats>>,
    shutdown: watch::Sender<bool>,
}

impl SyncServer {
    pub fn new(replica: Replica, config: ServerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            replica,
            stats: Arc::new(RwLock::new(ServerStats::default())),
            shutdown,
        }
    }

    pub fn with_defaults(replica: Replica) -> Self {
        Self::new(replica, ServerConfig::default())
    }

    /// Bind the configured address and accept connections until shutdown.
    pub async fn run(&self) -> Result<(), ProtocolError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ProtocolError> {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow_and_update() {
            return Ok(());
        }

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    log::debug!("New TCP connection from {addr}");

                    let replica = self.replica.clone();
                    let stats = self.stats.clone();
                    let shutdown = self.shutdown.subscribe();
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(stream, addr, replica, stats, shutdown).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
                _ = shutdown.changed() => {
                    log::info!("Sync server shutting down");
                    return Ok(());
                }
            }
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        replica: Replica,
        stats: Arc<RwLock<ServerStats>>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), ProtocolError> {
        let ws_stream = match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                stats.write().await.failed_connections += 1;
                return Err(e.into());
            }
        };
        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let state = Arc::new(RwLock::new(SessionState::NotSynced));
        let result = duplex::drive(ws_stream, replica, addr.to_string(), state, shutdown).await;

        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        log::info!("Connection from {addr} closed");
        result
    }

    /// Stop accepting and close every open session.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn replica(&self) -> &Replica {
        &self.replica
    }
}
