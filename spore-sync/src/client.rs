//! WebSocket sync client.
//!
//! Connects a replica to a remote sync server and keeps the session
//! running in a background task until [`SyncClient::close`] or the
//! remote end hangs up.

use std::sync::Arc;

use spore_core::Replica;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;

use crate::duplex;
use crate::protocol::ProtocolError;
use crate::session::SessionState;

pub struct SyncClient {
    replica: Replica,

    /// Server URL, e.g. `ws://127.0.0.1:9090`
    server_url: String,

    /// Session state, updated by the connection task
    state: Arc<RwLock<SessionState>>,

    /// Signals the connection task to send Close and stop
    shutdown: Option<watch::Sender<bool>>,

    task: Option<JoinHandle<()>>,
}

impl SyncClient {
    pub fn new(replica: Replica, server_url: impl Into<String>) -> Self {
        Self {
            replica,
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(SessionState::Disconnected)),
            shutdown: None,
            task: None,
        }
    }

    /// Connect to the server and start syncing.
    ///
    /// A no-op while a session is already running.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        if self.is_running() {
            return Ok(());
        }

        let (ws_stream, _) = tokio_tungstenite::connect_async(self.server_url.as_str())
            .await
            .inspect_err(|e| log::warn!("Failed to connect to {}: {e}", self.server_url))?;
        log::info!("Connected to {}", self.server_url);

        *self.state.write().await = SessionState::NotSynced;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let replica = self.replica.clone();
        let state = self.state.clone();
        let url = self.server_url.clone();

        self.task = Some(tokio::spawn(async move {
            if let Err(e) = duplex::drive(ws_stream, replica, url.clone(), state, shutdown_rx).await {
                log::error!("Sync session with {url} failed: {e}");
            }
        }));
        self.shutdown = Some(shutdown_tx);
        Ok(())
    }

    /// Close the session and wait for the connection task to finish.
    pub async fn close(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(true);
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        *self.state.write().await = SessionState::Disconnected;
    }

    pub async fn connection_state(&self) -> SessionState {
        *self.state.read().await
    }

    /// Whether the connection task is still alive.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

/// Connect `replica` to `url` and return the running client.
pub async fn connect(replica: Replica, url: impl Into<String>) -> Result<SyncClient, ProtocolError> {
    let mut client = SyncClient::new(replica, url);
    client.connect().await?;
    Ok(client)
}
