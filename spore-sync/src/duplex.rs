//! Duplex transport: drives one [`SyncSession`] over one WebSocket.
//!
//! ```text
//!  text frames ───────► SyncSession::handle ──────┐
//!  replica Update ────► on_local_update ──────────┼──► text frames
//!  shutdown signal ───► Close frame               │
//!  Close / EOF / error ─► Disconnected            ▼
//! ```
//!
//! Shared by the client and every server-side connection.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use spore_core::{LogEvent, Replica};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{watch, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::protocol::{ProtocolError, WireMessage};
use crate::session::{Outbound, SessionState, SyncSession};

/// Run a sync session until the socket closes or `shutdown` fires.
///
/// `state` mirrors the session state after every step and ends as
/// `Disconnected`.
pub async fn drive<S>(
    ws: WebSocketStream<S>,
    replica: Replica,
    peer: String,
    state: Arc<RwLock<SessionState>>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut ws_sender, mut ws_receiver) = ws.split();
    // Subscribe before announcing so no commit slips between the two
    let mut events = replica.subscribe();
    let mut session = SyncSession::new(replica.clone());
    let topic = replica.namespace().to_string();
    let identity = replica.replica_id();

    log::info!("Sync session with {peer} opened");
    let opening = session.open();
    *state.write().await = session.state();

    let mut result = send_all(&mut ws_sender, &topic, identity, opening).await;

    while result.is_ok() {
        let outbound = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    log::info!("Sync session with {peer} closed locally");
                    break;
                }
                Vec::new()
            }

            frame = ws_receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => decode_and_handle(&mut session, text.as_str(), &peer),
                Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                    Ok(text) => decode_and_handle(&mut session, text, &peer),
                    Err(_) => {
                        log::warn!("Dropping non-UTF-8 binary frame from {peer}");
                        Vec::new()
                    }
                },
                Some(Ok(Message::Ping(data))) => {
                    result = ws_sender.send(Message::Pong(data)).await.map_err(ProtocolError::from);
                    Vec::new()
                }
                Some(Ok(Message::Close(_))) | None => {
                    log::info!("Sync session with {peer} closed by remote");
                    break;
                }
                Some(Ok(_)) => Vec::new(),
                Some(Err(e)) => {
                    log::error!("WebSocket error from {peer}: {e}");
                    result = Err(e.into());
                    break;
                }
            },

            event = events.recv() => match event {
                Ok(LogEvent::Update(ops)) => session.on_local_update(&ops),
                Ok(LogEvent::Apply) => session.on_remote_merge(),
                Ok(LogEvent::Change) => Vec::new(),
                Err(RecvError::Lagged(n)) => {
                    log::warn!("Sync session with {peer} missed {n} log events, resyncing");
                    let mut out = vec![session.resync()];
                    out.extend(session.on_remote_merge());
                    out
                }
                Err(RecvError::Closed) => break,
            },
        };

        if result.is_ok() {
            result = send_all(&mut ws_sender, &topic, identity, outbound).await;
        }
        *state.write().await = session.state();
    }

    session.close();
    *state.write().await = SessionState::Disconnected;
    result
}

fn decode_and_handle(session: &mut SyncSession, text: &str, peer: &str) -> Vec<Outbound> {
    match WireMessage::decode(text) {
        Ok(msg) => session.handle(&msg),
        Err(e) => {
            log::warn!("Failed to decode message from {peer}: {e}");
            Vec::new()
        }
    }
}

async fn send_all<W>(
    sink: &mut W,
    topic: &str,
    identity: spore_core::ReplicaId,
    outbound: Vec<Outbound>,
) -> Result<(), ProtocolError>
where
    W: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    for out in outbound {
        let encoded = out.to_wire(topic, identity)?.encode()?;
        sink.send(Message::Text(encoded.into())).await?;
    }
    Ok(())
}
