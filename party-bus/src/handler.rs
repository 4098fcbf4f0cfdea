//! Server side of one WebSocket connection.
//!
//! A peer starts anonymous, becomes identified with its first valid `Hello` and
//! is removed when the read loop ends, whatever the reason.

use std::{sync::Arc, time::Duration};

use axum::extract::ws::{Message, WebSocket, close_code};
use futures::{Stream, StreamExt};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::{
    message::{BusMessage, MalformedMessage},
    registry::Registry,
    session::{Flow, Peer, PeerSink, ProtocolViolation, Session},
};

/// Deadline for the close frame sent to a misbehaving peer.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Why a read loop ended abnormally.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("read failed: {0}")]
    Stream(#[from] axum::Error),
    #[error(transparent)]
    Malformed(#[from] MalformedMessage),
    #[error("protocol violation: {0}")]
    Violation(#[from] ProtocolViolation),
}

/// How a read loop ended normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Departure {
    Left,
    Disconnected,
}

pub async fn serve_peer(registry: Arc<Registry>, session_id: String, socket: WebSocket) {
    let (sink, stream) = socket.split();
    run_peer(&registry, &session_id, Box::pin(sink), stream).await;
}

/// Drives one connection from join to removal.
pub async fn run_peer<S>(registry: &Registry, session_id: &str, sink: PeerSink, mut stream: S)
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let (session, peer) = registry.join(session_id, sink).await;

    match read_loop(&session, &peer, &mut stream).await {
        Ok(departure) => {
            debug!(session_id, conn_id = peer.conn_id(), ?departure, "read loop ended");
        }
        Err(PeerError::Violation(violation)) => {
            warn!(
                session_id,
                conn_id = peer.conn_id(),
                error = %violation,
                "check `from` field"
            );
            send_policy_close(&peer, &violation).await;
        }
        Err(err) => {
            warn!(session_id, conn_id = peer.conn_id(), error = %err, "peer connection failed");
        }
    }

    let remaining = registry.leave(&session, &peer).await;
    if remaining > 0 {
        let status = session.status().await;
        session.broadcast(&status).await;
    }
}

async fn read_loop<S>(
    session: &Session,
    peer: &Peer,
    stream: &mut S,
) -> Result<Departure, PeerError>
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    while let Some(frame) = stream.next().await {
        let message = match frame? {
            Message::Text(text) => BusMessage::decode(text.as_bytes())?,
            Message::Binary(bytes) => BusMessage::decode(&bytes)?,
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => return Ok(Departure::Disconnected),
        };

        session.check_from_field(peer, message.sender()).await?;
        if session.handle_message(peer, message).await? == Flow::Leave {
            return Ok(Departure::Left);
        }
    }

    Ok(Departure::Disconnected)
}

async fn send_policy_close(peer: &Peer, violation: &ProtocolViolation) {
    match timeout(CLOSE_TIMEOUT, peer.close(close_code::POLICY, violation.reason())).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(error = %err, "write close message"),
        Err(_) => info!(conn_id = peer.conn_id(), "timed out sending close message"),
    }
}
