//! Client side of the bus.
//!
//! [`connect`] dials the relay, introduces the local peer with `Hello` and then
//! runs two tasks for the lifetime of the connection:
//!
//! - the inbound router reads frames and forwards `Peer` messages to
//!   [`BusConnection::inbound`] and `Status` messages to
//!   [`BusConnection::status`];
//! - the outbound router writes every message taken from the caller's
//!   outbound channel to the relay.
//!
//! When the inbound router stops (relay closed the stream, read or decode
//! error) it drops both channel senders and a oneshot completion signal, which
//! stops the outbound router. When the caller drops its outbound sender, the
//! outbound router sends `Leave` and closes the stream.

use futures::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use thiserror::Error;
use tokio::{
    net::TcpStream,
    select,
    sync::{mpsc, oneshot},
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{self, Message},
};
use tracing::{debug, info, warn};

use crate::message::{BusMessage, PeerMessage, StatusMessage};

/// Room for messages the application has not consumed yet.
const CHANNEL_CAPACITY: usize = 64;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("failed to connect to {url}")]
    Dial {
        url: String,
        #[source]
        source: Box<tungstenite::Error>,
    },
    #[error("failed to encode hello: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to send hello")]
    Handshake(#[source] Box<tungstenite::Error>),
}

/// Application side of a live connection. Both receivers close when the
/// connection ends.
#[derive(Debug)]
pub struct BusConnection {
    pub inbound: mpsc::Receiver<PeerMessage>,
    pub status: mpsc::Receiver<StatusMessage>,
}

/// WebSocket URL of a session on the relay at `host` (`host:port`).
pub fn session_url(host: &str, session_id: &str) -> String {
    format!("ws://{host}/{}", session_id.trim_start_matches('/'))
}

/// Connects `local_id` to `session_id` on the relay at `host`.
///
/// Dial and handshake failures are returned here. Anything that goes wrong
/// afterwards only closes the channels of the returned [`BusConnection`].
pub async fn connect(
    host: &str,
    session_id: &str,
    local_id: &str,
    outbound: mpsc::Receiver<PeerMessage>,
) -> Result<BusConnection, ConnectError> {
    let url = session_url(host, session_id);
    let (mut ws, _) = connect_async(url.as_str())
        .await
        .map_err(|source| ConnectError::Dial {
            url: url.clone(),
            source: Box::new(source),
        })?;

    let hello = BusMessage::hello(local_id).encode()?;
    ws.send(Message::text(hello))
        .await
        .map_err(|err| ConnectError::Handshake(Box::new(err)))?;
    info!(%url, local_id, "connected to relay");

    let (sink, stream) = ws.split();
    let (inbound_tx, inbound) = mpsc::channel(CHANNEL_CAPACITY);
    let (status_tx, status) = mpsc::channel(CHANNEL_CAPACITY);
    let (done_tx, done_rx) = oneshot::channel();

    tokio::spawn(route_inbound(stream, inbound_tx, status_tx, done_tx));
    tokio::spawn(route_outbound(sink, outbound, done_rx, local_id.to_string()));

    Ok(BusConnection { inbound, status })
}

async fn route_inbound(
    mut stream: SplitStream<WsStream>,
    inbound: mpsc::Sender<PeerMessage>,
    status: mpsc::Sender<StatusMessage>,
    _done: oneshot::Sender<()>,
) {
    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "read");
                break;
            }
        };

        let decoded = match frame {
            Message::Text(text) => BusMessage::decode(text.as_bytes()),
            Message::Binary(bytes) => BusMessage::decode(&bytes),
            Message::Close(close) => {
                info!(?close, "relay closed the connection");
                break;
            }
            _ => continue,
        };

        let message = match decoded {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "parse");
                break;
            }
        };

        debug!(?message, "recv");
        let delivered = match message {
            BusMessage::Peer(message) => inbound.send(message).await.is_ok(),
            BusMessage::Status(message) => status.send(message).await.is_ok(),
            BusMessage::Hello { .. } | BusMessage::Leave { .. } => true,
        };
        if !delivered {
            debug!("application dropped the inbound channels");
            break;
        }
    }
}

async fn route_outbound(
    mut sink: SplitSink<WsStream, Message>,
    mut outbound: mpsc::Receiver<PeerMessage>,
    mut done: oneshot::Receiver<()>,
    local_id: String,
) {
    loop {
        select! {
            _ = &mut done => return,
            next = outbound.recv() => match next {
                Some(message) => {
                    if let Err(err) = send_message(&mut sink, &message.into()).await {
                        warn!(error = %err, "write");
                        return;
                    }
                }
                None => {
                    leave(&mut sink, &local_id).await;
                    return;
                }
            }
        }
    }
}

async fn leave(sink: &mut SplitSink<WsStream, Message>, local_id: &str) {
    if let Err(err) = send_message(sink, &BusMessage::leave(local_id)).await {
        debug!(error = %err, "failed to send leave");
    }
    if let Err(err) = sink.close().await {
        debug!(error = %err, "failed to close connection");
    }
}

async fn send_message(
    sink: &mut SplitSink<WsStream, Message>,
    message: &BusMessage,
) -> anyhow::Result<()> {
    let frame = message.encode()?;
    sink.send(Message::text(frame)).await?;
    Ok(())
}
