//! One conversation: its peer set, the `from` field rules and message routing.
//!
//! The session never reads from a stream. Peer connection handlers feed it
//! decoded messages and it writes frames to the write halves of its members.

use std::{
    borrow::Cow,
    collections::HashMap,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use axum::extract::ws::{CloseFrame, Message};
use futures::{Sink, SinkExt, future::join_all};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::message::{BusMessage, PeerMessage};

/// Write half of a peer's WebSocket.
pub type PeerSink = Pin<Box<dyn Sink<Message, Error = axum::Error> + Send>>;

pub type ConnectionId = u64;

/// Identity a peer has claimed with `Hello`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerIdentity {
    Unidentified,
    Identified(String),
}

impl PeerIdentity {
    fn is(&self, id: &str) -> bool {
        matches!(self, PeerIdentity::Identified(bound) if bound == id)
    }
}

/// A connected stream within a session. Frames written to the peer go through
/// `sink`, one at a time.
pub struct Peer {
    conn_id: ConnectionId,
    sink: Mutex<PeerSink>,
}

impl Peer {
    pub fn conn_id(&self) -> ConnectionId {
        self.conn_id
    }

    pub async fn send_frame(&self, frame: String) -> Result<(), axum::Error> {
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(frame)).await
    }

    pub async fn close(&self, code: u16, reason: &'static str) -> Result<(), axum::Error> {
        let mut sink = self.sink.lock().await;
        sink.send(Message::Close(Some(CloseFrame {
            code,
            reason: Cow::Borrowed(reason),
        })))
        .await
    }
}

/// Breach of the `from` field rules. The offending peer is disconnected with a
/// policy-violation close frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    #[error("`from` field must not be empty")]
    EmptyFrom,
    #[error("`from` field cannot be the same as session id")]
    SessionIdAsFrom,
    #[error("`from` field cannot change during a session (bound to {bound}, got {from})")]
    IdentityChanged { bound: String, from: String },
    #[error("`from` field impersonating another peer ({0})")]
    Impersonation(String),
}

impl ProtocolViolation {
    /// Short reason carried in the close frame.
    pub fn reason(&self) -> &'static str {
        match self {
            ProtocolViolation::EmptyFrom => "empty from field",
            ProtocolViolation::SessionIdAsFrom => "from field is the session id",
            ProtocolViolation::IdentityChanged { .. } => "from field changed",
            ProtocolViolation::Impersonation(_) => "impersonation",
        }
    }
}

/// What the read loop should do after a message was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Leave,
}

struct Member {
    identity: PeerIdentity,
    peer: Arc<Peer>,
}

pub struct Session {
    id: String,
    members: Mutex<HashMap<ConnectionId, Member>>,
    next_conn_id: AtomicU64,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            members: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Adds an anonymous peer writing to `sink`.
    ///
    /// Callers go through [`crate::registry::Registry::join`] so that the peer
    /// cannot land in a session that is being deleted.
    pub async fn add_peer(&self, sink: PeerSink) -> Arc<Peer> {
        let peer = Arc::new(Peer {
            conn_id: self.next_conn_id.fetch_add(1, Ordering::Relaxed),
            sink: Mutex::new(sink),
        });

        let mut members = self.members.lock().await;
        members.insert(
            peer.conn_id,
            Member {
                identity: PeerIdentity::Unidentified,
                peer: Arc::clone(&peer),
            },
        );
        info!(session_id = %self.id, conn_id = peer.conn_id, "peer added");

        peer
    }

    /// Removes the peer and returns how many peers remain.
    pub async fn remove_peer(&self, peer: &Peer) -> usize {
        let mut members = self.members.lock().await;
        if let Some(member) = members.remove(&peer.conn_id) {
            info!(
                session_id = %self.id,
                conn_id = peer.conn_id,
                identity = ?member.identity,
                "peer removed"
            );
        }
        members.len()
    }

    pub async fn peer_count(&self) -> usize {
        self.members.lock().await.len()
    }

    pub async fn identity(&self, peer: &Peer) -> Option<PeerIdentity> {
        let members = self.members.lock().await;
        members
            .get(&peer.conn_id)
            .map(|member| member.identity.clone())
    }

    /// Identifiers of the identified peers, sorted. Anonymous peers are left out.
    pub async fn peer_ids(&self) -> Vec<String> {
        let members = self.members.lock().await;
        let mut ids: Vec<String> = members
            .values()
            .filter_map(|member| match &member.identity {
                PeerIdentity::Identified(id) => Some(id.clone()),
                PeerIdentity::Unidentified => None,
            })
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Current membership as a `Status` message originated by the session.
    pub async fn status(&self) -> BusMessage {
        BusMessage::status(self.id.clone(), self.peer_ids().await)
    }

    /// Validates the `from` field of a message received from `peer`.
    pub async fn check_from_field(&self, peer: &Peer, from: &str) -> Result<(), ProtocolViolation> {
        if from.is_empty() {
            return Err(ProtocolViolation::EmptyFrom);
        }

        if from == self.id {
            return Err(ProtocolViolation::SessionIdAsFrom);
        }

        let members = self.members.lock().await;
        if let Some(Member {
            identity: PeerIdentity::Identified(bound),
            ..
        }) = members.get(&peer.conn_id)
        {
            if bound != from {
                return Err(ProtocolViolation::IdentityChanged {
                    bound: bound.clone(),
                    from: from.to_string(),
                });
            }
        }

        check_impersonation(&members, peer.conn_id, from)
    }

    /// Binds `id` to an anonymous peer. Returns `false` when the peer was
    /// already identified.
    ///
    /// The impersonation check is repeated under the same lock as the binding:
    /// two anonymous peers racing for the same identifier cannot both win.
    pub async fn identify(&self, peer: &Peer, id: &str) -> Result<bool, ProtocolViolation> {
        let mut members = self.members.lock().await;
        check_impersonation(&members, peer.conn_id, id)?;

        match members.get_mut(&peer.conn_id) {
            Some(member) if member.identity == PeerIdentity::Unidentified => {
                member.identity = PeerIdentity::Identified(id.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Dispatches a message that already passed [`Session::check_from_field`].
    pub async fn handle_message(
        &self,
        peer: &Peer,
        message: BusMessage,
    ) -> Result<Flow, ProtocolViolation> {
        match message {
            BusMessage::Hello { from } => {
                if self.identify(peer, &from).await? {
                    info!(session_id = %self.id, peer_id = %from, "peer id registered");
                    let status = self.status().await;
                    self.broadcast(&status).await;
                }
                Ok(Flow::Continue)
            }
            BusMessage::Peer(message) => {
                self.route_peer_message(peer, message).await;
                Ok(Flow::Continue)
            }
            BusMessage::Leave { from } => {
                info!(session_id = %self.id, peer_id = %from, "peer is leaving");
                Ok(Flow::Leave)
            }
            BusMessage::Status(status) => {
                debug!(
                    session_id = %self.id,
                    from = %status.from,
                    "ignoring status sent by a peer"
                );
                Ok(Flow::Continue)
            }
        }
    }

    async fn route_peer_message(&self, peer: &Peer, message: PeerMessage) {
        if !matches!(self.identity(peer).await, Some(PeerIdentity::Identified(_))) {
            warn!(
                session_id = %self.id,
                conn_id = peer.conn_id,
                from = %message.from,
                "dropping peer message sent before hello"
            );
            return;
        }

        if message.is_broadcast() {
            info!(from = %message.from, size = message.msg.len(), "broadcast peer message");
            self.broadcast(&BusMessage::Peer(message)).await;
        } else {
            info!(
                from = %message.from,
                to = %message.to.join(", "),
                size = message.msg.len(),
                "multicast peer message"
            );
            let targets = message.to.clone();
            self.multicast(&targets, &BusMessage::Peer(message)).await;
        }
    }

    /// Sends `message` to every peer except the one identified as its sender.
    pub async fn broadcast(&self, message: &BusMessage) {
        let targets = self
            .select(|identity| !identity.is(message.sender()))
            .await;
        self.deliver(targets, message).await;
    }

    /// Sends `message` to the current members identified by one of `targets`.
    pub async fn multicast(&self, targets: &[String], message: &BusMessage) {
        let targets = self
            .select(|identity| targets.iter().any(|target| identity.is(target)))
            .await;
        self.deliver(targets, message).await;
    }

    /// Writes one frame to `peer`. Failures are logged and stay local to that
    /// destination.
    pub async fn send_to_peer(&self, peer: &Peer, frame: &str) {
        if let Err(err) = peer.send_frame(frame.to_string()).await {
            warn!(
                session_id = %self.id,
                conn_id = peer.conn_id,
                error = %err,
                "failed to send frame to peer"
            );
        }
    }

    /// Sends a close frame to every member, used when the relay shuts down.
    pub async fn close_all(&self, code: u16, reason: &'static str) {
        let peers = self.select(|_| true).await;
        join_all(peers.iter().map(|peer| async move {
            if let Err(err) = peer.close(code, reason).await {
                debug!(conn_id = peer.conn_id, error = %err, "failed to send close frame");
            }
        }))
        .await;
    }

    async fn select<F>(&self, keep: F) -> Vec<Arc<Peer>>
    where
        F: Fn(&PeerIdentity) -> bool,
    {
        let members = self.members.lock().await;
        members
            .values()
            .filter(|member| keep(&member.identity))
            .map(|member| Arc::clone(&member.peer))
            .collect()
    }

    async fn deliver(&self, targets: Vec<Arc<Peer>>, message: &BusMessage) {
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(err) => {
                warn!(session_id = %self.id, error = %err, "failed to encode message");
                return;
            }
        };

        debug!(
            session_id = %self.id,
            kind = ?message.kind(),
            recipients = targets.len(),
            "deliver frame"
        );
        join_all(targets.iter().map(|peer| self.send_to_peer(peer, &frame))).await;
    }
}

fn check_impersonation(
    members: &HashMap<ConnectionId, Member>,
    conn_id: ConnectionId,
    from: &str,
) -> Result<(), ProtocolViolation> {
    let taken = members
        .iter()
        .any(|(other, member)| *other != conn_id && member.identity.is(from));
    if taken {
        return Err(ProtocolViolation::Impersonation(from.to_string()));
    }
    Ok(())
}
