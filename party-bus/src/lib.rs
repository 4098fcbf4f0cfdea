//! A session-scoped WebSocket message relay.
//!
//! Peers connect to `ws://host/{session_id}`, introduce themselves with a
//! `Hello` and then exchange short messages with the other peers of the same
//! session, either broadcast or addressed to a list of identifiers. Nothing is
//! stored: a session exists only while at least one peer is connected.
//!
//! - [`message`] defines the four protocol messages and their JSON encoding.
//! - [`session`] owns the peers of one session, enforces the `from` field
//!   rules and routes messages.
//! - [`registry`] maps session identifiers to live sessions.
//! - [`handler`] runs the read loop of one server-side connection.
//! - [`broker`] is the HTTP server that upgrades requests to WebSockets.
//! - [`connector`] is the client side, exposing a connection as channels.
//! - [`cli`] and [`client`] implement the `create` / `join` command line.

pub mod broker;
pub mod cli;
pub mod client;
pub mod connector;
pub mod handler;
pub mod message;
pub mod registry;
pub mod session;
