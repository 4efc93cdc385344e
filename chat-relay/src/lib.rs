//! WebSocket relay that pairs chat clients by identity and forwards their
//! messages.
//!
//! Clients connect, announce an identity with a `login` frame, then send
//! `message` frames addressed to another identity or to `"all"`. The relay
//! keeps no history: anything addressed to an identity that is not connected
//! right now is dropped.
//!
//! - [`cli`] parses the command line for the server and the terminal client.
//! - [`config`] holds the relay configuration and routing policy.
//! - [`message`] defines the JSON wire frames and decodes them at the boundary.
//! - [`registry`] maps identities to live connection handles.
//! - [`router`] picks recipients for a message and queues deliveries.
//! - [`relay`] serves WebSocket upgrades and drives each connection.
//! - [`stats`] counts frames and deliveries for the `/stats` endpoint.
//! - [`client`] is a small terminal client for trying the relay by hand.

pub mod cli;
pub mod client;
pub mod config;
pub mod message;
pub mod registry;
pub mod relay;
pub mod router;
pub mod stats;
