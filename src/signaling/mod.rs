//! Signaling Module - Negotiation Message Contract and Transport
//!
//! This module defines what a call session speaks, not how it travels:
//! - The tagged [`SignalingMessage`] wire contract (stable across endpoints)
//! - The [`SignalingTransport`] trait the surrounding application implements
//! - A ready-made WebSocket transport for applications that want one
//!
//! Inbound messages are fed into a session through its handle and are
//! processed on the session's single control loop, so negotiation state for
//! one participant is never mutated from two messages concurrently.

mod messages;
mod transport;
mod ws;

pub use messages::SignalingMessage;
pub use transport::{SignalingError, SignalingTransport};
pub use ws::WsSignaling;
