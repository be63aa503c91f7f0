//! Signaling Transport Trait
//!
//! The engine assumes the surrounding application owns a reliable transport
//! with per-participant delivery ordering (a socket, a message bus, ...).
//! Outbound messages go through this trait; inbound messages are handed to
//! the session via [`crate::session::CallHandle::deliver_signal`].

use super::messages::SignalingMessage;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum SignalingError {
    #[error("Connection to signaling transport failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to signaling transport")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Failed to decode inbound message: {0}")]
    Decode(String),
}

// ============================================================================
// TRANSPORT TRAIT
// ============================================================================

/// Outbound half of the signaling channel.
///
/// Implementations must deliver messages for a given participant in the
/// order they were sent; global ordering across participants is not assumed.
#[async_trait::async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn send(&self, msg: SignalingMessage) -> Result<(), SignalingError>;
}
