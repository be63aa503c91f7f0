//! Session Module - Call State Machine and Control Loop
//!
//! This module ties the engine together:
//! - [`CallSession`] runs the per-call control loop and state machine
//! - [`CallHandle`] is the consumer-facing API (operations + queries)
//! - The peer registry owns one negotiated link per remote participant
//! - [`CallEvent`]s fan out to subscribers over a broadcast channel

mod engine;
mod events;
mod registry;

pub use engine::{CallConfig, CallHandle, CallSession, SessionError};
pub use events::{CallEvent, CallState, EndReason, EventDispatcher, SessionErrorKind};
pub use registry::{NegotiationState, PeerRegistry};
