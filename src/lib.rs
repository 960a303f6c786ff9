//! One-to-one video call negotiation.
//!
//! - [`calls`]: call session lifecycle, signaling relay and the
//!   authenticated service surface
//! - [`negotiation`]: the per-endpoint client that turns relay state into
//!   a peer connection
//! - [`collaborators`]: identity, membership and notification interfaces
//! - [`config`]: serde-backed settings

pub use callcore::{
    CallError, CallId, CallSession, CallStatus, ConversationId, EndReason, ErrorKind,
    IceCandidate, Role, SessionDescription, SignalingSnapshot, UserId,
};

pub mod calls;
pub mod collaborators;
pub mod config;
pub mod negotiation;
