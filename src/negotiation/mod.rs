//! Endpoint-side negotiation.
//!
//! A [`NegotiationClient`] acquires local media, drives the offer/answer
//! exchange through the [`SignalingRelay`](crate::calls::SignalingRelay) and
//! trickles ICE candidates in both directions until the call ends. The
//! WebRTC stack itself sits behind the traits in [`media`]; [`loopback`]
//! provides in-process implementations.

mod client;
mod error;
pub mod loopback;
pub mod media;

pub use client::{NegotiationClient, NegotiationEvent, NegotiationHandle, NegotiationOutcome};
pub use error::NegotiationError;
pub use media::{
    MediaConstraints, MediaDevices, MediaError, MediaStream, PeerConnection, PeerConnectionError,
    PeerConnectionFactory, PeerConnectionState, PeerEvent,
};
