//! Interfaces to the local WebRTC implementation.
//!
//! The negotiation client only moves opaque descriptions and candidates
//! between these objects and the relay; it never looks inside them.

use async_trait::async_trait;
use callcore::{IceCandidate, SessionDescription};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::IceServer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("no capture device: {0}")]
    Unavailable(String),
}

/// Captured local camera/microphone tracks.
pub trait MediaStream: Send + Sync {
    fn id(&self) -> &str;

    fn track_count(&self) -> usize;

    /// Stop every track and release the devices. Must be idempotent.
    fn stop(&self);
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(
        &self,
        constraints: MediaConstraints,
    ) -> Result<Arc<dyn MediaStream>, MediaError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerConnectionState {
    /// Transport trouble the user should hear about.
    pub fn is_trouble(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed)
    }
}

/// Asynchronous notifications from a peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// ICE gathered a local candidate that the remote side needs.
    LocalCandidate(IceCandidate),
    StateChanged(PeerConnectionState),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("peer connection: {0}")]
pub struct PeerConnectionError(pub String);

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_stream(&self, stream: Arc<dyn MediaStream>) -> Result<(), PeerConnectionError>;

    async fn create_offer(&self) -> Result<SessionDescription, PeerConnectionError>;

    async fn create_answer(&self) -> Result<SessionDescription, PeerConnectionError>;

    async fn set_local_description(
        &self,
        sdp: SessionDescription,
    ) -> Result<(), PeerConnectionError>;

    async fn set_remote_description(
        &self,
        sdp: SessionDescription,
    ) -> Result<(), PeerConnectionError>;

    fn has_remote_description(&self) -> bool;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerConnectionError>;

    /// Tear the connection down. Must be idempotent.
    fn close(&self);
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    /// Build a peer connection and the channel its events arrive on.
    async fn create(
        &self,
        ice_servers: &[IceServer],
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::Receiver<PeerEvent>), PeerConnectionError>;
}
