use callcore::CallError;
use thiserror::Error;

use super::media::{MediaError, PeerConnectionError};

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("camera/microphone permission denied: {0}")]
    MediaDenied(String),

    #[error("no usable capture device: {0}")]
    MediaUnavailable(String),

    #[error(transparent)]
    PeerConnection(#[from] PeerConnectionError),

    #[error("signaling failed: {0}")]
    Signaling(#[from] CallError),

    #[error("negotiation task stopped unexpectedly: {0}")]
    Task(String),
}

impl From<MediaError> for NegotiationError {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::PermissionDenied(msg) => Self::MediaDenied(msg),
            MediaError::Unavailable(msg) => Self::MediaUnavailable(msg),
        }
    }
}
