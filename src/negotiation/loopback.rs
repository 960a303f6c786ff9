//! In-process media devices and peer connections.
//!
//! They produce syntactically plausible SDP and host candidates, report
//! `Connected` once both descriptions and a remote candidate are in place,
//! and keep enough bookkeeping for tests to check that media was released.

use async_trait::async_trait;
use callcore::{IceCandidate, SessionDescription};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

use super::media::{
    MediaConstraints, MediaDevices, MediaError, MediaStream, PeerConnection, PeerConnectionError,
    PeerConnectionFactory, PeerConnectionState, PeerEvent,
};
use crate::config::IceServer;

const PEER_EVENT_CAPACITY: usize = 64;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, Default)]
pub struct LoopbackMedia {
    deny: AtomicBool,
    acquired: AtomicUsize,
    live: Arc<AtomicUsize>,
}

impl LoopbackMedia {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every later `acquire` with a permission error.
    pub fn deny_permission(&self, deny: bool) {
        self.deny.store(deny, Ordering::SeqCst);
    }

    /// Streams handed out so far.
    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    /// Streams handed out and not yet stopped.
    pub fn live_streams(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaDevices for LoopbackMedia {
    async fn acquire(
        &self,
        constraints: MediaConstraints,
    ) -> Result<Arc<dyn MediaStream>, MediaError> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied(
                "user dismissed the camera prompt".into(),
            ));
        }
        let tracks = usize::from(constraints.audio) + usize::from(constraints.video);
        if tracks == 0 {
            return Err(MediaError::Unavailable("no tracks requested".into()));
        }

        let n = self.acquired.fetch_add(1, Ordering::SeqCst);
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(LoopbackStream {
            id: format!("loopback-stream-{n}"),
            tracks,
            stopped: AtomicBool::new(false),
            live: self.live.clone(),
        }))
    }
}

#[derive(Debug)]
pub struct LoopbackStream {
    id: String,
    tracks: usize,
    stopped: AtomicBool,
    live: Arc<AtomicUsize>,
}

impl MediaStream for LoopbackStream {
    fn id(&self) -> &str {
        &self.id
    }

    fn track_count(&self) -> usize {
        self.tracks
    }

    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Builds [`LoopbackPeer`]s and remembers them for inspection.
#[derive(Debug)]
pub struct LoopbackPeerFactory {
    candidates_per_peer: usize,
    next_id: AtomicU64,
    peers: Mutex<Vec<Arc<LoopbackPeer>>>,
}

impl LoopbackPeerFactory {
    pub fn new(candidates_per_peer: usize) -> Self {
        Self {
            candidates_per_peer,
            next_id: AtomicU64::new(1),
            peers: Mutex::new(Vec::new()),
        }
    }

    pub fn peers(&self) -> Vec<Arc<LoopbackPeer>> {
        lock(&self.peers).clone()
    }
}

impl Default for LoopbackPeerFactory {
    fn default() -> Self {
        Self::new(2)
    }
}

#[async_trait]
impl PeerConnectionFactory for LoopbackPeerFactory {
    async fn create(
        &self,
        ice_servers: &[IceServer],
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::Receiver<PeerEvent>), PeerConnectionError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(PEER_EVENT_CAPACITY);
        let peer = Arc::new(LoopbackPeer {
            id,
            ice_servers: ice_servers.to_vec(),
            candidates_to_gather: self.candidates_per_peer,
            events: tx,
            inner: Mutex::new(PeerInner::default()),
            closed: AtomicBool::new(false),
        });
        lock(&self.peers).push(peer.clone());
        Ok((peer, rx))
    }
}

#[derive(Debug)]
struct PeerInner {
    state: PeerConnectionState,
    streams: usize,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_candidates: Vec<IceCandidate>,
}

impl Default for PeerInner {
    fn default() -> Self {
        Self {
            state: PeerConnectionState::New,
            streams: 0,
            local: None,
            remote: None,
            remote_candidates: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct LoopbackPeer {
    id: u64,
    ice_servers: Vec<IceServer>,
    candidates_to_gather: usize,
    events: mpsc::Sender<PeerEvent>,
    inner: Mutex<PeerInner>,
    closed: AtomicBool,
}

impl LoopbackPeer {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn ice_servers(&self) -> &[IceServer] {
        &self.ice_servers
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> PeerConnectionState {
        lock(&self.inner).state
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        lock(&self.inner).remote_candidates.clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        lock(&self.inner).local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        lock(&self.inner).remote.clone()
    }

    /// Force a state change, as a network failure would.
    pub fn simulate_state(&self, state: PeerConnectionState) {
        self.set_state(state);
    }

    fn ensure_open(&self) -> Result<(), PeerConnectionError> {
        if self.is_closed() {
            return Err(PeerConnectionError(format!("peer {} is closed", self.id)));
        }
        Ok(())
    }

    fn set_state(&self, state: PeerConnectionState) {
        {
            let mut inner = lock(&self.inner);
            if inner.state == state {
                return;
            }
            inner.state = state;
        }
        let _ = self.events.try_send(PeerEvent::StateChanged(state));
    }

    fn describe(&self, kind: &str) -> SessionDescription {
        let streams = lock(&self.inner).streams;
        SessionDescription::new(format!(
            "v=0\r\no=- {} 1 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\na=type:{kind}\r\na=streams:{streams}\r\n",
            self.id
        ))
    }

    fn gather_candidates(&self) {
        for i in 0..self.candidates_to_gather {
            let port = 50_000 + self.id * 100 + i as u64;
            let candidate = IceCandidate::new(format!(
                "candidate:{}{} 1 udp 2122260223 127.0.0.1 {} typ host",
                self.id, i, port
            ));
            let _ = self.events.try_send(PeerEvent::LocalCandidate(candidate));
        }
    }

    fn maybe_connect(&self) {
        let ready = {
            let inner = lock(&self.inner);
            inner.local.is_some() && inner.remote.is_some() && !inner.remote_candidates.is_empty()
        };
        if ready {
            self.set_state(PeerConnectionState::Connected);
        }
    }
}

#[async_trait]
impl PeerConnection for LoopbackPeer {
    async fn add_stream(&self, stream: Arc<dyn MediaStream>) -> Result<(), PeerConnectionError> {
        self.ensure_open()?;
        if stream.track_count() == 0 {
            return Err(PeerConnectionError(format!(
                "stream {} has no tracks",
                stream.id()
            )));
        }
        lock(&self.inner).streams += 1;
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerConnectionError> {
        self.ensure_open()?;
        Ok(self.describe("offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerConnectionError> {
        self.ensure_open()?;
        if lock(&self.inner).remote.is_none() {
            return Err(PeerConnectionError(
                "cannot answer without a remote offer".into(),
            ));
        }
        Ok(self.describe("answer"))
    }

    async fn set_local_description(
        &self,
        sdp: SessionDescription,
    ) -> Result<(), PeerConnectionError> {
        self.ensure_open()?;
        lock(&self.inner).local = Some(sdp);
        self.set_state(PeerConnectionState::Connecting);
        self.gather_candidates();
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        sdp: SessionDescription,
    ) -> Result<(), PeerConnectionError> {
        self.ensure_open()?;
        if sdp.is_empty() {
            return Err(PeerConnectionError("empty remote description".into()));
        }
        lock(&self.inner).remote = Some(sdp);
        self.maybe_connect();
        Ok(())
    }

    fn has_remote_description(&self) -> bool {
        lock(&self.inner).remote.is_some()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerConnectionError> {
        self.ensure_open()?;
        if !candidate.as_str().starts_with("candidate:") {
            return Err(PeerConnectionError(format!(
                "malformed candidate {:?}",
                candidate.as_str()
            )));
        }
        lock(&self.inner).remote_candidates.push(candidate);
        self.maybe_connect();
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            lock(&self.inner).state = PeerConnectionState::Closed;
        }
    }
}
