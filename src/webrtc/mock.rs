//! In-process doubles for the peer connection and the signaling service

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use webrtc::api::media_engine::MIME_TYPE_VP8;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::client::SessionClient;
use super::peer::{
    next_peer_id, LocalTrack, MediaKind, PeerConnection, PeerFactory, RemoteTrack, Transceiver,
    TransceiverDirection,
};
use super::signaling::{
    CloseTracksRequest, CloseTracksResponse, ConnectionState, IceConnectionState,
    NewSessionResponse, SdpType, SessionDescription, SignalingApi, TrackLocation, TrackObject,
    TracksRequest, TracksResponse,
};
use crate::config::NegotiationConfig;
use crate::error::{AppError, Result};

/// First mid the fake service assigns to pulled tracks
const FIRST_PULL_MID: u32 = 100;

pub fn vp8_track(id: &str) -> LocalTrack {
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            ..Default::default()
        },
        id.to_owned(),
        "test-stream".to_owned(),
    ))
}

pub struct MockTransceiver {
    mid: Mutex<Option<String>>,
    direction: Mutex<TransceiverDirection>,
    bound: AtomicBool,
    replaced: AtomicUsize,
}

impl MockTransceiver {
    fn new(mid: Option<String>, direction: TransceiverDirection) -> Arc<Self> {
        Arc::new(Self {
            mid: Mutex::new(mid),
            direction: Mutex::new(direction),
            bound: AtomicBool::new(false),
            replaced: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Transceiver for MockTransceiver {
    fn mid(&self) -> Option<String> {
        self.mid.lock().clone()
    }

    fn direction(&self) -> TransceiverDirection {
        *self.direction.lock()
    }

    async fn set_direction(&self, direction: TransceiverDirection) {
        *self.direction.lock() = direction;
    }

    async fn sender_bound(&self) -> bool {
        self.bound.load(Ordering::SeqCst)
    }

    async fn replace_track(&self, _track: LocalTrack) -> Result<()> {
        self.replaced.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct PeerInner {
    transceivers: Vec<Arc<MockTransceiver>>,
    next_mid: u32,
    local: Option<SessionDescription>,
}

/// Peer that assigns mids on local offers and binds them on answers
///
/// With `auto_connect` it reports ICE and connection state `connected` as
/// soon as an answer is applied. Remote offers create receive-only
/// transceivers and fire a `track` event for every new mid.
pub struct MockPeer {
    id: u64,
    auto_connect: bool,
    state: watch::Sender<ConnectionState>,
    ice: watch::Sender<IceConnectionState>,
    tracks: broadcast::Sender<RemoteTrack>,
    inner: Mutex<PeerInner>,
}

impl MockPeer {
    pub fn new(auto_connect: bool) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::New);
        let (ice, _) = watch::channel(IceConnectionState::New);
        let (tracks, _) = broadcast::channel(16);
        let inner = PeerInner {
            transceivers: vec![MockTransceiver::new(None, TransceiverDirection::Inactive)],
            ..Default::default()
        };
        Arc::new(Self {
            id: next_peer_id(),
            auto_connect,
            state,
            ice,
            tracks,
            inner: Mutex::new(inner),
        })
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    pub fn transceiver_list(&self) -> Vec<Arc<dyn Transceiver>> {
        self.inner
            .lock()
            .transceivers
            .iter()
            .map(|t| t.clone() as Arc<dyn Transceiver>)
            .collect()
    }

    /// `replace_track` calls across every transceiver
    pub fn replaced_tracks(&self) -> usize {
        self.inner
            .lock()
            .transceivers
            .iter()
            .map(|t| t.replaced.load(Ordering::SeqCst))
            .sum()
    }

    fn sdp(&self, kind: &str) -> String {
        let inner = self.inner.lock();
        let mut sdp = format!("v=0\r\ns=mock-{kind}-{}\r\n", self.id);
        for mid in inner.transceivers.iter().filter_map(|t| t.mid()) {
            sdp.push_str(&format!("a=mid:{mid}\r\n"));
        }
        sdp
    }
}

#[async_trait]
impl PeerConnection for MockPeer {
    fn id(&self) -> u64 {
        self.id
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn ice_state_watch(&self) -> watch::Receiver<IceConnectionState> {
        self.ice.subscribe()
    }

    fn track_events(&self) -> broadcast::Receiver<RemoteTrack> {
        self.tracks.subscribe()
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription::offer(self.sdp("offer")))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription::answer(self.sdp("answer")))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        let mut inner = self.inner.lock();
        if description.sdp_type == SdpType::Offer {
            for transceiver in inner.transceivers.clone() {
                let mut mid = transceiver.mid.lock();
                if mid.is_none() {
                    *mid = Some(inner.next_mid.to_string());
                    inner.next_mid += 1;
                }
            }
        }
        inner.local = Some(description);
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        match description.sdp_type {
            SdpType::Answer => {
                for transceiver in &self.inner.lock().transceivers {
                    if transceiver.mid().is_some() {
                        transceiver.bound.store(true, Ordering::SeqCst);
                    }
                }
                if self.auto_connect {
                    self.ice.send_replace(IceConnectionState::Connected);
                    self.state.send_if_modified(|state| {
                        let connect = *state == ConnectionState::New;
                        if connect {
                            *state = ConnectionState::Connected;
                        }
                        connect
                    });
                }
            }
            SdpType::Offer => {
                let fresh: Vec<String> = {
                    let mut inner = self.inner.lock();
                    let known: Vec<String> =
                        inner.transceivers.iter().filter_map(|t| t.mid()).collect();
                    let fresh: Vec<String> = description
                        .mids()
                        .into_iter()
                        .filter(|mid| !known.iter().any(|k| k == mid))
                        .map(str::to_string)
                        .collect();
                    for mid in &fresh {
                        let transceiver =
                            MockTransceiver::new(Some(mid.clone()), TransceiverDirection::RecvOnly);
                        transceiver.bound.store(true, Ordering::SeqCst);
                        inner.transceivers.push(transceiver);
                    }
                    fresh
                };
                for mid in fresh {
                    let id = format!("remote-{mid}");
                    let _ = self.tracks.send(RemoteTrack::detached(mid, id, MediaKind::Video));
                }
            }
            _ => {
                return Err(AppError::Invariant(
                    "unsupported remote description".to_string(),
                ))
            }
        }
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.inner.lock().local.clone()
    }

    async fn add_transceiver(
        &self,
        _track: LocalTrack,
        direction: TransceiverDirection,
    ) -> Result<Arc<dyn Transceiver>> {
        let transceiver = MockTransceiver::new(None, direction);
        self.inner.lock().transceivers.push(transceiver.clone());
        Ok(transceiver)
    }

    async fn transceivers(&self) -> Vec<Arc<dyn Transceiver>> {
        self.transceiver_list()
    }

    async fn close(&self) -> Result<()> {
        self.ice.send_replace(IceConnectionState::Closed);
        self.state.send_replace(ConnectionState::Closed);
        Ok(())
    }
}

pub struct MockPeerFactory {
    auto_connect: bool,
    peers: Mutex<Vec<Arc<MockPeer>>>,
    attempts: AtomicUsize,
    failures: AtomicUsize,
}

impl MockPeerFactory {
    pub fn new(auto_connect: bool) -> Arc<Self> {
        Arc::new(Self {
            auto_connect,
            peers: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
        })
    }

    /// The `index`-th peer successfully created
    pub fn peer(&self, index: usize) -> Arc<MockPeer> {
        self.peers.lock()[index].clone()
    }

    pub fn created(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Fail the next `count` creations
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl PeerFactory for MockPeerFactory {
    async fn create(&self) -> Result<Arc<dyn PeerConnection>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(AppError::WebRtcError("injected factory failure".to_string()));
        }
        let peer = MockPeer::new(self.auto_connect);
        self.peers.lock().push(peer.clone());
        Ok(peer)
    }
}

/// A call the fake signaling service received
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingCall {
    NewSession,
    NewTracks {
        session_id: String,
        tracks: Vec<TrackObject>,
        with_offer: bool,
    },
    Renegotiate {
        session_id: String,
    },
    CloseTracks {
        session_id: String,
        mids: Vec<String>,
        force: bool,
    },
}

/// Signaling service double that records every call
pub struct MockSignaling {
    calls: Mutex<Vec<SignalingCall>>,
    sessions: AtomicU32,
    next_mid: AtomicU32,
    session_failures: AtomicUsize,
    renegotiate_pulls: AtomicBool,
    track_errors: Mutex<HashMap<String, (String, String)>>,
    close_error: Mutex<Option<(String, String)>>,
}

impl MockSignaling {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            sessions: AtomicU32::new(0),
            next_mid: AtomicU32::new(FIRST_PULL_MID),
            session_failures: AtomicUsize::new(0),
            renegotiate_pulls: AtomicBool::new(true),
            track_errors: Mutex::new(HashMap::new()),
            close_error: Mutex::new(None),
        })
    }

    pub fn calls(&self) -> Vec<SignalingCall> {
        self.calls.lock().clone()
    }

    /// Reject the next `count` `sessions/new` calls with a transport error
    pub fn fail_new_sessions(&self, count: usize) {
        self.session_failures.store(count, Ordering::SeqCst);
    }

    /// Answer pulls without asking for renegotiation, so no track event fires
    pub fn skip_renegotiation(&self) {
        self.renegotiate_pulls.store(false, Ordering::SeqCst);
    }

    /// Report a per-track error for every entry named `track_name`
    pub fn fail_track(&self, track_name: &str, code: &str, description: &str) {
        self.track_errors.lock().insert(
            track_name.to_string(),
            (code.to_string(), description.to_string()),
        );
    }

    pub fn fail_close(&self, code: &str, description: &str) {
        *self.close_error.lock() = Some((code.to_string(), description.to_string()));
    }

    fn record(&self, call: SignalingCall) {
        self.calls.lock().push(call);
    }

    fn track_error(&self, track: &TrackObject) -> Option<TrackObject> {
        let name = track.track_name.as_deref()?;
        let (code, description) = self.track_errors.lock().get(name).cloned()?;
        Some(TrackObject {
            mid: track.mid.clone(),
            track_name: track.track_name.clone(),
            error_code: Some(code),
            error_description: Some(description),
            ..Default::default()
        })
    }
}

#[async_trait]
impl SignalingApi for MockSignaling {
    async fn new_session(&self, _offer: SessionDescription) -> Result<NewSessionResponse> {
        self.record(SignalingCall::NewSession);
        if self
            .session_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(AppError::Transport("injected outage".to_string()));
        }
        let n = self.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(NewSessionResponse {
            session_id: Some(format!("session-{n}")),
            session_description: Some(SessionDescription::answer("v=0\r\na=mid:0\r\n")),
            ..Default::default()
        })
    }

    async fn new_tracks(&self, session_id: &str, request: TracksRequest) -> Result<TracksResponse> {
        let with_offer = request.session_description.is_some();
        self.record(SignalingCall::NewTracks {
            session_id: session_id.to_string(),
            tracks: request.tracks.clone(),
            with_offer,
        });

        if with_offer {
            let tracks = request
                .tracks
                .iter()
                .map(|t| self.track_error(t).unwrap_or_else(|| t.clone()))
                .collect();
            return Ok(TracksResponse {
                tracks,
                session_description: Some(SessionDescription::answer("v=0\r\n")),
                ..Default::default()
            });
        }

        let mut offer = String::from("v=0\r\n");
        let mut assigned = false;
        let tracks = request
            .tracks
            .iter()
            .map(|t| {
                if let Some(error) = self.track_error(t) {
                    return error;
                }
                let mid = self.next_mid.fetch_add(1, Ordering::SeqCst).to_string();
                offer.push_str(&format!("a=mid:{mid}\r\n"));
                assigned = true;
                TrackObject {
                    location: Some(TrackLocation::Remote),
                    mid: Some(mid),
                    track_name: t.track_name.clone(),
                    session_id: t.session_id.clone(),
                    ..Default::default()
                }
            })
            .collect();

        let renegotiate = assigned && self.renegotiate_pulls.load(Ordering::SeqCst);
        Ok(TracksResponse {
            tracks,
            session_description: assigned.then(|| SessionDescription::offer(offer)),
            requires_immediate_renegotiation: renegotiate,
            ..Default::default()
        })
    }

    async fn renegotiate(&self, session_id: &str, _answer: SessionDescription) -> Result<()> {
        self.record(SignalingCall::Renegotiate {
            session_id: session_id.to_string(),
        });
        Ok(())
    }

    async fn close_tracks(
        &self,
        session_id: &str,
        request: CloseTracksRequest,
    ) -> Result<CloseTracksResponse> {
        self.record(SignalingCall::CloseTracks {
            session_id: session_id.to_string(),
            mids: request.tracks.into_iter().map(|t| t.mid).collect(),
            force: request.force,
        });
        if let Some((code, description)) = self.close_error.lock().clone() {
            return Ok(CloseTracksResponse {
                error_code: Some(code),
                error_description: Some(description),
                ..Default::default()
            });
        }
        Ok(CloseTracksResponse {
            session_description: Some(SessionDescription::answer("v=0\r\n")),
            ..Default::default()
        })
    }
}

/// A client wired to mock peers and a mock signaling service
pub struct Harness {
    pub client: SessionClient,
    pub factory: Arc<MockPeerFactory>,
    pub signaling: Arc<MockSignaling>,
}

impl Harness {
    pub async fn start(auto_connect: bool) -> Self {
        Self::start_with(auto_connect, |_| {}).await
    }

    pub async fn start_with(auto_connect: bool, setup: impl FnOnce(&MockSignaling)) -> Self {
        let signaling = MockSignaling::new();
        setup(&signaling);
        let factory = MockPeerFactory::new(auto_connect);
        let client = SessionClient::with_parts(
            signaling.clone(),
            factory.clone(),
            NegotiationConfig::default(),
        )
        .await
        .unwrap();
        Self {
            client,
            factory,
            signaling,
        }
    }

    /// Wait until everything queued on the scheduler so far has run
    pub async fn settle(&self) {
        self.client
            .lane()
            .scheduler
            .schedule(|| async { Ok(()) })
            .await
            .unwrap();
    }
}
