//! Peer connection abstraction and its `webrtc` crate implementation
//!
//! The negotiation engine only talks to [`PeerConnection`] and
//! [`Transceiver`]; [`WebRtcPeerFactory`] builds the production connections.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::ice::mdns::MulticastDnsMode;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::config::IceConfig;
use super::mdns::mdns_host_name;
use super::signaling::{ConnectionState, IceConnectionState, SdpType, SessionDescription};
use crate::error::{AppError, Result};

/// Outgoing media track
pub type LocalTrack = Arc<dyn TrackLocal + Send + Sync>;

/// Capacity of the `track` event fan-out
const TRACK_EVENT_CAPACITY: usize = 64;

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique connection id
pub fn next_peer_id() -> u64 {
    NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed)
}

/// Media kind of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

impl From<RTPCodecType> for MediaKind {
    fn from(kind: RTPCodecType) -> Self {
        match kind {
            RTPCodecType::Audio => MediaKind::Audio,
            _ => MediaKind::Video,
        }
    }
}

/// Transceiver direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransceiverDirection {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl From<TransceiverDirection> for RTCRtpTransceiverDirection {
    fn from(direction: TransceiverDirection) -> Self {
        match direction {
            TransceiverDirection::SendRecv => RTCRtpTransceiverDirection::Sendrecv,
            TransceiverDirection::SendOnly => RTCRtpTransceiverDirection::Sendonly,
            TransceiverDirection::RecvOnly => RTCRtpTransceiverDirection::Recvonly,
            TransceiverDirection::Inactive => RTCRtpTransceiverDirection::Inactive,
        }
    }
}

impl From<RTCRtpTransceiverDirection> for TransceiverDirection {
    fn from(direction: RTCRtpTransceiverDirection) -> Self {
        match direction {
            RTCRtpTransceiverDirection::Sendrecv => TransceiverDirection::SendRecv,
            RTCRtpTransceiverDirection::Sendonly => TransceiverDirection::SendOnly,
            RTCRtpTransceiverDirection::Recvonly => TransceiverDirection::RecvOnly,
            _ => TransceiverDirection::Inactive,
        }
    }
}

/// Inbound media track surfaced by a `track` event
#[derive(Clone)]
pub struct RemoteTrack {
    mid: String,
    id: String,
    kind: MediaKind,
    remote: Option<Arc<TrackRemote>>,
}

impl RemoteTrack {
    /// Track without an underlying RTP source
    pub fn detached(mid: impl Into<String>, id: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            mid: mid.into(),
            id: id.into(),
            kind,
            remote: None,
        }
    }

    fn from_remote(mid: String, track: Arc<TrackRemote>) -> Self {
        Self {
            mid,
            id: track.id(),
            kind: track.kind().into(),
            remote: Some(track),
        }
    }

    pub fn mid(&self) -> &str {
        &self.mid
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// RTP source, for reading packets
    pub fn remote(&self) -> Option<&Arc<TrackRemote>> {
        self.remote.as_ref()
    }
}

impl std::fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("mid", &self.mid)
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Bidirectional media line slot on a connection
#[async_trait]
pub trait Transceiver: Send + Sync {
    /// Negotiated media line id, once assigned
    fn mid(&self) -> Option<String>;

    fn direction(&self) -> TransceiverDirection;

    async fn set_direction(&self, direction: TransceiverDirection);

    /// Whether this line has completed an offer/answer exchange
    async fn sender_bound(&self) -> bool;

    /// Swap the outgoing media without renegotiating
    async fn replace_track(&self, track: LocalTrack) -> Result<()>;
}

/// The connection primitive the engine negotiates over
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Process-unique id of this connection instance
    fn id(&self) -> u64;

    fn connection_state(&self) -> ConnectionState;

    fn state_watch(&self) -> watch::Receiver<ConnectionState>;

    fn ice_state_watch(&self) -> watch::Receiver<IceConnectionState>;

    /// Subscribe to `track` events; only events after the call are seen
    fn track_events(&self) -> broadcast::Receiver<RemoteTrack>;

    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn local_description(&self) -> Option<SessionDescription>;

    async fn add_transceiver(
        &self,
        track: LocalTrack,
        direction: TransceiverDirection,
    ) -> Result<Arc<dyn Transceiver>>;

    async fn transceivers(&self) -> Vec<Arc<dyn Transceiver>>;

    async fn close(&self) -> Result<()>;

    async fn transceiver_for_mid(&self, mid: &str) -> Option<Arc<dyn Transceiver>> {
        self.transceivers()
            .await
            .into_iter()
            .find(|t| t.mid().as_deref() == Some(mid))
    }
}

/// Builds fresh connections for the lifecycle manager
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(&self) -> Result<Arc<dyn PeerConnection>>;
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription> {
    let parsed = match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(description.sdp),
        SdpType::Rollback => {
            return Err(AppError::Invariant(
                "rollback descriptions are not supported".to_string(),
            ))
        }
    };
    parsed.map_err(|e| AppError::WebRtcError(format!("Invalid session description: {}", e)))
}

fn from_rtc_description(description: RTCSessionDescription) -> Result<SessionDescription> {
    let sdp_type = match description.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        _ => {
            return Err(AppError::Invariant(
                "session description has no type".to_string(),
            ))
        }
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: description.sdp,
    })
}

fn connection_state_from(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(ConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
        _ => None,
    }
}

fn ice_state_from(state: RTCIceConnectionState) -> Option<IceConnectionState> {
    match state {
        RTCIceConnectionState::New => Some(IceConnectionState::New),
        RTCIceConnectionState::Checking => Some(IceConnectionState::Checking),
        RTCIceConnectionState::Connected => Some(IceConnectionState::Connected),
        RTCIceConnectionState::Completed => Some(IceConnectionState::Completed),
        RTCIceConnectionState::Disconnected => Some(IceConnectionState::Disconnected),
        RTCIceConnectionState::Failed => Some(IceConnectionState::Failed),
        RTCIceConnectionState::Closed => Some(IceConnectionState::Closed),
        _ => None,
    }
}

/// Transceiver backed by `RTCRtpTransceiver`
pub struct WebRtcTransceiver {
    inner: Arc<RTCRtpTransceiver>,
    pc: Weak<RTCPeerConnection>,
}

#[async_trait]
impl Transceiver for WebRtcTransceiver {
    fn mid(&self) -> Option<String> {
        self.inner.mid().map(|m| m.to_string())
    }

    fn direction(&self) -> TransceiverDirection {
        self.inner.direction().into()
    }

    async fn set_direction(&self, direction: TransceiverDirection) {
        self.inner.set_direction(direction.into()).await;
    }

    async fn sender_bound(&self) -> bool {
        let Some(mid) = self.mid() else {
            return false;
        };
        let Some(pc) = self.pc.upgrade() else {
            return false;
        };
        // Bound once the applied remote description covers this m-line
        match pc.current_remote_description().await {
            Some(remote) => remote
                .sdp
                .lines()
                .any(|line| line.trim().strip_prefix("a=mid:") == Some(mid.as_str())),
            None => false,
        }
    }

    async fn replace_track(&self, track: LocalTrack) -> Result<()> {
        self.inner
            .sender()
            .await
            .replace_track(Some(track))
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to replace track: {}", e)))
    }
}

/// Peer connection backed by `RTCPeerConnection`
pub struct WebRtcPeer {
    id: u64,
    pc: Arc<RTCPeerConnection>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
    ice_rx: watch::Receiver<IceConnectionState>,
    track_tx: broadcast::Sender<RemoteTrack>,
}

impl WebRtcPeer {
    fn wrap(id: u64, pc: Arc<RTCPeerConnection>) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::New);
        let (ice_tx, ice_rx) = watch::channel(IceConnectionState::New);
        let (track_tx, _) = broadcast::channel(TRACK_EVENT_CAPACITY);
        let state_tx = Arc::new(state_tx);

        let state = state_tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let state = state.clone();
            Box::pin(async move {
                if let Some(new_state) = connection_state_from(s) {
                    info!("Peer {} connection state: {}", id, new_state);
                    state.send_replace(new_state);
                }
            })
        }));

        let ice = Arc::new(ice_tx);
        pc.on_ice_connection_state_change(Box::new(move |s: RTCIceConnectionState| {
            let ice = ice.clone();
            Box::pin(async move {
                if let Some(new_state) = ice_state_from(s) {
                    debug!("Peer {} ICE state: {}", id, new_state);
                    ice.send_replace(new_state);
                }
            })
        }));

        let tracks = track_tx.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  transceiver: Arc<RTCRtpTransceiver>| {
                let tracks = tracks.clone();
                Box::pin(async move {
                    let mid = transceiver.mid().map(|m| m.to_string()).unwrap_or_default();
                    debug!("Peer {} track event on mid {}", id, mid);
                    let _ = tracks.send(RemoteTrack::from_remote(mid, track));
                })
            },
        ));

        Self {
            id,
            pc,
            state_tx,
            state_rx,
            ice_rx,
            track_tx,
        }
    }

    fn wrap_transceiver(&self, inner: Arc<RTCRtpTransceiver>) -> Arc<dyn Transceiver> {
        Arc::new(WebRtcTransceiver {
            inner,
            pc: Arc::downgrade(&self.pc),
        })
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    fn id(&self) -> u64 {
        self.id
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    fn ice_state_watch(&self) -> watch::Receiver<IceConnectionState> {
        self.ice_rx.clone()
    }

    fn track_events(&self) -> broadcast::Receiver<RemoteTrack> {
        self.track_tx.subscribe()
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to create offer: {}", e)))?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to create answer: {}", e)))?;
        from_rtc_description(answer)
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.pc
            .set_local_description(to_rtc_description(description)?)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to set local description: {}", e)))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.pc
            .set_remote_description(to_rtc_description(description)?)
            .await
            .map_err(|e| {
                AppError::WebRtcError(format!("Failed to set remote description: {}", e))
            })
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let description = self.pc.local_description().await?;
        from_rtc_description(description).ok()
    }

    async fn add_transceiver(
        &self,
        track: LocalTrack,
        direction: TransceiverDirection,
    ) -> Result<Arc<dyn Transceiver>> {
        let transceiver = self
            .pc
            .add_transceiver_from_track(
                track,
                Some(RTCRtpTransceiverInit {
                    direction: direction.into(),
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to add transceiver: {}", e)))?;
        Ok(self.wrap_transceiver(transceiver))
    }

    async fn transceivers(&self) -> Vec<Arc<dyn Transceiver>> {
        self.pc
            .get_transceivers()
            .await
            .into_iter()
            .map(|t| self.wrap_transceiver(t))
            .collect()
    }

    async fn close(&self) -> Result<()> {
        self.pc
            .close()
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to close peer connection: {}", e)))?;
        self.state_tx.send_replace(ConnectionState::Closed);
        Ok(())
    }
}

/// Factory for production connections
pub struct WebRtcPeerFactory {
    ice: IceConfig,
}

impl WebRtcPeerFactory {
    pub fn new(ice: IceConfig) -> Self {
        Self { ice }
    }
}

#[async_trait]
impl PeerFactory for WebRtcPeerFactory {
    async fn create(&self) -> Result<Arc<dyn PeerConnection>> {
        let id = next_peer_id();

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| AppError::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(|e| {
            AppError::WebRtcError(format!("Failed to register interceptors: {}", e))
        })?;

        let mut setting_engine = SettingEngine::default();
        let mode = self.ice.mdns.to_webrtc();
        setting_engine.set_ice_multicast_dns_mode(mode);
        if mode == MulticastDnsMode::QueryAndGather {
            setting_engine.set_multicast_dns_host_name(mdns_host_name(id));
        }

        let api = APIBuilder::new()
            .with_setting_engine(setting_engine)
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: self.ice.ice_servers(),
            bundle_policy: RTCBundlePolicy::MaxBundle,
            ..Default::default()
        };

        let pc = api.new_peer_connection(rtc_config).await.map_err(|e| {
            AppError::WebRtcError(format!("Failed to create peer connection: {}", e))
        })?;
        let pc = Arc::new(pc);

        // An inactive audio line keeps the very first offer non-empty
        pc.add_transceiver_from_kind(
            RTPCodecType::Audio,
            Some(RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Inactive,
                send_encodings: vec![],
            }),
        )
        .await
        .map_err(|e| AppError::WebRtcError(format!("Failed to add audio transceiver: {}", e)))?;

        info!(
            "Peer {} created (mDNS: {}, ICE servers: {})",
            id,
            self.ice.mdns.label(),
            self.ice.stun_servers.len() + self.ice.turn_servers.len()
        );

        Ok(Arc::new(WebRtcPeer::wrap(id, pc)))
    }
}
