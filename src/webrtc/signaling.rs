//! Signaling service wire types and client contract
//!
//! The signaling service speaks JSON over HTTPS. Every response may carry a
//! soft failure (`errorCode` / `errorDescription`) even with a 2xx status;
//! those are surfaced as [`AppError::Signaling`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// SDP type of a session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description as exchanged with the signaling service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// Media line identifiers (`a=mid:`) present in this description
    pub fn mids(&self) -> Vec<&str> {
        self.sdp
            .lines()
            .filter_map(|line| line.trim().strip_prefix("a=mid:"))
            .collect()
    }

    pub fn has_mid(&self, mid: &str) -> bool {
        self.mids().into_iter().any(|m| m == mid)
    }
}

/// Where a track lives from the point of view of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackLocation {
    Local,
    Remote,
}

/// Identifies a track within a session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackDescriptor {
    pub location: TrackLocation,
    pub session_id: String,
    pub track_name: String,
}

impl TrackDescriptor {
    /// Descriptor other sessions use to pull a track pushed by `session_id`
    pub fn remote(session_id: impl Into<String>, track_name: impl Into<String>) -> Self {
        Self {
            location: TrackLocation::Remote,
            session_id: session_id.into(),
            track_name: track_name.into(),
        }
    }
}

/// Track entry in `/tracks/new` requests and responses
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackObject {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<TrackLocation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

impl TrackObject {
    /// Local track published from one of our transceivers
    pub fn local(mid: impl Into<String>, track_name: impl Into<String>) -> Self {
        Self {
            location: Some(TrackLocation::Local),
            mid: Some(mid.into()),
            track_name: Some(track_name.into()),
            ..Default::default()
        }
    }

    /// Track requested from another session
    pub fn pull(descriptor: &TrackDescriptor) -> Self {
        Self {
            location: Some(descriptor.location),
            track_name: Some(descriptor.track_name.clone()),
            session_id: Some(descriptor.session_id.clone()),
            ..Default::default()
        }
    }
}

/// Closed track entry in `/tracks/close` requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosedTrack {
    pub mid: String,
}

/// Access to the soft-error fields every response carries
pub trait SoftError {
    fn error_code(&self) -> Option<&str>;
    fn error_description(&self) -> Option<&str>;

    /// The soft failure carried by this body, if any
    fn soft_error(&self) -> Option<AppError> {
        let code = self.error_code().filter(|c| !c.is_empty());
        let description = self.error_description().filter(|d| !d.is_empty());
        if code.is_none() && description.is_none() {
            return None;
        }
        Some(AppError::signaling(
            code.unwrap_or("unknown"),
            description.or(code).unwrap_or_default(),
        ))
    }

    /// Turn a body carrying a soft failure into an error
    fn into_checked(self) -> Result<Self>
    where
        Self: Sized,
    {
        match self.soft_error() {
            Some(e) => Err(e),
            None => Ok(self),
        }
    }
}

macro_rules! impl_soft_error {
    ($($ty:ty),* $(,)?) => {
        $(impl SoftError for $ty {
            fn error_code(&self) -> Option<&str> {
                self.error_code.as_deref()
            }

            fn error_description(&self) -> Option<&str> {
                self.error_description.as_deref()
            }
        })*
    };
}

/// `POST /{appId}/sessions/new`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSessionRequest {
    pub session_description: SessionDescription,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSessionResponse {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub session_description: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

/// `POST /{appId}/sessions/{sessionId}/tracks/new`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TracksRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_description: Option<SessionDescription>,
    pub tracks: Vec<TrackObject>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TracksResponse {
    #[serde(default)]
    pub tracks: Vec<TrackObject>,
    #[serde(default)]
    pub session_description: Option<SessionDescription>,
    #[serde(default)]
    pub requires_immediate_renegotiation: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

impl TracksResponse {
    /// Track entry for a transceiver mid
    pub fn track_for_mid(&self, mid: &str) -> Option<&TrackObject> {
        self.tracks.iter().find(|t| t.mid.as_deref() == Some(mid))
    }
}

/// `PUT /{appId}/sessions/{sessionId}/renegotiate`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenegotiateRequest {
    pub session_description: SessionDescription,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenegotiateResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

/// `PUT /{appId}/sessions/{sessionId}/tracks/close`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseTracksRequest {
    pub tracks: Vec<ClosedTrack>,
    pub session_description: SessionDescription,
    pub force: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseTracksResponse {
    #[serde(default)]
    pub session_description: Option<SessionDescription>,
    #[serde(default)]
    pub tracks: Vec<TrackObject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

impl_soft_error!(
    NewSessionResponse,
    TracksResponse,
    RenegotiateResponse,
    CloseTracksResponse,
    TrackObject,
);

/// Signaling service contract consumed by the negotiation engine
///
/// Implementations return soft failures as `Err(AppError::Signaling)`.
#[async_trait]
pub trait SignalingApi: Send + Sync {
    async fn new_session(&self, offer: SessionDescription) -> Result<NewSessionResponse>;

    async fn new_tracks(&self, session_id: &str, request: TracksRequest) -> Result<TracksResponse>;

    async fn renegotiate(&self, session_id: &str, answer: SessionDescription) -> Result<()>;

    async fn close_tracks(
        &self,
        session_id: &str,
        request: CloseTracksRequest,
    ) -> Result<CloseTracksResponse>;
}

/// Peer connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// States after which the connection is never reused
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::New => write!(f, "new"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Failed => write!(f, "failed"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// ICE transport state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            IceConnectionState::Connected | IceConnectionState::Completed
        )
    }
}

impl std::fmt::Display for IceConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            IceConnectionState::New => "new",
            IceConnectionState::Checking => "checking",
            IceConnectionState::Connected => "connected",
            IceConnectionState::Completed => "completed",
            IceConnectionState::Disconnected => "disconnected",
            IceConnectionState::Failed => "failed",
            IceConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracks_request_wire_shape() {
        let request = TracksRequest {
            session_description: Some(SessionDescription::offer("v=0")),
            tracks: vec![TrackObject::local("1", "cam")],
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "sessionDescription": { "type": "offer", "sdp": "v=0" },
                "tracks": [{ "location": "local", "mid": "1", "trackName": "cam" }]
            })
        );
    }

    #[test]
    fn test_pull_track_object_carries_session() {
        let descriptor = TrackDescriptor::remote("abc", "cam");
        let json = serde_json::to_value(TrackObject::pull(&descriptor)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "location": "remote", "trackName": "cam", "sessionId": "abc" })
        );
    }

    #[test]
    fn test_tracks_response_defaults() {
        let response: TracksResponse =
            serde_json::from_str(r#"{"tracks":[{"mid":"2","trackName":"cam"}]}"#).unwrap();
        assert!(!response.requires_immediate_renegotiation);
        assert!(response.session_description.is_none());
        assert_eq!(response.track_for_mid("2").unwrap().track_name.as_deref(), Some("cam"));
        assert!(response.soft_error().is_none());
    }

    #[test]
    fn test_soft_error_detection() {
        let response: RenegotiateResponse = serde_json::from_str(
            r#"{"errorCode":"bad_sdp","errorDescription":"answer rejected"}"#,
        )
        .unwrap();
        let err = response.into_checked().unwrap_err();
        assert_eq!(err.to_string(), "Signaling error [bad_sdp]: answer rejected");

        let empty = RenegotiateResponse {
            error_code: Some(String::new()),
            error_description: None,
        };
        assert!(empty.soft_error().is_none());
    }

    #[test]
    fn test_session_description_mids() {
        let desc = SessionDescription::answer("v=0\r\nm=audio 9\r\na=mid:0\r\nm=video 9\r\na=mid:1\r\n");
        assert_eq!(desc.mids(), vec!["0", "1"]);
        assert!(desc.has_mid("1"));
        assert!(!desc.has_mid("2"));
    }
}
