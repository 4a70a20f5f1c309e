//! Client event types
//!
//! Everything observable about the negotiation engine that is not a return
//! value: connection replacement, session lifecycle and track outcomes.

use serde::{Deserialize, Serialize};

use crate::webrtc::signaling::ConnectionState;

/// Negotiation engine event
///
/// Serialized with `serde(tag = "event", content = "data")`:
/// ```json
/// { "event": "session.established", "data": { "peer_id": 1, "session_id": "abc" } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    /// A fresh connection became current
    #[serde(rename = "connection.replaced")]
    ConnectionReplaced {
        peer_id: u64,
        /// Connection it superseded, absent for the first one
        #[serde(skip_serializing_if = "Option::is_none")]
        previous: Option<u64>,
    },

    /// The current connection changed state
    #[serde(rename = "connection.state_changed")]
    ConnectionStateChanged {
        peer_id: u64,
        state: ConnectionState,
    },

    /// A session was negotiated and ICE connected
    #[serde(rename = "session.established")]
    SessionEstablished { peer_id: u64, session_id: String },

    /// A negotiation attempt failed and will be retried
    #[serde(rename = "session.failed")]
    SessionFailed { peer_id: u64, message: String },

    /// The published session was withdrawn with its connection
    #[serde(rename = "session.lost")]
    SessionLost { session_id: String },

    /// A local track is reachable by other sessions
    #[serde(rename = "track.pushed")]
    TrackPushed {
        session_id: String,
        track_name: String,
        mid: String,
    },

    /// Outgoing media swapped on an already negotiated transceiver
    #[serde(rename = "track.replaced")]
    TrackReplaced {
        session_id: String,
        track_name: String,
    },

    /// A remote track was received
    #[serde(rename = "track.pulled")]
    TrackPulled {
        session_id: String,
        track_name: String,
        mid: String,
    },

    /// A transceiver was deactivated and removed server-side
    #[serde(rename = "track.closed")]
    TrackClosed { session_id: String, mid: String },

    /// A background negotiation step failed
    #[serde(rename = "negotiation.error")]
    NegotiationError { operation: String, message: String },
}

impl ClientEvent {
    /// Event name as serialized in the `event` tag
    pub fn event_name(&self) -> &'static str {
        match self {
            ClientEvent::ConnectionReplaced { .. } => "connection.replaced",
            ClientEvent::ConnectionStateChanged { .. } => "connection.state_changed",
            ClientEvent::SessionEstablished { .. } => "session.established",
            ClientEvent::SessionFailed { .. } => "session.failed",
            ClientEvent::SessionLost { .. } => "session.lost",
            ClientEvent::TrackPushed { .. } => "track.pushed",
            ClientEvent::TrackReplaced { .. } => "track.replaced",
            ClientEvent::TrackPulled { .. } => "track.pulled",
            ClientEvent::TrackClosed { .. } => "track.closed",
            ClientEvent::NegotiationError { .. } => "negotiation.error",
        }
    }
}
