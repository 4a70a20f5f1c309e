//! Session and track negotiation engine
//!
//! Layout, leaves first:
//! ```text
//! FifoScheduler        one lane for every SDP-mutating step
//! BulkDispatcher       same-tick pushes/pulls become one round trip
//! ConnectionManager    current peer connection, replaced on failure
//! session              offer/answer per connection -> Session
//! push / pull / close  track pipelines over the current Session
//! SessionClient        facade handing out the pipelines
//! ```

pub mod bulk;
mod client;
mod close;
pub mod config;
mod connection;
pub mod http_signaling;
mod lane;
pub mod mdns;
pub mod peer;
mod pull;
mod push;
pub mod scheduler;
mod session;
pub mod signaling;

#[cfg(test)]
pub(crate) mod mock;

pub use bulk::{BatchSlot, BulkDispatcher};
pub use client::SessionClient;
pub use config::{IceConfig, MdnsMode, TurnServer};
pub use connection::ConnectionManager;
pub use http_signaling::HttpSignaling;
pub use peer::{
    LocalTrack, MediaKind, PeerConnection, PeerFactory, RemoteTrack, Transceiver,
    TransceiverDirection, WebRtcPeerFactory,
};
pub use scheduler::FifoScheduler;
pub use session::Session;
pub use signaling::{
    ConnectionState, IceConnectionState, SessionDescription, SignalingApi, TrackDescriptor,
    TrackLocation,
};
