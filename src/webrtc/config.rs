//! ICE configuration

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_server::RTCIceServer;

/// Relay used when nothing else is configured
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.cloudflare.com:3478";

/// ICE configuration shared by every connection the client creates
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    /// STUN server URLs
    pub stun_servers: Vec<String>,
    /// TURN server configuration
    pub turn_servers: Vec<TurnServer>,
    /// Multicast DNS candidate handling
    pub mdns: MdnsMode,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            turn_servers: vec![],
            mdns: MdnsMode::default(),
        }
    }
}

impl IceConfig {
    /// ICE servers in the form the peer connection expects
    pub fn ice_servers(&self) -> Vec<RTCIceServer> {
        let mut servers: Vec<RTCIceServer> = self
            .stun_servers
            .iter()
            .filter(|url| !url.trim().is_empty())
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        servers.extend(self.turn_servers.iter().map(|turn| RTCIceServer {
            urls: turn.urls.clone(),
            username: turn.username.clone(),
            credential: turn.credential.clone(),
            ..Default::default()
        }));

        servers
    }
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServer {
    /// TURN URLs; several allow UDP/TCP fallback
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

impl TurnServer {
    pub fn new(url: String, username: String, credential: String) -> Self {
        Self {
            urls: vec![url],
            username,
            credential,
        }
    }
}

/// Multicast DNS mode for host candidates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MdnsMode {
    Disabled,
    #[default]
    QueryOnly,
    QueryAndGather,
}
