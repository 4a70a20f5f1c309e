use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::media::TrackConstraints;
pub use crate::webrtc::config::{IceConfig, MdnsMode, TurnServer};

/// Default signaling API base (app id is appended per request)
pub const DEFAULT_API_BASE: &str = "https://rtc.live.cloudflare.com/v1/apps";

/// Main client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Signaling service endpoint and credentials
    pub signaling: SignalingConfig,
    /// ICE servers and candidate gathering
    pub ice: IceConfig,
    /// Timeouts and batching of renegotiation work
    pub negotiation: NegotiationConfig,
    /// Capture defaults handed to track sources
    pub media: MediaConfig,
}

/// Signaling service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// API base URL, without the app id
    pub api_base: String,
    /// Application id
    pub app_id: String,
    /// Bearer token
    pub token: String,
    /// Per-request timeout in milliseconds
    pub request_timeout_ms: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            app_id: String::new(),
            token: String::new(),
            request_timeout_ms: 10_000,
        }
    }
}

/// Negotiation timing and batching
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationConfig {
    /// Deadline for ICE to report connected after the session answer
    pub ice_connect_timeout_ms: u64,
    /// Deadline for a pulled mid to surface as a `track` event
    pub track_resolve_timeout_ms: u64,
    /// Maximum pushes merged into one offer/answer exchange
    pub push_batch_size: usize,
    /// Maximum pulls merged into one `/tracks/new` call
    pub pull_batch_size: usize,
    /// Pause between failed session negotiations (0 = retry immediately)
    pub session_retry_delay_ms: u64,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            ice_connect_timeout_ms: 5000,
            track_resolve_timeout_ms: 5000,
            push_batch_size: 64,
            pull_batch_size: 64,
            session_retry_delay_ms: 0,
        }
    }
}

impl NegotiationConfig {
    pub fn ice_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.ice_connect_timeout_ms)
    }

    pub fn track_resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.track_resolve_timeout_ms)
    }

    pub fn session_retry_delay(&self) -> Duration {
        Duration::from_millis(self.session_retry_delay_ms)
    }
}

/// Media capture defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub constraints: TrackConstraints,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"signaling":{"app_id":"app","token":"t"}}"#).unwrap();
        assert_eq!(config.signaling.api_base, DEFAULT_API_BASE);
        assert_eq!(config.signaling.app_id, "app");
        assert_eq!(config.negotiation.ice_connect_timeout(), Duration::from_secs(5));
        assert_eq!(config.negotiation.track_resolve_timeout(), Duration::from_secs(5));
        assert_eq!(config.negotiation.session_retry_delay(), Duration::ZERO);
        assert!(!config.ice.stun_servers.is_empty());
    }
}
