use webrtc::ice::mdns::MulticastDnsMode;

use super::config::MdnsMode;

impl MdnsMode {
    pub fn to_webrtc(self) -> MulticastDnsMode {
        match self {
            MdnsMode::Disabled => MulticastDnsMode::Disabled,
            MdnsMode::QueryOnly => MulticastDnsMode::QueryOnly,
            MdnsMode::QueryAndGather => MulticastDnsMode::QueryAndGather,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            MdnsMode::Disabled => "disabled",
            MdnsMode::QueryOnly => "query_only",
            MdnsMode::QueryAndGather => "query_and_gather",
        }
    }
}

/// Host name advertised when gathering mDNS candidates for connection `peer_id`
pub fn mdns_host_name(peer_id: u64) -> String {
    format!("calls-peer-{peer_id}.local")
}
