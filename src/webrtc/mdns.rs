use serde::{Deserialize, Serialize};
use webrtc::ice::mdns::MulticastDnsMode;

pub const MDNS_MODE_ENV: &str = "ROOM_MESH_WEBRTC_MDNS_MODE";

/// mDNS candidate handling for peer transports
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MdnsMode {
    Disabled,
    /// Resolve `.local` candidates from peers but never advertise our own
    #[default]
    QueryOnly,
    QueryAndGather,
}

impl From<MdnsMode> for MulticastDnsMode {
    fn from(mode: MdnsMode) -> Self {
        match mode {
            MdnsMode::Disabled => MulticastDnsMode::Disabled,
            MdnsMode::QueryOnly => MulticastDnsMode::QueryOnly,
            MdnsMode::QueryAndGather => MulticastDnsMode::QueryAndGather,
        }
    }
}

pub fn parse_mdns_mode(raw: &str) -> Option<MdnsMode> {
    let value = raw.trim().to_ascii_lowercase();
    match value.as_str() {
        "disabled" | "off" | "false" | "0" => Some(MdnsMode::Disabled),
        "query" | "query_only" | "query-only" => Some(MdnsMode::QueryOnly),
        "gather" | "query_and_gather" | "query-and-gather" | "on" | "true" | "1" => {
            Some(MdnsMode::QueryAndGather)
        }
        _ => None,
    }
}

/// Host name a participant advertises when gathering mDNS candidates
pub fn mdns_host_name(participant_id: &str) -> String {
    format!("{participant_id}.local")
}
