//! Mesh wire frames.
//!
//! JSON objects tagged on `type`, field names matching the relay wire format
//! (camelCase where the relay uses it). Timestamps are epoch milliseconds as
//! sent by every existing relay client.

use serde::{Deserialize, Serialize};

use crate::{GeoPoint, MeshPeerId, ProtocolError};

/// Frame types this node understands. Anything else is logged and skipped
/// by the codec, never treated as fatal.
pub const KNOWN_FRAME_TYPES: &[&str] = &[
    "handshake",
    "heartbeat",
    "peer_list",
    "emergency_broadcast",
    "resource_share",
    "location_update",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MeshFrame {
    /// Sent once immediately after the link comes up.
    Handshake {
        #[serde(rename = "peerId")]
        peer_id: MeshPeerId,
        location: GeoPoint,
        timestamp: i64,
    },
    /// Keep-alive, sent every `heartbeat_interval_secs` while connected.
    Heartbeat,
    /// Full roster replacement from the relay.
    PeerList { peers: Vec<PeerEntry> },
    /// Emergency alert flooded to all peers on the relay.
    EmergencyBroadcast {
        content: String,
        location: GeoPoint,
        timestamp: i64,
        sender: MeshPeerId,
    },
    /// Freeform resource offer. Payload shape is relay-defined.
    ResourceShare { resource: serde_json::Value },
    /// A peer moved.
    LocationUpdate {
        #[serde(rename = "peerId")]
        peer_id: MeshPeerId,
        location: GeoPoint,
    },
}

impl MeshFrame {
    pub fn frame_type(&self) -> &'static str {
        match self {
            MeshFrame::Handshake { .. } => "handshake",
            MeshFrame::Heartbeat => "heartbeat",
            MeshFrame::PeerList { .. } => "peer_list",
            MeshFrame::EmergencyBroadcast { .. } => "emergency_broadcast",
            MeshFrame::ResourceShare { .. } => "resource_share",
            MeshFrame::LocationUpdate { .. } => "location_update",
        }
    }

    /// Decode a raw JSON frame. Returns `Ok(None)` for a well-formed frame
    /// whose `type` this node does not know (forward compatibility).
    pub fn from_json(value: serde_json::Value) -> Result<Option<MeshFrame>, ProtocolError> {
        let frame_type = value
            .as_object()
            .and_then(|o| o.get("type"))
            .and_then(|t| t.as_str())
            .ok_or(ProtocolError::MalformedFrame)?;

        if !KNOWN_FRAME_TYPES.contains(&frame_type) {
            return Ok(None);
        }

        Ok(Some(serde_json::from_value(value)?))
    }
}

/// Roster entry as shipped in `peer_list`. Relays differ in how much they
/// know about a peer, so everything beyond the id is optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerEntry {
    pub id: MeshPeerId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub location: Option<GeoPoint>,
    /// Distance from the relay's reference point in km, if the relay computes it.
    #[serde(default)]
    pub distance: Option<f64>,
    /// Peer kind: "responder", "medical", "volunteer", ...
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
}
