//! Fieldlink Mesh -- relay session lifecycle and peer roster.
//!
//! The session state machine is pure: it consumes edge events and returns
//! the actions the I/O task must take. All sockets, timers and channels
//! live in the node crate; everything here is directly testable.

use serde::{Deserialize, Serialize};

pub mod outbox;
pub mod roster;
pub mod session;

pub use outbox::{BroadcastRecord, MeshOutbox};
pub use roster::{MeshPeer, MeshRoster, RosterSource};
pub use session::{MeshSession, SessionAction};

use fieldlink_protocol::MeshPeerId;

/// Reachability of the wide-area internet path, as reported by the
/// connectivity monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetMode {
    Online,
    Offline,
}

/// Lifecycle state of the relay link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeshStatus {
    Disconnected,
    Connecting,
    Connected,
    /// Relay unreachable; roster synthesized locally so the rest of the
    /// node keeps exercising the offline path.
    Simulated,
}

impl MeshStatus {
    pub fn name(&self) -> &'static str {
        match self {
            MeshStatus::Disconnected => "disconnected",
            MeshStatus::Connecting => "connecting",
            MeshStatus::Connected => "connected",
            MeshStatus::Simulated => "simulated",
        }
    }

    /// True when frames actually reach other nodes.
    pub fn is_live(&self) -> bool {
        matches!(self, MeshStatus::Connected)
    }

    /// True when the mesh subsystem is serving a roster, live or not.
    pub fn is_active(&self) -> bool {
        matches!(self, MeshStatus::Connected | MeshStatus::Simulated)
    }
}

/// Generate this node's mesh peer id: `peer_` plus nine alphanumerics.
pub fn generate_peer_id() -> MeshPeerId {
    use rand::Rng;
    let suffix: String = rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(9)
        .map(char::from)
        .collect();
    format!("peer_{suffix}")
}
