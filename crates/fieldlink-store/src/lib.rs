//! Fieldlink Store -- the merged, de-duplicated in-memory incident state.
//!
//! Single source of truth for incidents and their chat streams. Two ingress
//! paths (Remote Store deltas, mesh broadcasts) plus local user actions all
//! normalize into [`IngressEvent`] values; a single consumer serializes them
//! through [`store::IncidentStore::apply`], which is the sole arbiter of
//! conflicting writes. Side effects come back as explicit values rather than
//! callbacks so the caller decides how to dispatch them.

use chrono::{DateTime, Utc};
use fieldlink_protocol::{GeoPoint, IncidentId, CURRENT_PARAMS};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub mod model;
pub mod store;

pub use model::{
    is_provisional, new_provisional_id, ChatMessage, IncidentEvent, IncidentKind, MediaAttachment,
    MediaKind, MessagePayload, ServiceStatus,
};
pub use store::IncidentStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unknown incident: {0}")]
    UnknownIncident(IncidentId),
}

/// Which path an event arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ingress {
    /// Cloud Remote Store snapshot/delta.
    Remote,
    /// Mesh broadcast.
    Mesh,
    /// Local user action on this node.
    Local,
}

/// The common event shape both ingress paths normalize into.
#[derive(Debug, Clone)]
pub enum IngressEvent {
    IncidentUpsert {
        incident: IncidentEvent,
        source: Ingress,
    },
    /// Logical deletion by the incident's creator.
    IncidentTombstone {
        id: IncidentId,
        at: DateTime<Utc>,
        source: Ingress,
    },
    ChatArrived {
        message: ChatMessage,
        source: Ingress,
    },
    /// Enrichment result from the geocode queue.
    AddressResolved {
        id: IncidentId,
        address: String,
        city: Option<String>,
    },
    /// A volunteer responded to an incident. Idempotent per user.
    Respond {
        incident_id: IncidentId,
        user_id: String,
        at: DateTime<Utc>,
    },
    MediaAdded {
        incident_id: IncidentId,
        attachment: MediaAttachment,
    },
    /// Cascading media removal: from the incident's attachment list and from
    /// every referencing chat message, as two independent steps.
    MediaRemoved {
        incident_id: IncidentId,
        path: String,
        source: Ingress,
    },
}

/// What the merge did with an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    InsertedIncident,
    UpdatedIncident,
    /// Incoming record lost last-write-wins; nothing beyond backfill applied.
    StaleIncident,
    Tombstoned,
    MessageInserted,
    /// Same sender, same content hash, within the dedup window -- dropped.
    DuplicateMessage,
    /// Parent incident unknown -- dropped.
    OrphanDropped,
    /// Parent incident tombstoned -- dropped.
    TombstonedParent,
    RespondRecorded,
    AlreadyResponded,
    AddressApplied,
    /// Incident already had an address -- enrichment result discarded.
    AddressMoot,
    MediaAdded,
    MediaRemoved {
        from_incident: bool,
        messages_removed: usize,
    },
    /// Target incident does not exist.
    NotFound,
}

/// Side effects the caller must dispatch after a merge.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEffect {
    /// Incident lacks an address -- enqueue an enrichment job.
    GeocodeNeeded {
        incident_id: IncidentId,
        location: GeoPoint,
    },
    /// Deliver to the notification sink.
    Notify(Notice),
    /// A provisional id was retired in favour of a server-issued one.
    Reconciled {
        retired_id: IncidentId,
        canonical_id: IncidentId,
    },
}

/// A notification for the external delivery collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notice {
    pub title: String,
    pub body: String,
    pub at: DateTime<Utc>,
}

/// SHA-256 hex of a message's dedup content.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Coarse timestamp bucket for chat deduplication.
pub fn dedup_bucket(ts: DateTime<Utc>) -> i64 {
    ts.timestamp().div_euclid(CURRENT_PARAMS.chat_dedup_window_secs)
}

/// Composite dedup key: sender, content hash, coarse timestamp bucket.
pub fn dedup_key(sender_id: &str, hash: &str, bucket: i64) -> String {
    format!("{sender_id}|{hash}|{bucket}")
}
