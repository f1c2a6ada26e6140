//! Incident, chat, media and dispatch record types.

use chrono::{DateTime, Utc};
use fieldlink_protocol::{GeoPoint, IncidentId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Prefix for locally generated provisional incident ids.
pub const PROVISIONAL_PREFIX: &str = "local-";

/// Generate a provisional incident id for an incident created offline.
/// Retired during reconciliation once the Remote Store issues a real id.
pub fn new_provisional_id() -> IncidentId {
    use rand::Rng;
    let suffix: String = rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(12)
        .map(char::from)
        .collect();
    format!("{PROVISIONAL_PREFIX}{suffix}")
}

pub fn is_provisional(id: &str) -> bool {
    id.starts_with(PROVISIONAL_PREFIX)
}

/// Enumerated incident category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentKind {
    Accident,
    Fire,
    Medical,
    Flood,
    Other,
}

impl Default for IncidentKind {
    fn default() -> Self {
        IncidentKind::Other
    }
}

/// Arrival state of the dispatched emergency service for an incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    NotArrived,
    EnRoute,
    Arrived,
}

impl Default for ServiceStatus {
    fn default() -> Self {
        ServiceStatus::NotArrived
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Audio,
    Video,
}

/// A stored media object. The blob lives in external storage; only the
/// path/URL reference replicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaAttachment {
    /// Storage path, unique per object. Used as the attachment key.
    pub path: String,
    pub url: String,
    pub kind: MediaKind,
    pub uploaded_by: String,
    pub uploaded_at: DateTime<Utc>,
}

/// A reported emergency event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentEvent {
    pub id: IncidentId,
    pub kind: IncidentKind,
    pub location: GeoPoint,
    /// Null until the enrichment queue resolves it.
    pub address: Option<String>,
    pub city: Option<String>,
    /// Volunteers who have responded. Set semantics: responding twice is a no-op.
    #[serde(default)]
    pub responders: BTreeSet<String>,
    #[serde(default)]
    pub service_status: ServiceStatus,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub attachments: Vec<MediaAttachment>,
    /// Logical deletion. Tombstoned incidents stay in peers' caches until
    /// acknowledged; their chat streams stop accepting messages.
    #[serde(default)]
    pub tombstoned: bool,
}

impl IncidentEvent {
    pub fn responder_count(&self) -> usize {
        self.responders.len()
    }

    pub fn is_provisional(&self) -> bool {
        is_provisional(&self.id)
    }
}

/// Chat message payload variants. Media variants carry the storage path of
/// the attachment they reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MessagePayload {
    Text { text: String },
    Image { path: String },
    Audio { path: String },
    Video { path: String },
}

impl MessagePayload {
    /// The deduplication content: message text, or the media path.
    pub fn content(&self) -> &str {
        match self {
            MessagePayload::Text { text } => text,
            MessagePayload::Image { path }
            | MessagePayload::Audio { path }
            | MessagePayload::Video { path } => path,
        }
    }

    /// Storage path if this payload references media.
    pub fn media_path(&self) -> Option<&str> {
        match self {
            MessagePayload::Text { .. } => None,
            MessagePayload::Image { path }
            | MessagePayload::Audio { path }
            | MessagePayload::Video { path } => Some(path),
        }
    }
}

/// A chat message. Immutable once created; removed only by cascading media
/// deletion or with its parent incident.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub incident_id: IncidentId,
    pub sender_id: String,
    pub sender_name: String,
    /// Server-assigned when from the Remote Store; locally assigned
    /// (monotonic) when from the mesh, reconciled later.
    pub timestamp: DateTime<Utc>,
    /// Arrival sequence number, assigned by the store. Breaks timestamp ties
    /// and is never reassigned on later merges.
    #[serde(default)]
    pub seq: u64,
    pub payload: MessagePayload,
}
