//! Peer roster -- thread-safe registry of mesh peers.
//!
//! The mesh task owns the relay connection; this roster tracks who is
//! reachable. Entries come from relay `peer_list` frames, incremental
//! `location_update` frames, or the simulated fallback.

use std::collections::HashMap;
use std::sync::Arc;

use fieldlink_protocol::{frames::PeerEntry, GeoPoint, MeshPeerId};
use tokio::sync::RwLock;

/// Where a roster entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RosterSource {
    Live,
    Simulated,
}

#[derive(Debug, Clone)]
pub struct MeshPeer {
    pub id: MeshPeerId,
    pub name: Option<String>,
    pub kind: Option<String>,
    pub location: Option<GeoPoint>,
    pub distance_km: Option<f64>,
    pub source: RosterSource,
}

/// Thread-safe mesh peer registry.
#[derive(Clone, Default)]
pub struct MeshRoster {
    inner: Arc<RwLock<HashMap<MeshPeerId, MeshPeer>>>,
}

impl MeshRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the live roster with a relay peer-list snapshot. A missing
    /// distance is derived from our own location when both ends are known.
    pub async fn apply_peer_list(&self, entries: Vec<PeerEntry>, own_location: Option<GeoPoint>) {
        let mut roster = self.inner.write().await;
        roster.retain(|_, p| p.source != RosterSource::Live);
        for entry in entries {
            let distance_km = entry.distance.or_else(|| {
                match (own_location, entry.location) {
                    (Some(own), Some(theirs)) => Some(own.distance_km(&theirs)),
                    _ => None,
                }
            });
            roster.insert(
                entry.id.clone(),
                MeshPeer {
                    id: entry.id,
                    name: entry.name,
                    kind: entry.kind,
                    location: entry.location,
                    distance_km,
                    source: RosterSource::Live,
                },
            );
        }
        tracing::info!(peers = roster.len(), "roster: peer list applied");
    }

    /// Apply an incremental location update, creating the entry if the
    /// snapshot has not mentioned the peer yet.
    pub async fn update_location(
        &self,
        peer_id: &str,
        location: GeoPoint,
        own_location: Option<GeoPoint>,
    ) {
        let mut roster = self.inner.write().await;
        let distance_km = own_location.map(|own| own.distance_km(&location));
        roster
            .entry(peer_id.to_string())
            .and_modify(|p| {
                p.location = Some(location);
                p.distance_km = distance_km;
            })
            .or_insert_with(|| MeshPeer {
                id: peer_id.to_string(),
                name: None,
                kind: None,
                location: Some(location),
                distance_km,
                source: RosterSource::Live,
            });
    }

    /// Populate the synthesized roster used when the relay is unreachable.
    pub async fn seed_simulated(&self) {
        let fixtures = [
            ("peer_1", "Emergency Responder 1", "responder", 0.5),
            ("peer_2", "Medical Team", "medical", 1.2),
            ("peer_3", "Volunteer", "volunteer", 0.8),
        ];
        let mut roster = self.inner.write().await;
        for (id, name, kind, distance) in fixtures {
            roster.insert(
                id.to_string(),
                MeshPeer {
                    id: id.to_string(),
                    name: Some(name.to_string()),
                    kind: Some(kind.to_string()),
                    location: None,
                    distance_km: Some(distance),
                    source: RosterSource::Simulated,
                },
            );
        }
        tracing::info!(peers = roster.len(), "roster: simulated peers seeded");
    }

    /// Drop everything. Called on session teardown.
    pub async fn clear(&self) {
        self.inner.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    /// Snapshot sorted nearest-first, unknown distances last.
    pub async fn peers(&self) -> Vec<MeshPeer> {
        let mut out: Vec<MeshPeer> = self.inner.read().await.values().cloned().collect();
        out.sort_by(|a, b| {
            let da = a.distance_km.unwrap_or(f64::MAX);
            let db = b.distance_km.unwrap_or(f64::MAX);
            da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
        });
        out
    }
}
