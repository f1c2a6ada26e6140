//! Fieldlink Protocol -- mesh wire frames and shared protocol parameters.
//!
//! The mesh is a best-effort local broadcast transport: JSON frames with a
//! 4-byte length prefix over a plain TCP link to a nearby relay. No delivery
//! guarantee, no consensus -- peers that miss a frame catch up from the
//! Remote Store once connectivity returns.

use serde::{Deserialize, Serialize};

pub mod codec;
pub mod frames;
pub mod params;

pub use frames::MeshFrame;
pub use params::{service_eta, service_name, CURRENT_PARAMS, PARAMS_V1};

/// Incident identifier. Server-issued, or `local-*` while provisional.
pub type IncidentId = String;

/// Ephemeral mesh peer identifier (`peer_*`, regenerated per session).
pub type MeshPeerId = String;

/// A WGS84 coordinate pair as carried on the wire and in the store.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Great-circle distance to another point in kilometres (haversine).
    pub fn distance_km(&self, other: &GeoPoint) -> f64 {
        const EARTH_RADIUS_KM: f64 = 6371.0;
        let d_lat = (other.lat - self.lat).to_radians();
        let d_lng = (other.lng - self.lng).to_radians();
        let a = (d_lat / 2.0).sin().powi(2)
            + self.lat.to_radians().cos() * other.lat.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame too large: {size} bytes exceeds {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },
    #[error("frame is not a json object with a \"type\" field")]
    MalformedFrame,
}
