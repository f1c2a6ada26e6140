//! Geocode enrichment queue -- resolves human-readable addresses for
//! incidents stored with only coordinates.
//!
//! At most one lookup is in flight per incident id; requests for an id
//! already being resolved are dropped. Failures are dropped silently --
//! the merge loop re-requests enrichment the next time an unaddressed
//! record merges, so no retry state lives here.

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use fieldlink_protocol::{GeoPoint, IncidentId};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;

use fieldlink_api::{IngestRequest, IngestTx};
use fieldlink_store::IngressEvent;

use crate::config::GeocodeSection;

#[derive(Debug, Clone, PartialEq)]
pub struct GeocodeJob {
    pub incident_id: IncidentId,
    pub location: GeoPoint,
}

#[derive(Debug, Clone)]
pub struct ResolvedAddress {
    pub display_name: String,
    pub city: Option<String>,
}

pub trait Geocoder: Clone + Send + Sync + 'static {
    fn reverse(
        &self,
        location: GeoPoint,
    ) -> impl Future<Output = anyhow::Result<ResolvedAddress>> + Send;
}

/// Reverse geocoder against a Nominatim-compatible endpoint.
#[derive(Clone)]
pub struct NominatimGeocoder {
    client: reqwest::Client,
    endpoint: String,
}

impl NominatimGeocoder {
    pub fn new(cfg: &GeocodeSection) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(NominatimGeocoder {
            client,
            endpoint: cfg.endpoint.clone(),
        })
    }
}

impl Geocoder for NominatimGeocoder {
    async fn reverse(&self, location: GeoPoint) -> anyhow::Result<ResolvedAddress> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[
                ("format", "json".to_string()),
                ("lat", location.lat.to_string()),
                ("lon", location.lng.to_string()),
            ])
            .send()
            .await?
            .error_for_status()?;

        let body: serde_json::Value = response.json().await?;
        let display_name = body
            .get("display_name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("no display_name in response"))?
            .to_string();
        let address = body.get("address");
        let city = ["city", "town", "village"]
            .iter()
            .find_map(|key| address?.get(key)?.as_str())
            .map(str::to_string);

        Ok(ResolvedAddress { display_name, city })
    }
}

/// Drain enrichment jobs, keeping at most one lookup in flight per id.
pub async fn run_geocode_queue<G: Geocoder>(
    mut rx: mpsc::Receiver<GeocodeJob>,
    geocoder: G,
    ingest: IngestTx,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut in_flight: HashSet<IncidentId> = HashSet::new();
    let mut lookups: JoinSet<(IncidentId, Option<ResolvedAddress>)> = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            job = rx.recv() => {
                let Some(job) = job else { return };
                if !in_flight.insert(job.incident_id.clone()) {
                    tracing::debug!(id = %job.incident_id, "geocode already in flight, dropped");
                    continue;
                }
                let geocoder = geocoder.clone();
                lookups.spawn(async move {
                    let resolved = match geocoder.reverse(job.location).await {
                        Ok(addr) => Some(addr),
                        Err(e) => {
                            // Dropped, not retried: the next merge of an
                            // unaddressed record re-enqueues the job.
                            tracing::warn!(id = %job.incident_id, error = %e, "geocode lookup failed");
                            None
                        }
                    };
                    (job.incident_id, resolved)
                });
            }
            Some(done) = lookups.join_next() => {
                let Ok((id, resolved)) = done else { continue };
                in_flight.remove(&id);
                if let Some(addr) = resolved {
                    tracing::info!(%id, address = %addr.display_name, "geocode resolved");
                    let _ = ingest.send(IngestRequest {
                        event: IngressEvent::AddressResolved {
                            id,
                            address: addr.display_name,
                            city: addr.city,
                        },
                        reply: None,
                    }).await;
                }
            }
        }
    }
}
