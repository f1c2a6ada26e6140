//! Node wiring -- builds every task from config and starts them.
//!
//! `Node::start` is the single composition point: main.rs and the
//! integration harness both go through it, so tests exercise the same
//! channel topology as a deployed node.

use std::sync::Arc;

use chrono::Utc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, watch, RwLock};

use fieldlink_api::{AppState, IngestRequest, IngestTx};
use fieldlink_dispatch::{Arrival, EmergencyTimerRegistry};
use fieldlink_mesh::{generate_peer_id, MeshOutbox, MeshRoster, MeshStatus, NetMode};
use fieldlink_protocol::{service_name, GeoPoint, CURRENT_PARAMS};
use fieldlink_store::{IncidentStore, Ingress, IngressEvent, Notice, ServiceStatus};

use crate::config::NodeConfig;
use crate::connectivity::spawn_connectivity_monitor;
use crate::geocode::{run_geocode_queue, NominatimGeocoder};
use crate::ingest::{run_merge_loop, MergeDeps};
use crate::mesh_task::{run_mesh_task, MeshDeps};
use crate::notify::{new_notice_log, run_notice_collector, NoticeLog};
use crate::remote::{run_remote_task, RemoteSyncChannel};

/// Handle to a running node. Dropping it does not stop the node; call
/// [`NodeHandle::shutdown`].
pub struct NodeHandle {
    pub api_addr: std::net::SocketAddr,
    pub bearer_token: String,
    pub node_id: String,
    pub entity_id: String,
    pub store: Arc<RwLock<IncidentStore>>,
    pub ingest: IngestTx,
    pub notices: NoticeLog,
    pub roster: MeshRoster,
    pub outbox: MeshOutbox,
    pub mesh_status: watch::Receiver<MeshStatus>,
    pub net_mode: watch::Receiver<NetMode>,
    pub timers: EmergencyTimerRegistry,
    shutdown_tx: broadcast::Sender<()>,
}

impl NodeHandle {
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

pub struct Node;

impl Node {
    pub async fn start<R: RemoteSyncChannel>(
        config: NodeConfig,
        remote: R,
        bearer_token: String,
    ) -> anyhow::Result<NodeHandle> {
        let own_location = GeoPoint::new(config.node.lat, config.node.lng);
        let node_id = generate_peer_id();
        let (shutdown_tx, _) = broadcast::channel(8);

        let store = Arc::new(RwLock::new(IncidentStore::new(
            Some(own_location),
            config.notify.nearby_radius_km,
        )));

        let (ingest_tx, ingest_rx) =
            mpsc::channel::<IngestRequest>(CURRENT_PARAMS.ingest_channel_capacity);
        let (geocode_tx, geocode_rx) = mpsc::channel(64);
        let (notice_tx, notice_rx) = mpsc::channel(64);
        let (mesh_tx, mesh_rx) = mpsc::channel(64);
        let (arrivals_tx, arrivals_rx) = mpsc::channel(16);
        let (mesh_status_tx, mesh_status_rx) = watch::channel(MeshStatus::Disconnected);

        let net_rx =
            spawn_connectivity_monitor(config.connectivity.clone(), shutdown_tx.subscribe());

        let roster = MeshRoster::new();
        let outbox = MeshOutbox::new();
        let timers = EmergencyTimerRegistry::new(arrivals_tx);
        let notices = new_notice_log();

        tokio::spawn(run_merge_loop(
            ingest_rx,
            MergeDeps {
                store: store.clone(),
                geocode_tx,
                geocode_enabled: config.geocode.enabled,
                notice_tx: notice_tx.clone(),
                mesh_tx,
                outbox: outbox.clone(),
                remote: remote.clone(),
                net: net_rx.clone(),
                node_id: node_id.clone(),
                own_location,
            },
            shutdown_tx.subscribe(),
        ));

        tokio::spawn(run_remote_task(
            remote,
            ingest_tx.clone(),
            shutdown_tx.subscribe(),
        ));

        tokio::spawn(run_mesh_task(
            MeshDeps {
                relay_addr: config.mesh.relay_addr.clone(),
                peer_id: node_id.clone(),
                own_location,
                simulate_when_unreachable: config.mesh.simulate_when_unreachable,
                roster: roster.clone(),
                ingest: ingest_tx.clone(),
                notice_tx: notice_tx.clone(),
                status_tx: mesh_status_tx,
            },
            mesh_rx,
            net_rx.clone(),
            shutdown_tx.subscribe(),
        ));

        if config.geocode.enabled {
            let geocoder = NominatimGeocoder::new(&config.geocode)?;
            tokio::spawn(run_geocode_queue(
                geocode_rx,
                geocoder,
                ingest_tx.clone(),
                shutdown_tx.subscribe(),
            ));
        }

        tokio::spawn(run_notice_collector(
            notice_rx,
            notices.clone(),
            config.notify.history,
            shutdown_tx.subscribe(),
        ));

        tokio::spawn(run_arrivals(
            arrivals_rx,
            ingest_tx.clone(),
            store.clone(),
            notice_tx,
            shutdown_tx.subscribe(),
        ));

        let state = Arc::new(AppState {
            store: store.clone(),
            ingest: ingest_tx.clone(),
            timers: timers.clone(),
            roster: roster.clone(),
            outbox: outbox.clone(),
            mesh_status: mesh_status_rx.clone(),
            net_mode: net_rx.clone(),
            notices: notices.clone(),
            node_id: node_id.clone(),
            entity_id: config.node.entity_id.clone(),
            bearer_token: bearer_token.clone(),
            start_time: std::time::Instant::now(),
        });

        let listener = TcpListener::bind(&config.node.api_addr).await?;
        let api_addr = listener.local_addr()?;
        let app = fieldlink_api::router(state);
        let mut api_shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = api_shutdown.recv().await;
            });
            if let Err(e) = serve.await {
                tracing::error!(error = %e, "api server failed");
            }
        });

        tracing::info!(
            %node_id,
            entity = %config.node.entity_id,
            api = %api_addr,
            relay = %config.mesh.relay_addr,
            "node started"
        );

        Ok(NodeHandle {
            api_addr,
            bearer_token,
            node_id,
            entity_id: config.node.entity_id,
            store,
            ingest: ingest_tx,
            notices,
            roster,
            outbox,
            mesh_status: mesh_status_rx,
            net_mode: net_rx,
            timers,
            shutdown_tx,
        })
    }
}

/// Turn elapsed dispatch timers into a notification and an incident
/// service-status update.
async fn run_arrivals(
    mut rx: mpsc::Receiver<Arrival>,
    ingest: IngestTx,
    store: Arc<RwLock<IncidentStore>>,
    notice_tx: mpsc::Sender<Notice>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            arrival = rx.recv() => {
                let Some(arrival) = arrival else { return };
                let _ = notice_tx
                    .send(Notice {
                        title: format!("{} has arrived", service_name(&arrival.service_code)),
                        body: match &arrival.incident_id {
                            Some(id) => format!("Dispatched service reached incident {id}"),
                            None => "Dispatched service reached the caller".to_string(),
                        },
                        at: Utc::now(),
                    })
                    .await;

                if let Some(incident_id) = arrival.incident_id {
                    let record = store.read().await.incident(&incident_id).cloned();
                    if let Some(mut record) = record {
                        record.service_status = ServiceStatus::Arrived;
                        record.updated_at = Utc::now();
                        let _ = ingest
                            .send(IngestRequest {
                                event: IngressEvent::IncidentUpsert {
                                    incident: record,
                                    source: Ingress::Local,
                                },
                                reply: None,
                            })
                            .await;
                    }
                }
            }
        }
    }
}
