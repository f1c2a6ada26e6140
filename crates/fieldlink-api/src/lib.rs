//! Fieldlink API -- local node HTTP interface.
//!
//! HTTP on 127.0.0.1, bearer token auth from the node's token file.
//! POST-only JSON routes. Reads take a snapshot of the store; every write
//! goes through the ingest channel so the merge loop stays the single
//! writer.

use std::collections::VecDeque;
use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch, RwLock};

use fieldlink_dispatch::EmergencyTimerRegistry;
use fieldlink_mesh::{MeshOutbox, MeshRoster, MeshStatus, NetMode, RosterSource};
use fieldlink_protocol::GeoPoint;
use fieldlink_store::{
    new_provisional_id, IncidentEvent, IncidentKind, IncidentStore, Ingress, IngressEvent,
    MergeOutcome, MessagePayload, Notice, ServiceStatus,
};

/// A write handed to the merge loop, with an optional reply channel for
/// callers that need the outcome.
pub struct IngestRequest {
    pub event: IngressEvent,
    pub reply: Option<oneshot::Sender<MergeOutcome>>,
}

pub type IngestTx = mpsc::Sender<IngestRequest>;

/// Shared state for all API handlers.
pub struct AppState {
    pub store: Arc<RwLock<IncidentStore>>,
    pub ingest: IngestTx,
    pub timers: EmergencyTimerRegistry,
    pub roster: MeshRoster,
    pub outbox: MeshOutbox,
    pub mesh_status: watch::Receiver<MeshStatus>,
    pub net_mode: watch::Receiver<NetMode>,
    pub notices: Arc<RwLock<VecDeque<Notice>>>,
    pub node_id: String,
    pub entity_id: String,
    pub bearer_token: String,
    pub start_time: std::time::Instant,
}

/// Build the axum router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/status", post(status))
        .route("/api/v1/incidents/list", post(incidents_list))
        .route("/api/v1/incidents/create", post(incidents_create))
        .route("/api/v1/incidents/respond", post(incidents_respond))
        .route("/api/v1/incidents/delete", post(incidents_delete))
        .route("/api/v1/chat/list", post(chat_list))
        .route("/api/v1/chat/send", post(chat_send))
        .route("/api/v1/media/delete", post(media_delete))
        .route("/api/v1/peers", post(peers))
        .route("/api/v1/timers/list", post(timers_list))
        .route("/api/v1/timers/start", post(timers_start))
        .route("/api/v1/timers/cancel", post(timers_cancel))
        .route("/api/v1/notifications", post(notifications))
        .with_state(state)
}

// ============================================================================
// Auth middleware (inline check)
// ============================================================================

fn check_auth(state: &AppState, headers: &HeaderMap) -> Result<(), (StatusCode, &'static str)> {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let expected = format!("Bearer {}", state.bearer_token);
    if auth != expected {
        return Err((StatusCode::UNAUTHORIZED, "invalid bearer token"));
    }
    Ok(())
}

/// Hand an event to the merge loop and wait for its outcome.
async fn submit(state: &AppState, event: IngressEvent) -> Result<MergeOutcome, StatusCode> {
    let (tx, rx) = oneshot::channel();
    state
        .ingest
        .send(IngestRequest {
            event,
            reply: Some(tx),
        })
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    rx.await.map_err(|_| StatusCode::SERVICE_UNAVAILABLE)
}

fn outcome_response(outcome: MergeOutcome) -> axum::response::Response {
    let status = match &outcome {
        MergeOutcome::NotFound | MergeOutcome::OrphanDropped => StatusCode::NOT_FOUND,
        MergeOutcome::TombstonedParent => StatusCode::CONFLICT,
        _ => StatusCode::OK,
    };
    (
        status,
        Json(serde_json::json!({
            "ok": status == StatusCode::OK,
            "outcome": format!("{outcome:?}"),
        })),
    )
        .into_response()
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Deserialize)]
pub struct IncidentCreateRequest {
    pub kind: IncidentKind,
    pub lat: f64,
    pub lng: f64,
}

#[derive(Deserialize)]
pub struct IncidentIdRequest {
    pub incident_id: String,
}

#[derive(Deserialize)]
pub struct ChatSendRequest {
    pub incident_id: String,
    pub text: String,
}

#[derive(Deserialize)]
pub struct MediaDeleteRequest {
    pub incident_id: String,
    pub path: String,
}

#[derive(Deserialize)]
pub struct TimerStartRequest {
    pub service_code: String,
    #[serde(default)]
    pub incident_id: Option<String>,
}

#[derive(Deserialize)]
pub struct TimerCancelRequest {
    pub dispatch_id: String,
}

/// Mesh peer details for API responses.
#[derive(Debug, Clone, Serialize)]
pub struct PeerDetail {
    pub id: String,
    pub name: Option<String>,
    pub kind: Option<String>,
    pub distance_km: Option<f64>,
    pub simulated: bool,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub node_id: String,
    pub entity_id: String,
    pub uptime_secs: u64,
    pub net: NetMode,
    pub mesh: MeshStatus,
    pub mesh_peers: usize,
    pub incidents: usize,
    pub messages: usize,
    pub timers: usize,
}

// ============================================================================
// Handlers
// ============================================================================

async fn status(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }

    let (incidents, messages) = {
        let store = state.store.read().await;
        (store.incident_count(), store.message_count())
    };
    // Copy out of the watch guards before awaiting; a held `watch::Ref`
    // would make this future !Send.
    let net = *state.net_mode.borrow();
    let mesh = *state.mesh_status.borrow();

    Json(StatusResponse {
        node_id: state.node_id.clone(),
        entity_id: state.entity_id.clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        net,
        mesh,
        mesh_peers: state.roster.len().await,
        incidents,
        messages,
        timers: state.timers.len().await,
    })
    .into_response()
}

async fn incidents_list(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }

    let store = state.store.read().await;
    let incidents: Vec<IncidentEvent> = store.live_incidents().into_iter().cloned().collect();
    Json(serde_json::json!({ "incidents": incidents })).into_response()
}

async fn incidents_create(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<IncidentCreateRequest>,
) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }

    // Local-first: the incident lands in the store under a provisional id
    // immediately; the merge loop schedules the remote write-behind and a
    // later snapshot reconciles the server id.
    let now = Utc::now();
    let incident = IncidentEvent {
        id: new_provisional_id(),
        kind: req.kind,
        location: GeoPoint::new(req.lat, req.lng),
        address: None,
        city: None,
        responders: Default::default(),
        service_status: ServiceStatus::NotArrived,
        created_by: state.entity_id.clone(),
        created_at: now,
        updated_at: now,
        attachments: Vec::new(),
        tombstoned: false,
    };
    let id = incident.id.clone();

    match submit(
        &state,
        IngressEvent::IncidentUpsert {
            incident,
            source: Ingress::Local,
        },
    )
    .await
    {
        Ok(MergeOutcome::InsertedIncident) => {
            tracing::info!(%id, "incident created");
            Json(serde_json::json!({ "ok": true, "id": id })).into_response()
        }
        Ok(other) => outcome_response(other),
        Err(code) => (code, "ingest unavailable").into_response(),
    }
}

async fn incidents_respond(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<IncidentIdRequest>,
) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }

    match submit(
        &state,
        IngressEvent::Respond {
            incident_id: req.incident_id,
            user_id: state.entity_id.clone(),
            at: Utc::now(),
        },
    )
    .await
    {
        Ok(outcome) => outcome_response(outcome),
        Err(code) => (code, "ingest unavailable").into_response(),
    }
}

async fn incidents_delete(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<IncidentIdRequest>,
) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }

    // Only the creator may delete.
    {
        let store = state.store.read().await;
        match store.incident(&req.incident_id) {
            None => return (StatusCode::NOT_FOUND, "incident not found").into_response(),
            Some(incident) if incident.created_by != state.entity_id => {
                return (StatusCode::FORBIDDEN, "not the creator").into_response();
            }
            Some(_) => {}
        }
    }

    match submit(
        &state,
        IngressEvent::IncidentTombstone {
            id: req.incident_id.clone(),
            at: Utc::now(),
            source: Ingress::Local,
        },
    )
    .await
    {
        Ok(outcome) => {
            tracing::info!(id = %req.incident_id, "incident deleted");
            outcome_response(outcome)
        }
        Err(code) => (code, "ingest unavailable").into_response(),
    }
}

async fn chat_list(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<IncidentIdRequest>,
) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }

    let store = state.store.read().await;
    if store.incident(&req.incident_id).is_none() {
        return (StatusCode::NOT_FOUND, "incident not found").into_response();
    }
    Json(serde_json::json!({ "messages": store.messages(&req.incident_id) })).into_response()
}

async fn chat_send(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ChatSendRequest>,
) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }

    let message = fieldlink_store::ChatMessage {
        incident_id: req.incident_id,
        sender_id: state.entity_id.clone(),
        sender_name: state.entity_id.clone(),
        timestamp: Utc::now(),
        seq: 0,
        payload: MessagePayload::Text { text: req.text },
    };

    match submit(
        &state,
        IngressEvent::ChatArrived {
            message,
            source: Ingress::Local,
        },
    )
    .await
    {
        Ok(outcome) => outcome_response(outcome),
        Err(code) => (code, "ingest unavailable").into_response(),
    }
}

async fn media_delete(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<MediaDeleteRequest>,
) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }

    match submit(
        &state,
        IngressEvent::MediaRemoved {
            incident_id: req.incident_id,
            path: req.path,
            source: Ingress::Local,
        },
    )
    .await
    {
        Ok(outcome) => outcome_response(outcome),
        Err(code) => (code, "ingest unavailable").into_response(),
    }
}

async fn peers(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }

    let peers: Vec<PeerDetail> = state
        .roster
        .peers()
        .await
        .into_iter()
        .map(|p| PeerDetail {
            id: p.id,
            name: p.name,
            kind: p.kind,
            distance_km: p.distance_km,
            simulated: p.source == RosterSource::Simulated,
        })
        .collect();

    Json(serde_json::json!({
        "mesh": *state.mesh_status.borrow(),
        "total": peers.len(),
        "peers": peers,
    }))
    .into_response()
}

async fn timers_list(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }

    Json(serde_json::json!({ "timers": state.timers.snapshot().await })).into_response()
}

async fn timers_start(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<TimerStartRequest>,
) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }

    let dispatch_id = state
        .timers
        .start(&req.service_code, req.incident_id.clone())
        .await;

    // The service is now en route for the linked incident.
    if let Some(incident_id) = req.incident_id {
        let record = {
            let store = state.store.read().await;
            store
                .incident(&incident_id)
                .filter(|i| i.service_status == ServiceStatus::NotArrived)
                .cloned()
        };
        if let Some(mut record) = record {
            record.service_status = ServiceStatus::EnRoute;
            record.updated_at = Utc::now();
            let _ = submit(
                &state,
                IngressEvent::IncidentUpsert {
                    incident: record,
                    source: Ingress::Local,
                },
            )
            .await;
        }
    }

    Json(serde_json::json!({ "ok": true, "dispatch_id": dispatch_id })).into_response()
}

async fn timers_cancel(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<TimerCancelRequest>,
) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }

    if state.timers.cancel(&req.dispatch_id).await {
        Json(serde_json::json!({ "ok": true })).into_response()
    } else {
        (StatusCode::NOT_FOUND, "no such timer").into_response()
    }
}

async fn notifications(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }

    let notices: Vec<Notice> = state.notices.read().await.iter().cloned().collect();
    Json(serde_json::json!({
        "notifications": notices,
        "mesh_outbound": state.outbox.snapshot().await,
    }))
    .into_response()
}
