//! Local API behavior: auth, incident lifecycle, dispatch timers.

use crate::harness::TestNodeBuilder;
use chrono::Utc;
use fieldlink_api::IngestRequest;
use fieldlink_protocol::GeoPoint;
use fieldlink_store::{
    IncidentEvent, IncidentKind, Ingress, IngressEvent, ServiceStatus,
};

#[tokio::test]
async fn test_bearer_auth_required() {
    let a = TestNodeBuilder::new("alice").build().await.unwrap();

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{}/api/v1/status", a.handle.api_addr))
        .header("Authorization", "Bearer wrong-token")
        .json(&serde_json::json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 401);

    // The right token works and the snapshot fields come through.
    let (status, body) = a
        .api_post_raw("/api/v1/status", serde_json::json!({}))
        .await
        .unwrap();
    assert_eq!(status, 200);
    assert_eq!(body["net"], "online");
    assert_eq!(body["mesh"], "disconnected");
    assert_eq!(body["incidents"], 0);

    a.shutdown().await;
}

#[tokio::test]
async fn test_incident_lifecycle() {
    let a = TestNodeBuilder::new("alice").build().await.unwrap();

    let id = a.api_create_incident("fire", 12.9716, 77.5946).await;

    // Responding is idempotent per user.
    let resp = a
        .api_post(
            "/api/v1/incidents/respond",
            serde_json::json!({ "incident_id": id }),
        )
        .await
        .unwrap();
    assert_eq!(resp["outcome"], "RespondRecorded");
    let resp = a
        .api_post(
            "/api/v1/incidents/respond",
            serde_json::json!({ "incident_id": id }),
        )
        .await
        .unwrap();
    assert_eq!(resp["outcome"], "AlreadyResponded");

    let (status, _) = a
        .api_post_raw(
            "/api/v1/incidents/delete",
            serde_json::json!({ "incident_id": id }),
        )
        .await
        .unwrap();
    assert_eq!(status, 200);

    // Chat into a tombstoned incident is rejected.
    let (status, resp) = a
        .api_post_raw(
            "/api/v1/chat/send",
            serde_json::json!({ "incident_id": id, "text": "anyone there?" }),
        )
        .await
        .unwrap();
    assert_eq!(status, 409, "expected conflict, got {resp}");

    a.shutdown().await;
}

#[tokio::test]
async fn test_delete_is_creator_only() {
    let a = TestNodeBuilder::new("alice").build().await.unwrap();

    // Seed a record created by somebody else, as a cloud delta would.
    let now = Utc::now();
    a.handle
        .ingest
        .send(IngestRequest {
            event: IngressEvent::IncidentUpsert {
                incident: IncidentEvent {
                    id: "srv-99".into(),
                    kind: IncidentKind::Accident,
                    location: GeoPoint::new(12.9716, 77.5946),
                    address: None,
                    city: None,
                    responders: Default::default(),
                    service_status: ServiceStatus::NotArrived,
                    created_by: "mallory".into(),
                    created_at: now,
                    updated_at: now,
                    attachments: Vec::new(),
                    tombstoned: false,
                },
                source: Ingress::Remote,
            },
            reply: None,
        })
        .await
        .unwrap();
    a.wait_live_incidents(1).await;

    let (status, _) = a
        .api_post_raw(
            "/api/v1/incidents/delete",
            serde_json::json!({ "incident_id": "srv-99" }),
        )
        .await
        .unwrap();
    assert_eq!(status, 403);

    a.shutdown().await;
}

#[tokio::test]
async fn test_timer_lifecycle() {
    let a = TestNodeBuilder::new("alice").build().await.unwrap();
    let id = a.api_create_incident("medical", 12.9716, 77.5946).await;

    let resp = a
        .api_post(
            "/api/v1/timers/start",
            serde_json::json!({ "service_code": "108", "incident_id": id }),
        )
        .await
        .unwrap();
    let dispatch_id = resp["dispatch_id"].as_str().unwrap().to_string();

    // Starting the timer marks the service en route.
    a.wait_live_incidents(1).await;
    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        loop {
            {
                let store = a.handle.store.read().await;
                if store.incident(&id).unwrap().service_status == ServiceStatus::EnRoute {
                    return;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("service never marked en route");

    let resp = a
        .api_post("/api/v1/timers/list", serde_json::json!({}))
        .await
        .unwrap();
    let timers = resp["timers"].as_array().unwrap();
    assert_eq!(timers.len(), 1);
    assert_eq!(timers[0]["service_name"], "Ambulance");
    assert!(timers[0]["remaining_secs"].as_i64().unwrap() <= 300);

    let (status, _) = a
        .api_post_raw(
            "/api/v1/timers/cancel",
            serde_json::json!({ "dispatch_id": dispatch_id }),
        )
        .await
        .unwrap();
    assert_eq!(status, 200);

    // Cancelling a dead timer is a 404.
    let (status, _) = a
        .api_post_raw(
            "/api/v1/timers/cancel",
            serde_json::json!({ "dispatch_id": dispatch_id }),
        )
        .await
        .unwrap();
    assert_eq!(status, 404);

    a.shutdown().await;
}
