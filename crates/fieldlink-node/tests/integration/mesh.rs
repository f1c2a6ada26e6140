//! Mesh-path tests: lifeline broadcasts between offline nodes via an
//! in-process relay, simulated fallback, and stand-down on reconnect.

use std::time::Duration;

use crate::harness::{TestNodeBuilder, TestRelay, WAIT};
use fieldlink_mesh::MeshStatus;

#[tokio::test]
async fn test_offline_broadcast_reaches_peer() {
    let relay = TestRelay::start().await;
    let mut a = TestNodeBuilder::new("alice")
        .relay(&relay.addr)
        .build()
        .await
        .unwrap();
    let mut b = TestNodeBuilder::new("bob")
        .relay(&relay.addr)
        .location(12.9756, 77.6068)
        .build()
        .await
        .unwrap();

    a.go_offline().await;
    b.go_offline().await;
    a.wait_mesh(MeshStatus::Connected).await;
    b.wait_mesh(MeshStatus::Connected).await;

    // Relay peer lists land in both rosters.
    tokio::time::timeout(WAIT, async {
        while a.handle.roster.len().await < 1 || b.handle.roster.len().await < 1 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("rosters never populated");

    // An incident created offline floods over the mesh; the receiver keeps
    // the creator's provisional id (no cloud in the loop between them).
    let id = a.api_create_incident("flood", 12.9716, 77.5946).await;
    b.wait_live_incidents(1).await;
    {
        let store = b.handle.store.read().await;
        let got = store.live_incidents()[0];
        assert_eq!(got.id, id);
        assert_eq!(got.created_by, "alice");
    }

    // The sender's outgoing log recorded the broadcast.
    let resp = a
        .api_post("/api/v1/notifications", serde_json::json!({}))
        .await
        .unwrap();
    let outbound = resp["mesh_outbound"].as_array().unwrap();
    assert_eq!(outbound.len(), 1);
    assert_eq!(outbound[0]["kind"], "incident");

    // The receiver is alerted.
    tokio::time::timeout(WAIT, async {
        loop {
            if b.handle
                .notices
                .read()
                .await
                .iter()
                .any(|n| n.title == "Emergency Alert via Mesh")
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("no mesh alert notification");

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_mesh_stands_down_when_back_online() {
    let relay = TestRelay::start().await;
    let mut a = TestNodeBuilder::new("alice")
        .relay(&relay.addr)
        .build()
        .await
        .unwrap();

    a.go_offline().await;
    a.wait_mesh(MeshStatus::Connected).await;

    a.go_online().await;
    a.wait_mesh(MeshStatus::Disconnected).await;
    assert!(a.handle.roster.is_empty().await);

    a.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_relay_simulated_roster() {
    // No relay listening at this address.
    let mut a = TestNodeBuilder::new("alice")
        .relay("127.0.0.1:1")
        .simulate_when_unreachable(true)
        .build()
        .await
        .unwrap();

    a.go_offline().await;
    a.wait_mesh(MeshStatus::Simulated).await;

    let resp = a.api_post("/api/v1/peers", serde_json::json!({})).await.unwrap();
    assert_eq!(resp["mesh"], "simulated");
    assert_eq!(resp["total"], 3);
    assert!(resp["peers"]
        .as_array()
        .unwrap()
        .iter()
        .all(|p| p["simulated"] == true));

    a.shutdown().await;
}
