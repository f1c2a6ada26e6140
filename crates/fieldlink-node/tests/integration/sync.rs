//! Cloud-path convergence: two nodes sharing a Remote Store.

use std::time::Duration;

use crate::harness::{TestNode, TestNodeBuilder, WAIT};
use fieldlink_node::remote::InMemoryRemote;

async fn wait_messages(node: &TestNode, n: usize) {
    tokio::time::timeout(WAIT, async {
        while node.message_count().await != n {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("never saw {n} messages"));
}

#[tokio::test]
async fn test_incident_converges_and_reconciles() {
    let cloud = InMemoryRemote::new();
    let a = TestNodeBuilder::new("alice")
        .remote(cloud.clone())
        .build()
        .await
        .unwrap();
    let b = TestNodeBuilder::new("bob")
        .remote(cloud.clone())
        .build()
        .await
        .unwrap();

    let local_id = a.api_create_incident("fire", 12.9716, 77.5946).await;
    assert!(local_id.starts_with("local-"));

    // The write-behind lands on the cloud, which issues a server id; the
    // echo reconciles the creator's provisional record.
    let srv_id = a.wait_reconciled(&local_id).await;
    assert!(srv_id.starts_with("srv-"));

    b.wait_live_incidents(1).await;
    {
        let store = b.handle.store.read().await;
        let got = store.live_incidents()[0];
        assert_eq!(got.id, srv_id);
        assert_eq!(got.created_by, "alice");
    }

    // The creator's own echo must not duplicate the record.
    assert_eq!(a.handle.store.read().await.live_incidents().len(), 1);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_chat_echo_deduplicated() {
    let cloud = InMemoryRemote::new();
    let a = TestNodeBuilder::new("alice")
        .remote(cloud.clone())
        .build()
        .await
        .unwrap();
    let b = TestNodeBuilder::new("bob")
        .remote(cloud.clone())
        .build()
        .await
        .unwrap();

    let local_id = a.api_create_incident("medical", 12.9716, 77.5946).await;
    let srv_id = a.wait_reconciled(&local_id).await;
    b.wait_live_incidents(1).await;

    let resp = a
        .api_post(
            "/api/v1/chat/send",
            serde_json::json!({ "incident_id": srv_id, "text": "need oxygen cylinders" }),
        )
        .await
        .unwrap();
    assert_eq!(resp["outcome"], "MessageInserted");

    wait_messages(&b, 1).await;
    // Give the cloud echo time to come back around.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(a.message_count().await, 1, "own echo must deduplicate");
    assert_eq!(b.message_count().await, 1);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_delete_propagates_tombstone() {
    let cloud = InMemoryRemote::new();
    let a = TestNodeBuilder::new("alice")
        .remote(cloud.clone())
        .build()
        .await
        .unwrap();
    let b = TestNodeBuilder::new("bob")
        .remote(cloud.clone())
        .build()
        .await
        .unwrap();

    let local_id = a.api_create_incident("accident", 12.98, 77.60).await;
    let srv_id = a.wait_reconciled(&local_id).await;
    b.wait_live_incidents(1).await;

    let (status, resp) = a
        .api_post_raw(
            "/api/v1/incidents/delete",
            serde_json::json!({ "incident_id": srv_id }),
        )
        .await
        .unwrap();
    assert_eq!(status, 200, "delete failed: {resp}");

    b.wait_live_incidents(0).await;
    {
        let store = b.handle.store.read().await;
        // Tombstone is permanent, not an eviction.
        assert!(store.incident(&srv_id).unwrap().tombstoned);
    }

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_cloud_surfaces_sync_failure() {
    let cloud = InMemoryRemote::new();
    let a = TestNodeBuilder::new("alice")
        .remote(cloud.clone())
        .build()
        .await
        .unwrap();
    cloud.set_unreachable(true).await;

    // Local-first: the create succeeds even with the cloud down.
    let local_id = a.api_create_incident("flood", 12.9716, 77.5946).await;
    assert_eq!(a.handle.store.read().await.live_incidents().len(), 1);
    assert!(a
        .handle
        .store
        .read()
        .await
        .incident(&local_id)
        .is_some());

    // After the write-behind retries are exhausted the failure is surfaced.
    tokio::time::timeout(WAIT, async {
        loop {
            if a.handle
                .notices
                .read()
                .await
                .iter()
                .any(|n| n.title == "Sync Failed")
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("no Sync Failed notification");

    a.shutdown().await;
}
