//! Test harness for in-process fieldlink-node integration tests.
//!
//! Provides TestNode (a full node started through `Node::start`), a probe
//! endpoint the test controls to flip connectivity, and TestRelay, a
//! minimal in-process mesh relay that floods frames between links.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::{Decoder, Encoder};

use fieldlink_mesh::{MeshStatus, NetMode};
use fieldlink_node::config::{ConnectivitySection, NodeConfig};
use fieldlink_node::node::{Node, NodeHandle};
use fieldlink_node::remote::InMemoryRemote;
use fieldlink_protocol::codec::MeshFrameCodec;
use fieldlink_protocol::frames::{MeshFrame, PeerEntry};
use fieldlink_protocol::GeoPoint;

pub const WAIT: Duration = Duration::from_secs(15);

// ============================================================================
// Connectivity probe control
// ============================================================================

/// A TCP endpoint the node's connectivity monitor probes. While the
/// listener is held, probes succeed; dropping it makes the port refuse
/// connections, which the monitor settles into Offline.
pub struct ProbeControl {
    pub addr: String,
    listener: Option<TcpListener>,
}

#[allow(dead_code)]
impl ProbeControl {
    pub async fn new() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        ProbeControl {
            addr,
            listener: Some(listener),
        }
    }

    pub fn go_offline(&mut self) {
        self.listener = None;
    }

    pub async fn go_online(&mut self) {
        if self.listener.is_none() {
            self.listener = Some(TcpListener::bind(&self.addr).await.unwrap());
        }
    }
}

// ============================================================================
// TestNode
// ============================================================================

pub struct TestNode {
    pub handle: NodeHandle,
    pub remote: InMemoryRemote,
    probe: ProbeControl,
}

#[allow(dead_code)]
impl TestNode {
    /// Flip the probe and wait for the monitor to settle.
    pub async fn go_offline(&mut self) {
        self.probe.go_offline();
        self.wait_net(NetMode::Offline).await;
    }

    pub async fn go_online(&mut self) {
        self.probe.go_online().await;
        self.wait_net(NetMode::Online).await;
    }

    pub async fn wait_net(&self, want: NetMode) {
        let mut rx = self.handle.net_mode.clone();
        tokio::time::timeout(WAIT, async {
            while *rx.borrow() != want {
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap_or_else(|_| panic!("net never settled at {want:?}"));
    }

    pub async fn wait_mesh(&self, want: MeshStatus) {
        let mut rx = self.handle.mesh_status.clone();
        tokio::time::timeout(WAIT, async {
            while *rx.borrow() != want {
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap_or_else(|_| panic!("mesh never reached {want:?}"));
    }

    /// Poll the store until it holds `n` live incidents.
    pub async fn wait_live_incidents(&self, n: usize) {
        tokio::time::timeout(WAIT, async {
            loop {
                if self.handle.store.read().await.live_incidents().len() == n {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("never saw {n} live incidents"));
    }

    /// Poll until the resolvable record for `id` carries a server id.
    pub async fn wait_reconciled(&self, id: &str) -> String {
        tokio::time::timeout(WAIT, async {
            loop {
                {
                    let store = self.handle.store.read().await;
                    if let Some(incident) = store.incident(id) {
                        if incident.id.starts_with("srv-") {
                            return incident.id.clone();
                        }
                    }
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("incident {id} never reconciled"))
    }

    pub async fn message_count(&self) -> usize {
        self.handle.store.read().await.message_count()
    }

    // -- API helpers --

    pub async fn api_post_raw(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> anyhow::Result<(u16, serde_json::Value)> {
        let url = format!("http://{}{}", self.handle.api_addr, path);
        let client = reqwest::Client::new();
        let resp = client
            .post(&url)
            .header("Content-Type", "application/json")
            .header(
                "Authorization",
                format!("Bearer {}", self.handle.bearer_token),
            )
            .json(&body)
            .send()
            .await?;
        let status = resp.status().as_u16();
        let text = resp.text().await?;
        let val: serde_json::Value =
            serde_json::from_str(&text).unwrap_or(serde_json::json!({ "_raw": text }));
        Ok((status, val))
    }

    pub async fn api_post(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> anyhow::Result<serde_json::Value> {
        let (_, val) = self.api_post_raw(path, body).await?;
        Ok(val)
    }

    /// Create an incident via the API, returning its provisional id.
    pub async fn api_create_incident(&self, kind: &str, lat: f64, lng: f64) -> String {
        let resp = self
            .api_post(
                "/api/v1/incidents/create",
                serde_json::json!({ "kind": kind, "lat": lat, "lng": lng }),
            )
            .await
            .unwrap();
        resp["id"].as_str().expect("create returned no id").to_string()
    }

    pub async fn shutdown(self) {
        self.handle.shutdown();
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

pub struct TestNodeBuilder {
    entity_id: String,
    remote: InMemoryRemote,
    relay_addr: String,
    simulate_when_unreachable: bool,
    lat: f64,
    lng: f64,
}

#[allow(dead_code)]
impl TestNodeBuilder {
    pub fn new(entity_id: &str) -> Self {
        TestNodeBuilder {
            entity_id: entity_id.to_string(),
            remote: InMemoryRemote::new(),
            relay_addr: "127.0.0.1:1".to_string(),
            simulate_when_unreachable: false,
            lat: 12.9716,
            lng: 77.5946,
        }
    }

    /// Share a cloud store with other nodes.
    pub fn remote(mut self, remote: InMemoryRemote) -> Self {
        self.remote = remote;
        self
    }

    pub fn relay(mut self, addr: &str) -> Self {
        self.relay_addr = addr.to_string();
        self
    }

    pub fn simulate_when_unreachable(mut self, v: bool) -> Self {
        self.simulate_when_unreachable = v;
        self
    }

    pub fn location(mut self, lat: f64, lng: f64) -> Self {
        self.lat = lat;
        self.lng = lng;
        self
    }

    pub async fn build(self) -> anyhow::Result<TestNode> {
        let probe = ProbeControl::new().await;

        let mut cfg = NodeConfig::default();
        cfg.node.entity_id = self.entity_id.clone();
        cfg.node.api_addr = "127.0.0.1:0".to_string();
        cfg.node.lat = self.lat;
        cfg.node.lng = self.lng;
        cfg.mesh.relay_addr = self.relay_addr;
        cfg.mesh.simulate_when_unreachable = self.simulate_when_unreachable;
        cfg.connectivity = ConnectivitySection {
            guard_secs: 0,
            poll_secs: 1,
            probe_addr: probe.addr.clone(),
        };
        // No outbound HTTP from tests.
        cfg.geocode.enabled = false;

        let bearer_token = format!("test-token-{}", self.entity_id);
        let handle = Node::start(cfg, self.remote.clone(), bearer_token).await?;

        Ok(TestNode {
            handle,
            remote: self.remote,
            probe,
        })
    }
}

// ============================================================================
// TestRelay
// ============================================================================

struct RelayState {
    next_id: usize,
    links: HashMap<usize, mpsc::Sender<MeshFrame>>,
    peers: HashMap<usize, PeerEntry>,
}

/// Minimal in-process relay: tracks handshakes, pushes peer lists, and
/// floods every other frame to all other links.
pub struct TestRelay {
    pub addr: String,
    state: Arc<Mutex<RelayState>>,
}

impl TestRelay {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let state = Arc::new(Mutex::new(RelayState {
            next_id: 0,
            links: HashMap::new(),
            peers: HashMap::new(),
        }));

        let accept_state = state.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let state = accept_state.clone();
                tokio::spawn(handle_link(stream, state));
            }
        });

        TestRelay { addr, state }
    }

    #[allow(dead_code)]
    pub async fn link_count(&self) -> usize {
        self.state.lock().await.links.len()
    }
}

async fn handle_link(stream: TcpStream, state: Arc<Mutex<RelayState>>) {
    let (mut rd, mut wr) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<MeshFrame>(64);

    let link_id = {
        let mut s = state.lock().await;
        let id = s.next_id;
        s.next_id += 1;
        s.links.insert(id, tx);
        id
    };

    tokio::spawn(async move {
        let mut codec = MeshFrameCodec;
        while let Some(frame) = rx.recv().await {
            let mut buf = BytesMut::new();
            if codec.encode(frame, &mut buf).is_err() {
                return;
            }
            if wr.write_all(&buf).await.is_err() {
                return;
            }
        }
    });

    let mut codec = MeshFrameCodec;
    let mut buf = BytesMut::with_capacity(8 * 1024);
    loop {
        match rd.read_buf(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => loop {
                match codec.decode(&mut buf) {
                    Ok(Some(frame)) => route_frame(link_id, frame, &state).await,
                    Ok(None) => break,
                    Err(_) => {
                        drop_link(link_id, &state).await;
                        return;
                    }
                }
            },
        }
    }
    drop_link(link_id, &state).await;
}

async fn route_frame(link_id: usize, frame: MeshFrame, state: &Arc<Mutex<RelayState>>) {
    match frame {
        MeshFrame::Handshake {
            peer_id, location, ..
        } => {
            state.lock().await.peers.insert(
                link_id,
                PeerEntry {
                    id: peer_id,
                    name: None,
                    location: Some(location),
                    distance: None,
                    kind: None,
                },
            );
            broadcast_peer_lists(state).await;
        }
        MeshFrame::Heartbeat => {}
        other => {
            let targets: Vec<mpsc::Sender<MeshFrame>> = {
                let s = state.lock().await;
                s.links
                    .iter()
                    .filter(|(id, _)| **id != link_id)
                    .map(|(_, tx)| tx.clone())
                    .collect()
            };
            for tx in targets {
                let _ = tx.send(other.clone()).await;
            }
        }
    }
}

async fn broadcast_peer_lists(state: &Arc<Mutex<RelayState>>) {
    let snapshot: Vec<(usize, mpsc::Sender<MeshFrame>)> = {
        let s = state.lock().await;
        s.links
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect()
    };
    for (link_id, tx) in snapshot {
        let peers: Vec<PeerEntry> = {
            let s = state.lock().await;
            s.peers
                .iter()
                .filter(|(owner, _)| **owner != link_id)
                .map(|(_, entry)| entry.clone())
                .collect()
        };
        let _ = tx.send(MeshFrame::PeerList { peers }).await;
    }
}

async fn drop_link(link_id: usize, state: &Arc<Mutex<RelayState>>) {
    {
        let mut s = state.lock().await;
        s.links.remove(&link_id);
        s.peers.remove(&link_id);
    }
    broadcast_peer_lists(state).await;
}

/// Origin point used by most tests.
#[allow(dead_code)]
pub fn bengaluru() -> GeoPoint {
    GeoPoint::new(12.9716, 77.5946)
}
