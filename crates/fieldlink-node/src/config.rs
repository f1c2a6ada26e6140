//! Configuration types for fieldlink-node.
//! Parsed from ~/.fieldlink/config.toml.

use fieldlink_protocol::CURRENT_PARAMS;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub mesh: MeshSection,
    #[serde(default)]
    pub connectivity: ConnectivitySection,
    #[serde(default)]
    pub geocode: GeocodeSection,
    #[serde(default)]
    pub notify: NotifySection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    #[serde(default = "default_entity_id")]
    pub entity_id: String,
    #[serde(default = "default_api_addr")]
    pub api_addr: String,
    /// Last known device position; used until a live fix arrives.
    #[serde(default = "default_lat")]
    pub lat: f64,
    #[serde(default = "default_lng")]
    pub lng: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshSection {
    #[serde(default = "default_relay_addr")]
    pub relay_addr: String,
    /// Fall back to a synthesized roster when the relay is unreachable.
    #[serde(default = "default_true")]
    pub simulate_when_unreachable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectivitySection {
    /// A raw transition must hold this long before it propagates.
    #[serde(default = "default_guard_secs")]
    pub guard_secs: u64,
    #[serde(default = "default_poll_secs")]
    pub poll_secs: u64,
    /// TCP endpoint probed to decide online/offline.
    #[serde(default = "default_probe_addr")]
    pub probe_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeocodeSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_geocode_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifySection {
    /// Incidents inside this radius raise a local notification.
    #[serde(default = "default_nearby_radius_km")]
    pub nearby_radius_km: f64,
    /// Retained notification history.
    #[serde(default = "default_history")]
    pub history: usize,
}

// Default value functions
fn default_entity_id() -> String {
    "responder".into()
}
fn default_api_addr() -> String {
    "127.0.0.1:9610".into()
}
fn default_lat() -> f64 {
    12.9716
}
fn default_lng() -> f64 {
    77.5946
}
fn default_relay_addr() -> String {
    "127.0.0.1:9001".into()
}
fn default_true() -> bool {
    true
}
fn default_guard_secs() -> u64 {
    CURRENT_PARAMS.connectivity_guard_secs
}
fn default_poll_secs() -> u64 {
    CURRENT_PARAMS.connectivity_poll_secs
}
fn default_probe_addr() -> String {
    "1.1.1.1:53".into()
}
fn default_geocode_endpoint() -> String {
    "https://nominatim.openstreetmap.org/reverse".into()
}
fn default_user_agent() -> String {
    "fieldlink-node/0.1".into()
}
fn default_nearby_radius_km() -> f64 {
    5.0
}
fn default_history() -> usize {
    100
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            entity_id: default_entity_id(),
            api_addr: default_api_addr(),
            lat: default_lat(),
            lng: default_lng(),
        }
    }
}

impl Default for MeshSection {
    fn default() -> Self {
        Self {
            relay_addr: default_relay_addr(),
            simulate_when_unreachable: true,
        }
    }
}

impl Default for ConnectivitySection {
    fn default() -> Self {
        Self {
            guard_secs: default_guard_secs(),
            poll_secs: default_poll_secs(),
            probe_addr: default_probe_addr(),
        }
    }
}

impl Default for GeocodeSection {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: default_geocode_endpoint(),
            user_agent: default_user_agent(),
        }
    }
}

impl Default for NotifySection {
    fn default() -> Self {
        Self {
            nearby_radius_km: default_nearby_radius_km(),
            history: default_history(),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node: NodeSection::default(),
            mesh: MeshSection::default(),
            connectivity: ConnectivitySection::default(),
            geocode: GeocodeSection::default(),
            notify: NotifySection::default(),
        }
    }
}

impl NodeConfig {
    /// Load config from file, or create default if missing.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: NodeConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.node.api_addr, "127.0.0.1:9610");
        assert_eq!(cfg.mesh.relay_addr, "127.0.0.1:9001");
        assert!(cfg.mesh.simulate_when_unreachable);
        assert_eq!(cfg.connectivity.poll_secs, 5);
        assert_eq!(cfg.notify.nearby_radius_km, 5.0);
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
[node]
entity_id = "ward-7-volunteer"
api_addr = "127.0.0.1:9611"
lat = 13.0827
lng = 80.2707

[mesh]
relay_addr = "192.168.49.1:9001"
simulate_when_unreachable = false

[connectivity]
probe_addr = "8.8.8.8:53"

[geocode]
enabled = false
"#;

        let cfg: NodeConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.node.entity_id, "ward-7-volunteer");
        assert_eq!(cfg.mesh.relay_addr, "192.168.49.1:9001");
        assert!(!cfg.mesh.simulate_when_unreachable);
        assert_eq!(cfg.connectivity.probe_addr, "8.8.8.8:53");
        assert!(!cfg.geocode.enabled);
        // Unspecified sections keep their defaults.
        assert_eq!(cfg.connectivity.guard_secs, 2);
        assert_eq!(cfg.notify.history, 100);
    }

    #[test]
    fn test_serialise_default() {
        let cfg = NodeConfig::default();
        let toml_str = toml::to_string_pretty(&cfg).unwrap();
        assert!(toml_str.contains("[node]"));
        assert!(toml_str.contains("relay_addr"));
    }
}
