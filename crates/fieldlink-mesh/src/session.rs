//! Relay session state machine.
//!
//! The mesh is the lifeline path: it is brought up when the internet drops
//! and torn down when it returns. Reconnects are scheduled only while
//! offline, and a pending reconnect is abandoned if connectivity comes back
//! before the backoff fires.

use crate::{MeshStatus, NetMode};

/// What the I/O task must do after an edge event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    /// Open a connection to the relay and send the handshake.
    Dial,
    /// Arm the fixed reconnect backoff.
    ScheduleReconnect,
    /// Close the link (or drop the simulated roster) and stop heartbeats.
    TearDown,
    /// Populate the roster with synthesized peers.
    StartSimulated,
}

/// Pure session lifecycle. The caller owns sockets and timers and feeds
/// edges in; state changes come back as explicit actions.
pub struct MeshSession {
    status: MeshStatus,
    net: NetMode,
    /// Fall back to a synthesized roster when the relay cannot be reached.
    simulate_on_failure: bool,
}

impl MeshSession {
    pub fn new(net: NetMode, simulate_on_failure: bool) -> Self {
        MeshSession {
            status: MeshStatus::Disconnected,
            net,
            simulate_on_failure,
        }
    }

    pub fn status(&self) -> MeshStatus {
        self.status
    }

    pub fn net(&self) -> NetMode {
        self.net
    }

    /// Outbound broadcasts are only valid on a live link. In simulated mode
    /// they are logged and dropped by the caller.
    pub fn can_broadcast(&self) -> bool {
        self.status.is_live()
    }

    /// Connectivity monitor reported a settled transition.
    pub fn on_net_change(&mut self, net: NetMode) -> Vec<SessionAction> {
        if net == self.net {
            return Vec::new();
        }
        self.net = net;
        match net {
            NetMode::Offline => {
                if self.status == MeshStatus::Disconnected {
                    self.status = MeshStatus::Connecting;
                    vec![SessionAction::Dial]
                } else {
                    Vec::new()
                }
            }
            NetMode::Online => {
                // Cloud path is back; the lifeline stands down.
                if self.status.is_active() || self.status == MeshStatus::Connecting {
                    self.status = MeshStatus::Disconnected;
                    vec![SessionAction::TearDown]
                } else {
                    Vec::new()
                }
            }
        }
    }

    pub fn on_dial_ok(&mut self) -> Vec<SessionAction> {
        if self.status == MeshStatus::Connecting {
            self.status = MeshStatus::Connected;
        }
        Vec::new()
    }

    pub fn on_dial_failed(&mut self) -> Vec<SessionAction> {
        if self.status != MeshStatus::Connecting {
            return Vec::new();
        }
        if self.simulate_on_failure {
            self.status = MeshStatus::Simulated;
            vec![SessionAction::StartSimulated]
        } else {
            self.status = MeshStatus::Disconnected;
            vec![SessionAction::ScheduleReconnect]
        }
    }

    /// Established link dropped.
    pub fn on_link_lost(&mut self) -> Vec<SessionAction> {
        if self.status != MeshStatus::Connected {
            return Vec::new();
        }
        self.status = MeshStatus::Disconnected;
        match self.net {
            NetMode::Offline => vec![SessionAction::ScheduleReconnect],
            NetMode::Online => Vec::new(),
        }
    }

    /// The reconnect backoff fired. A reconnect armed while offline is
    /// abandoned if connectivity returned in the meantime.
    pub fn on_reconnect_due(&mut self) -> Vec<SessionAction> {
        if self.net == NetMode::Offline && self.status == MeshStatus::Disconnected {
            self.status = MeshStatus::Connecting;
            vec![SessionAction::Dial]
        } else {
            tracing::debug!(
                status = self.status.name(),
                "reconnect abandoned, link no longer wanted"
            );
            Vec::new()
        }
    }
}
