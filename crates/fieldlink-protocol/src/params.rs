//! Protocol parameter sets -- the timing and sizing constants every task
//! shares. Versioned as a single struct so a future relay-negotiated upgrade
//! can swap the whole set at once instead of chasing scattered constants.

use std::time::Duration;

/// A named, versioned set of timing and sizing parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncParams {
    /// Parameter set identifier. Monotonically increasing.
    pub version: u16,

    // -- Mesh session --
    /// Seconds between heartbeat frames while connected.
    pub heartbeat_interval_secs: u64,
    /// Fixed delay before a reconnect attempt after link loss.
    pub reconnect_backoff_secs: u64,
    /// Relay dial timeout in seconds.
    pub dial_timeout_secs: u64,
    /// Number of synthesized peers in simulated-peer mode.
    pub simulated_peer_count: usize,

    // -- Connectivity monitor --
    /// A raw transition must hold this long before it propagates.
    pub connectivity_guard_secs: u64,
    /// Polling fallback interval (upper bound per spec: 5s).
    pub connectivity_poll_secs: u64,

    // -- Merge engine --
    /// Coarse timestamp bucket width for chat deduplication.
    pub chat_dedup_window_secs: i64,
    /// Creation-timestamp tolerance when matching a provisional incident
    /// to its server-issued counterpart.
    pub reconcile_tolerance_secs: i64,
    /// Bounded capacity of the dual-ingress merge channel.
    pub ingest_channel_capacity: usize,

    // -- Transport --
    /// Maximum mesh frame size in bytes (wire limit).
    pub max_frame_bytes: usize,
}

/// Version 1: parameters matching the deployed relay network.
pub const PARAMS_V1: SyncParams = SyncParams {
    version: 1,

    // Mesh session
    heartbeat_interval_secs: 30,
    reconnect_backoff_secs: 5,
    dial_timeout_secs: 3,
    simulated_peer_count: 3,

    // Connectivity monitor
    connectivity_guard_secs: 2,
    connectivity_poll_secs: 5,

    // Merge engine
    chat_dedup_window_secs: 2,
    reconcile_tolerance_secs: 10,
    ingest_channel_capacity: 256,

    // Transport: alerts and rosters only, media travels as path references
    max_frame_bytes: 64 * 1024,
};

/// The active parameter set.
pub const CURRENT_PARAMS: &SyncParams = &PARAMS_V1;

/// Fixed ETA per emergency service dial code. Unknown codes fall back to the
/// ambulance duration (the slowest service, so the timer never underestimates).
pub fn service_eta(code: &str) -> Duration {
    let secs = match code {
        "108" => 5 * 60, // Ambulance
        "100" => 3 * 60, // Police
        "101" => 4 * 60, // Fire Service
        "112" => 4 * 60, // Unified emergency
        _ => 5 * 60,
    };
    Duration::from_secs(secs)
}

/// Human-readable service name for a dial code.
pub fn service_name(code: &str) -> &'static str {
    match code {
        "108" => "Ambulance",
        "100" => "Police",
        "101" => "Fire Service",
        "112" => "Emergency Services",
        _ => "Emergency Services",
    }
}
