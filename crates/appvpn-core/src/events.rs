//! Event Broadcasting
//!
//! State changes and metrics samples fan out to any number of observers
//! over a broadcast channel. Publishing never waits: a receiver that falls
//! behind loses the oldest events, and having no receivers at all is fine.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;
use tracing::debug;

/// Capacity of the event broadcast
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Tunnel lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TunnelState {
    /// No tunnel, nothing held
    Inactive,
    /// Start sequence in flight
    Connecting,
    /// Engine running, metrics flowing
    Connected,
    /// Last attempt failed; resources already released
    Error,
}

impl TunnelState {
    /// Check if tunnel is usable
    pub fn is_connected(&self) -> bool {
        matches!(self, TunnelState::Connected)
    }

    /// Check if a tunnel is starting or running
    pub fn is_running(&self) -> bool {
        matches!(self, TunnelState::Connecting | TunnelState::Connected)
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Inactive => "INACTIVE",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// A state transition, with an optional human-readable reason
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateEvent {
    pub state: TunnelState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// One throughput/health reading, taken while connected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSample {
    pub rx_bytes_per_sec: u64,
    pub tx_bytes_per_sec: u64,
    pub rx_total_bytes: u64,
    pub tx_total_bytes: u64,
    pub proxy_online: bool,
    /// Unix time in milliseconds when the tick was taken
    pub timestamp_ms: u64,
}

/// Everything observers can receive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TunnelEvent {
    State(StateEvent),
    Metrics(MetricsSample),
}

/// Fire-and-forget publisher shared by the manager and the sampler
#[derive(Debug, Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<TunnelEvent>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Subscribe to all events published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.tx.subscribe()
    }

    pub fn publish_state(&self, state: TunnelState, message: Option<String>) {
        debug!("State event: {} ({:?})", state, message);
        self.publish(TunnelEvent::State(StateEvent { state, message }));
    }

    pub fn publish_metrics(&self, sample: MetricsSample) {
        self.publish(TunnelEvent::Metrics(sample));
    }

    fn publish(&self, event: TunnelEvent) {
        // No receivers is fine
        let _ = self.tx.send(event);
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}
