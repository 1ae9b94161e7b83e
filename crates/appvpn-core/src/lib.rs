//! appvpn - Per-Application SOCKS Tunnel Lifecycle
//!
//! Runs a single per-app VPN tunnel: a virtual interface restricted to one
//! target application whose packet stream is handed to an external
//! tunneling engine that relays it through a remote SOCKS proxy.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     TunnelManager                             │
//! │                                                               │
//! │  start ──▶ Provisioner ──▶ Prober (preflight) ──▶ Engine      │
//! │               │                                    │          │
//! │               │          Watchdog (10s) ───────────┤          │
//! │               ▼                                    ▼          │
//! │         InterfaceHandle                      TunnelHandle     │
//! │                                                    │          │
//! │                              MetricsSampler ◀──────┘          │
//! │                                   │                           │
//! └───────────────────────────────────│───────────────────────────┘
//!                                     ▼
//!                             EventBroadcaster ──▶ observers
//! ```
//!
//! # Guarantees
//!
//! - **One tunnel**: at most one interface/engine pair per manager
//! - **Bounded startup**: the watchdog forces an error after its deadline
//! - **No leaks**: every exit path releases the engine handle and interface
//! - **Never blocks observers**: events are fire-and-forget

mod config;
mod engine;
mod error;
mod events;
mod interface;
mod manager;
mod metrics;
mod probe;
mod watchdog;

#[cfg(test)]
mod testing;

pub use config::{DEFAULT_PROXY_PORT, ManagerConfig, TunnelConfig, TunnelTimings};
pub use engine::{EngineAdapter, RawDescriptor, TunnelEngine, TunnelHandle};
pub use error::{ConfigError, EngineError, InterfaceError, StartError, TunnelFailure};
pub use events::{EventBroadcaster, MetricsSample, StateEvent, TunnelEvent, TunnelState};
pub use interface::{
    InterfaceBackend, InterfaceHandle, InterfaceProvisioner, InterfaceSpec, VirtualInterface,
};
pub use manager::TunnelManager;
pub use metrics::{
    ByteTotals, HostTrafficCounters, MetricsSampler, SamplerConfig, Throughput, ThroughputMeter,
    TrafficCounters,
};
pub use probe::{Probe, TcpProber};
pub use watchdog::Watchdog;
