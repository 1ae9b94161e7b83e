//! Error taxonomy for the tunnel lifecycle.
//!
//! Only [`StartError`] ever reaches the caller of a command; everything
//! else is folded into a [`TunnelFailure`] and surfaces as an `ERROR` state
//! event with its message.

use crate::events::TunnelState;
use std::time::Duration;

/// Invalid start request, caught before any resource is acquired
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("No target application")]
    MissingTarget,

    #[error("No proxy host")]
    MissingHost,

    #[error("Invalid proxy port: {0}")]
    InvalidPort(i32),
}

/// Virtual interface could not be provisioned
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InterfaceError {
    #[error("VPN consent not granted")]
    ConsentRequired,

    #[error("Application not found: {0}")]
    AppNotFound(String),

    #[error("Interface denied by platform: {0}")]
    Denied(String),

    #[error("Failed to close interface: {0}")]
    Close(String),
}

/// Failure reported by the external tunneling engine
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("Engine failed to start: {0}")]
    StartFailed(String),

    #[error("Engine failed to stop: {0}")]
    StopFailed(String),

    #[error("Engine call panicked: {0}")]
    Panicked(String),
}

/// Rejection returned directly from a start command
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StartError {
    #[error("Tunnel already running ({0:?})")]
    AlreadyRunning(TunnelState),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Why a start attempt (or a running tunnel) ended in `ERROR`
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TunnelFailure {
    #[error("{0}")]
    Interface(#[from] InterfaceError),

    #[error("Proxy {host}:{port} unreachable")]
    Unreachable { host: String, port: u16 },

    #[error("{0}")]
    Engine(#[from] EngineError),

    #[error("Startup timeout after {}s", .0.as_secs_f32())]
    Timeout(Duration),

    #[error("Engine failure: {0}")]
    EngineReported(String),
}
