//! Virtual Interface Provisioning
//!
//! Describes the per-app interface (addresses, routes, allow-list) and asks
//! the platform backend to establish it.
//!
//! # Scoping
//!
//! - Allow-list holds exactly the target application. If the target cannot
//!   be resolved provisioning fails: an empty allow-list would route every
//!   app through the tunnel.
//! - The owning process is disallowed so it keeps a direct path to the
//!   proxy. This one is best-effort.
//! - Default routes for IPv4 and IPv6 are attached.

use crate::config::TunnelConfig;
use crate::engine::RawDescriptor;
use crate::error::InterfaceError;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

const SESSION_NAME: &str = "Per-app VPN";
const DEFAULT_MTU: u16 = 1500;

/// Everything the platform needs to build the interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceSpec {
    pub session: String,
    pub mtu: u16,
    /// Interface addresses (address, prefix length)
    pub addresses: Vec<(IpAddr, u8)>,
    pub dns_servers: Vec<IpAddr>,
    /// Routes captured by the interface (network, prefix length)
    pub routes: Vec<(IpAddr, u8)>,
    pub allowed_apps: Vec<String>,
    pub disallowed_apps: Vec<String>,
}

impl InterfaceSpec {
    /// Interface capturing all traffic of one application
    pub fn for_app(target_app: &str) -> Self {
        Self {
            session: SESSION_NAME.to_string(),
            mtu: DEFAULT_MTU,
            addresses: vec![
                (IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 32),
                (IpAddr::V6(Ipv6Addr::new(0xfd00, 1, 0xfd00, 0, 0, 0, 0, 1)), 128),
            ],
            dns_servers: vec![IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1))],
            routes: vec![
                (IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
                (IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
            ],
            allowed_apps: vec![target_app.to_string()],
            disallowed_apps: Vec::new(),
        }
    }
}

/// A live interface as returned by the platform
pub trait VirtualInterface: Send {
    /// Raw packet-stream descriptor handed to the engine
    fn descriptor(&self) -> RawDescriptor;

    fn close(&mut self) -> Result<(), InterfaceError>;
}

/// Platform side of provisioning
pub trait InterfaceBackend: Send + Sync {
    /// User consent to create a VPN interface. Asked on every attempt.
    fn consent_granted(&self) -> bool;

    /// Check that an application identifier exists on the device
    fn resolve_app(&self, app_id: &str) -> Result<(), InterfaceError>;

    fn establish(&self, spec: &InterfaceSpec) -> Result<Box<dyn VirtualInterface>, InterfaceError>;
}

/// Owned interface, closed exactly once (explicitly or on drop)
pub struct InterfaceHandle {
    inner: Box<dyn VirtualInterface>,
    closed: bool,
}

impl InterfaceHandle {
    pub fn new(inner: Box<dyn VirtualInterface>) -> Self {
        Self {
            inner,
            closed: false,
        }
    }

    pub fn descriptor(&self) -> RawDescriptor {
        self.inner.descriptor()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Close the interface; later calls are no-ops
    pub fn close(&mut self) -> Result<(), InterfaceError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        debug!("Closing interface fd={}", self.inner.descriptor());
        self.inner.close()
    }
}

impl Drop for InterfaceHandle {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Interface close on drop failed: {}", e);
        }
    }
}

/// Builds the per-app interface through a platform backend
pub struct InterfaceProvisioner {
    backend: Arc<dyn InterfaceBackend>,
    self_app_id: String,
    provisioned: AtomicU64,
}

impl InterfaceProvisioner {
    pub fn new(backend: Arc<dyn InterfaceBackend>, self_app_id: impl Into<String>) -> Self {
        Self {
            backend,
            self_app_id: self_app_id.into(),
            provisioned: AtomicU64::new(0),
        }
    }

    /// Number of provisioning attempts made so far
    pub fn provision_count(&self) -> u64 {
        self.provisioned.load(Ordering::Relaxed)
    }

    /// Provision the interface for one start request
    pub fn provision(&self, config: &TunnelConfig) -> Result<InterfaceHandle, InterfaceError> {
        self.provisioned.fetch_add(1, Ordering::Relaxed);

        if !self.backend.consent_granted() {
            warn!("VPN consent not granted; cannot create interface");
            return Err(InterfaceError::ConsentRequired);
        }

        let target = config.target_app();
        if let Err(e) = self.backend.resolve_app(target) {
            warn!("Target application cannot be added: {} ({})", target, e);
            return Err(InterfaceError::AppNotFound(target.to_string()));
        }

        let mut spec = InterfaceSpec::for_app(target);
        match self.backend.resolve_app(&self.self_app_id) {
            Ok(()) => spec.disallowed_apps.push(self.self_app_id.clone()),
            Err(e) => debug!("Not excluding own app {}: {}", self.self_app_id, e),
        }

        let inner = self.backend.establish(&spec)?;
        let handle = InterfaceHandle::new(inner);
        info!("Interface established for {}, fd={}", target, handle.descriptor());
        Ok(handle)
    }
}
