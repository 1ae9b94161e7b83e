//! Tunneling Engine Adapter
//!
//! Thin contract around the external packet-to-SOCKS engine. The engine is
//! an opaque, blocking binding: hand it the interface descriptor and a proxy
//! address, get back a handle; hand the handle back to stop it.
//!
//! The adapter adds no retries. Its only policy is that `stop` must always
//! complete: a missing handle is a no-op and engine errors are logged.

use crate::error::EngineError;
use std::fmt;
use tracing::{debug, error, info};

/// Raw packet-stream descriptor passed to the engine
pub type RawDescriptor = i32;

/// Opaque engine instance.
///
/// Not `Clone`: the only way to release it is to move it into
/// [`TunnelEngine::stop`], so it is released at most once.
#[derive(PartialEq, Eq)]
pub struct TunnelHandle(u64);

impl TunnelHandle {
    /// Wrap the raw value returned by the engine binding
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for TunnelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TunnelHandle({:#x})", self.0)
    }
}

/// The external engine binding. Both calls may block.
pub trait TunnelEngine: Send + Sync {
    fn start(
        &self,
        descriptor: RawDescriptor,
        host: &str,
        port: u16,
    ) -> Result<TunnelHandle, EngineError>;

    fn stop(&self, handle: TunnelHandle) -> Result<(), EngineError>;
}

/// Logging, failure-tolerant wrapper the manager talks to
pub struct EngineAdapter {
    engine: Box<dyn TunnelEngine>,
}

impl EngineAdapter {
    pub fn new(engine: impl TunnelEngine + 'static) -> Self {
        Self {
            engine: Box::new(engine),
        }
    }

    /// Start one engine instance. Single attempt.
    pub fn start(
        &self,
        descriptor: RawDescriptor,
        host: &str,
        port: u16,
    ) -> Result<TunnelHandle, EngineError> {
        debug!("Engine start(fd={}, {}:{})", descriptor, host, port);
        match self.engine.start(descriptor, host, port) {
            Ok(handle) => {
                info!("Engine started, handle={:?}", handle);
                Ok(handle)
            }
            Err(e) => {
                error!("Engine start failed: {}", e);
                Err(e)
            }
        }
    }

    /// Stop an engine instance if there is one. Never fails.
    pub fn stop(&self, handle: Option<TunnelHandle>) {
        let Some(handle) = handle else {
            debug!("Engine stop: no handle, nothing to do");
            return;
        };

        debug!("Engine stop {:?}", handle);
        match self.engine.stop(handle) {
            Ok(()) => debug!("Engine stopped"),
            Err(e) => error!("Engine stop failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeEngine;
    use std::time::Duration;

    #[test]
    fn test_stop_without_handle_is_noop() {
        let engine = FakeEngine::new(Duration::ZERO);
        let adapter = EngineAdapter::new(engine.clone());

        adapter.stop(None);
        assert!(engine.stopped().is_empty());
    }

    #[test]
    fn test_start_then_stop() {
        let engine = FakeEngine::new(Duration::ZERO);
        let adapter = EngineAdapter::new(engine.clone());

        let handle = adapter.start(7, "127.0.0.1", 8281).unwrap();
        let raw = handle.as_raw();
        adapter.stop(Some(handle));

        assert_eq!(engine.started(), vec![raw]);
        assert_eq!(engine.stopped(), vec![raw]);
        assert_eq!(engine.last_descriptor(), Some(7));
    }

    #[test]
    fn test_start_failure_propagates() {
        let engine = FakeEngine::failing("boom");
        let adapter = EngineAdapter::new(engine.clone());

        let err = adapter.start(3, "127.0.0.1", 8281).unwrap_err();
        assert_eq!(err, EngineError::StartFailed("boom".into()));
    }

    #[test]
    fn test_stop_failure_is_swallowed() {
        let engine = FakeEngine::new(Duration::ZERO).with_stop_failure();
        let adapter = EngineAdapter::new(engine.clone());

        let handle = adapter.start(3, "127.0.0.1", 8281).unwrap();
        adapter.stop(Some(handle));

        assert_eq!(engine.stopped().len(), 1);
    }
}
