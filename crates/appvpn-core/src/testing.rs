//! Test doubles for the platform, engine, prober and counters.

use crate::engine::{RawDescriptor, TunnelEngine, TunnelHandle};
use crate::error::{EngineError, InterfaceError};
use crate::interface::{InterfaceBackend, InterfaceSpec, VirtualInterface};
use crate::metrics::{ByteTotals, TrafficCounters};
use crate::probe::Probe;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[derive(Default)]
struct EngineLog {
    started: Vec<u64>,
    stopped: Vec<u64>,
    last_descriptor: Option<RawDescriptor>,
}

/// Engine that succeeds after a delay, or always fails
#[derive(Clone)]
pub struct FakeEngine {
    delay: Duration,
    start_failure: Option<String>,
    stop_fails: bool,
    next_id: Arc<AtomicU64>,
    log: Arc<Mutex<EngineLog>>,
}

impl FakeEngine {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            start_failure: None,
            stop_fails: false,
            next_id: Arc::new(AtomicU64::new(0xA0)),
            log: Arc::new(Mutex::new(EngineLog::default())),
        }
    }

    pub fn failing(message: &str) -> Self {
        let mut engine = Self::new(Duration::ZERO);
        engine.start_failure = Some(message.to_string());
        engine
    }

    pub fn with_stop_failure(mut self) -> Self {
        self.stop_fails = true;
        self
    }

    pub fn started(&self) -> Vec<u64> {
        self.log.lock().unwrap().started.clone()
    }

    pub fn stopped(&self) -> Vec<u64> {
        self.log.lock().unwrap().stopped.clone()
    }

    pub fn last_descriptor(&self) -> Option<RawDescriptor> {
        self.log.lock().unwrap().last_descriptor
    }
}

impl TunnelEngine for FakeEngine {
    fn start(
        &self,
        descriptor: RawDescriptor,
        _host: &str,
        _port: u16,
    ) -> Result<TunnelHandle, EngineError> {
        thread::sleep(self.delay);
        self.log.lock().unwrap().last_descriptor = Some(descriptor);
        if let Some(message) = &self.start_failure {
            return Err(EngineError::StartFailed(message.clone()));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.log.lock().unwrap().started.push(id);
        Ok(TunnelHandle::from_raw(id))
    }

    fn stop(&self, handle: TunnelHandle) -> Result<(), EngineError> {
        self.log.lock().unwrap().stopped.push(handle.as_raw());
        if self.stop_fails {
            return Err(EngineError::StopFailed("stop refused".into()));
        }
        Ok(())
    }
}

struct BackendState {
    consent: bool,
    missing_apps: HashSet<String>,
    deny: Option<String>,
    consent_checks: usize,
    last_spec: Option<InterfaceSpec>,
    next_fd: RawDescriptor,
}

/// Platform backend recording what it was asked to build
pub struct FakeBackend {
    state: Mutex<BackendState>,
    closed: Arc<AtomicUsize>,
    close_fails: Arc<AtomicBool>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BackendState {
                consent: true,
                missing_apps: HashSet::new(),
                deny: None,
                consent_checks: 0,
                last_spec: None,
                next_fd: 100,
            }),
            closed: Arc::new(AtomicUsize::new(0)),
            close_fails: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn without_app(self: Arc<Self>, app_id: &str) -> Arc<Self> {
        self.state.lock().unwrap().missing_apps.insert(app_id.to_string());
        self
    }

    pub fn denying(self: Arc<Self>, reason: &str) -> Arc<Self> {
        self.state.lock().unwrap().deny = Some(reason.to_string());
        self
    }

    /// Interfaces record the close but report failure
    pub fn with_close_failure(self: Arc<Self>) -> Arc<Self> {
        self.close_fails.store(true, Ordering::SeqCst);
        self
    }

    pub fn set_consent(&self, granted: bool) {
        self.state.lock().unwrap().consent = granted;
    }

    pub fn consent_checks(&self) -> usize {
        self.state.lock().unwrap().consent_checks
    }

    pub fn last_spec(&self) -> Option<InterfaceSpec> {
        self.state.lock().unwrap().last_spec.clone()
    }

    pub fn closed_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

impl InterfaceBackend for FakeBackend {
    fn consent_granted(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        state.consent_checks += 1;
        state.consent
    }

    fn resolve_app(&self, app_id: &str) -> Result<(), InterfaceError> {
        if self.state.lock().unwrap().missing_apps.contains(app_id) {
            return Err(InterfaceError::AppNotFound(app_id.to_string()));
        }
        Ok(())
    }

    fn establish(&self, spec: &InterfaceSpec) -> Result<Box<dyn VirtualInterface>, InterfaceError> {
        let mut state = self.state.lock().unwrap();
        if let Some(reason) = &state.deny {
            return Err(InterfaceError::Denied(reason.clone()));
        }
        state.last_spec = Some(spec.clone());
        state.next_fd += 1;
        Ok(Box::new(FakeInterface {
            fd: state.next_fd,
            closed: self.closed.clone(),
            close_fails: self.close_fails.clone(),
        }))
    }
}

struct FakeInterface {
    fd: RawDescriptor,
    closed: Arc<AtomicUsize>,
    close_fails: Arc<AtomicBool>,
}

impl VirtualInterface for FakeInterface {
    fn descriptor(&self) -> RawDescriptor {
        self.fd
    }

    fn close(&mut self) -> Result<(), InterfaceError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        if self.close_fails.load(Ordering::SeqCst) {
            return Err(InterfaceError::Close("descriptor already invalid".into()));
        }
        Ok(())
    }
}

/// Prober with a fixed answer after a fixed delay
pub struct FakeProber {
    reachable: bool,
    delay: Duration,
    calls: AtomicUsize,
}

impl FakeProber {
    pub fn reachable(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            reachable: true,
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn unreachable(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            reachable: false,
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Probe for FakeProber {
    async fn probe(&self, _host: &str, _port: u16, _budget: Duration) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.reachable
    }
}

/// Counters replaying a script, repeating the last reading once exhausted
pub struct ScriptedCounters {
    script: Vec<ByteTotals>,
    reads: AtomicUsize,
}

impl ScriptedCounters {
    pub fn new(script: &[(u64, u64)]) -> Arc<Self> {
        Arc::new(Self {
            script: script.iter().map(|&(rx, tx)| ByteTotals::new(rx, tx)).collect(),
            reads: AtomicUsize::new(0),
        })
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl TrafficCounters for ScriptedCounters {
    fn totals(&self) -> ByteTotals {
        let n = self.reads.fetch_add(1, Ordering::SeqCst);
        let last = self.script.len().saturating_sub(1);
        self.script.get(n.min(last)).copied().unwrap_or_default()
    }
}
