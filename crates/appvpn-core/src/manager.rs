//! Tunnel Lifecycle Manager
//!
//! Sequences interface provisioning, reachability preflight, engine startup,
//! watchdog supervision and metrics sampling into one state machine.
//!
//! # Usage
//!
//! ```rust,ignore
//! let manager = TunnelManager::new(config, backend, engine, prober, counters);
//! let mut events = manager.subscribe();
//!
//! manager.start_with("proxy.example", 8281, "com.target.app").await?;
//! while let Ok(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//!
//! manager.stop().await;
//! ```
//!
//! # Serialization
//!
//! Every transition happens under the session lock, and its state event is
//! published before the lock is released, so observers see transitions in
//! order. Background work (startup worker, watchdog) carries the attempt
//! number it belongs to and applies its result only if that attempt is still
//! the current one and still in the state it expects. That check, made
//! under the lock, is also the single-assignment guard on the engine handle:
//! whichever of {watchdog, engine success} gets there first wins.

use crate::config::{ManagerConfig, TunnelConfig, TunnelTimings};
use crate::engine::{EngineAdapter, RawDescriptor, TunnelEngine, TunnelHandle};
use crate::error::{EngineError, StartError, TunnelFailure};
use crate::events::{EventBroadcaster, TunnelEvent, TunnelState};
use crate::interface::{InterfaceBackend, InterfaceHandle, InterfaceProvisioner};
use crate::metrics::{MetricsSampler, SamplerConfig, TrafficCounters};
use crate::probe::Probe;
use crate::watchdog::Watchdog;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, error, info, warn};

/// Handles owned by the current session. Released on drop if teardown
/// never ran (process shutdown without `stop`).
struct Resources {
    engine: Arc<EngineAdapter>,
    interface: Option<InterfaceHandle>,
    tunnel: Option<TunnelHandle>,
}

impl Drop for Resources {
    fn drop(&mut self) {
        if self.tunnel.is_some() {
            warn!("Releasing engine handle on shutdown");
            self.engine.stop(self.tunnel.take());
        }
        if let Some(mut interface) = self.interface.take() {
            if let Err(e) = interface.close() {
                warn!("Interface close on shutdown failed: {}", e);
            }
        }
    }
}

/// The one current tunnel. Field order is drop order.
struct Session {
    sampler: Option<MetricsSampler>,
    resources: Resources,
    watchdog: Option<Watchdog>,
    state: TunnelState,
    attempt: u64,
    config: Option<TunnelConfig>,
}

struct Shared {
    session: Mutex<Session>,
    events: EventBroadcaster,
    provisioner: InterfaceProvisioner,
    prober: Arc<dyn Probe>,
    engine: Arc<EngineAdapter>,
    counters: Arc<dyn TrafficCounters>,
    timings: TunnelTimings,
}

/// Entry point: start/stop commands in, state and metrics events out
pub struct TunnelManager {
    shared: Arc<Shared>,
}

impl TunnelManager {
    /// Create a manager in the `Inactive` state
    pub fn new(
        config: ManagerConfig,
        backend: Arc<dyn InterfaceBackend>,
        engine: impl TunnelEngine + 'static,
        prober: Arc<dyn Probe>,
        counters: Arc<dyn TrafficCounters>,
    ) -> Self {
        let engine = Arc::new(EngineAdapter::new(engine));
        let session = Session {
            sampler: None,
            resources: Resources {
                engine: engine.clone(),
                interface: None,
                tunnel: None,
            },
            watchdog: None,
            state: TunnelState::Inactive,
            attempt: 0,
            config: None,
        };

        Self {
            shared: Arc::new(Shared {
                session: Mutex::new(session),
                events: EventBroadcaster::new(),
                provisioner: InterfaceProvisioner::new(backend, config.self_app_id),
                prober,
                engine,
                counters,
                timings: config.timings,
            }),
        }
    }

    /// Subscribe to state and metrics events
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.shared.events.subscribe()
    }

    /// Current state snapshot
    pub async fn state(&self) -> TunnelState {
        self.shared.session.lock().await.state
    }

    /// Number of interface provisioning attempts so far
    pub fn provision_count(&self) -> u64 {
        self.shared.provisioner.provision_count()
    }

    /// Start from raw command arguments.
    ///
    /// Invalid arguments are rejected before any transition or resource.
    pub async fn start_with(
        &self,
        proxy_host: &str,
        proxy_port: i32,
        target_app: &str,
    ) -> Result<(), StartError> {
        let config = TunnelConfig::new(proxy_host, proxy_port, target_app).map_err(|e| {
            warn!("Start rejected: {}", e);
            e
        })?;
        self.start(config).await
    }

    /// Start a tunnel.
    ///
    /// Returns once the manager is `Connecting` (or has already failed
    /// provisioning); the outcome arrives as a state event.
    pub async fn start(&self, config: TunnelConfig) -> Result<(), StartError> {
        self.shared.start(config).await
    }

    /// Tear everything down and go `Inactive`. Never fails; repeated calls
    /// are silent no-ops.
    pub async fn stop(&self) {
        let shared = self.shared.clone();
        // Teardown runs to completion even if the caller stops polling
        if let Err(e) = tokio::spawn(async move { shared.stop().await }).await {
            error!("Stop task failed: {}", e);
        }
    }

    /// Engine reported an internal failure while connected
    pub async fn report_engine_failure(&self, reason: impl Into<String>) {
        let shared = self.shared.clone();
        let reason = reason.into();
        if let Err(e) = tokio::spawn(async move { shared.on_engine_failure(reason).await }).await {
            error!("Engine failure task failed: {}", e);
        }
    }
}

impl Shared {
    async fn start(self: &Arc<Self>, config: TunnelConfig) -> Result<(), StartError> {
        let mut session = self.session.lock().await;

        if session.state.is_running() {
            info!("Tunnel already running, ignoring duplicate start");
            self.events
                .publish_state(session.state, Some("Already running".to_string()));
            return Err(StartError::AlreadyRunning(session.state));
        }

        session.attempt += 1;
        let attempt = session.attempt;
        session.config = Some(config.clone());
        session.state = TunnelState::Connecting;
        info!("Connecting {} (attempt {})", config, attempt);
        self.events
            .publish_state(TunnelState::Connecting, Some(format!("Connecting {config}")));

        let deadline = self.timings.watchdog();
        let weak = Arc::downgrade(self);
        session.watchdog = Some(Watchdog::arm(deadline, move || async move {
            if let Some(shared) = weak.upgrade() {
                shared.on_watchdog(attempt, deadline).await;
            }
        }));

        match self.provisioner.provision(&config) {
            Ok(interface) => {
                let descriptor = interface.descriptor();
                session.resources.interface = Some(interface);
                tokio::spawn(self.clone().run_startup(attempt, config, descriptor));
            }
            Err(e) => {
                error!("Interface provisioning failed: {}", e);
                self.teardown(&mut session, Some(e.into())).await;
            }
        }

        Ok(())
    }

    /// Preflight, then engine start. Runs off the command path.
    async fn run_startup(self: Arc<Self>, attempt: u64, config: TunnelConfig, fd: RawDescriptor) {
        let host = config.proxy_host().to_string();
        let port = config.proxy_port();

        if !self
            .prober
            .probe(&host, port, self.timings.preflight_budget())
            .await
        {
            error!("Preflight: cannot reach {}:{}", host, port);
            self.fail_attempt(attempt, TunnelFailure::Unreachable { host, port })
                .await;
            return;
        }

        if !self.is_connecting(attempt).await {
            debug!("Attempt {} abandoned before engine start", attempt);
            return;
        }

        let engine = self.engine.clone();
        let started = tokio::task::spawn_blocking(move || engine.start(fd, &host, port)).await;

        match started {
            Ok(Ok(handle)) => self.on_engine_started(attempt, handle).await,
            Ok(Err(e)) => self.fail_attempt(attempt, e.into()).await,
            Err(e) => {
                let failure = EngineError::Panicked(e.to_string());
                self.fail_attempt(attempt, failure.into()).await;
            }
        }
    }

    async fn is_connecting(&self, attempt: u64) -> bool {
        let session = self.session.lock().await;
        session.attempt == attempt && session.state == TunnelState::Connecting
    }

    async fn on_engine_started(&self, attempt: u64, handle: TunnelHandle) {
        let mut session = self.session.lock().await;

        let current = session.attempt == attempt
            && session.state == TunnelState::Connecting
            && session.resources.tunnel.is_none();
        if !current {
            warn!(
                "Engine started after attempt {} was abandoned; releasing {:?}",
                attempt, handle
            );
            self.release_engine(Some(handle)).await;
            return;
        }

        session.resources.tunnel = Some(handle);
        if let Some(mut watchdog) = session.watchdog.take() {
            watchdog.cancel();
        }

        let Some(config) = session.config.clone() else {
            return;
        };
        session.state = TunnelState::Connected;
        info!("Tunnel connected ({})", config);
        self.events.publish_state(
            TunnelState::Connected,
            Some(format!("Connected {}", config.target_app())),
        );

        session.sampler = Some(MetricsSampler::spawn(
            SamplerConfig {
                proxy_host: config.proxy_host().to_string(),
                proxy_port: config.proxy_port(),
                interval: self.timings.sample_interval(),
                probe_budget: self.timings.health_budget(),
            },
            self.counters.clone(),
            self.prober.clone(),
            self.events.clone(),
        ));
    }

    async fn fail_attempt(&self, attempt: u64, failure: TunnelFailure) {
        let mut session = self.session.lock().await;

        if session.attempt != attempt || session.state != TunnelState::Connecting {
            debug!("Ignoring failure of stale attempt {}: {}", attempt, failure);
            return;
        }

        error!("Start failed: {}", failure);
        self.teardown(&mut session, Some(failure)).await;
    }

    async fn on_watchdog(&self, attempt: u64, deadline: Duration) {
        let mut session = self.session.lock().await;

        let pending = session.attempt == attempt
            && session.state == TunnelState::Connecting
            && session.resources.tunnel.is_none();
        if !pending {
            return;
        }

        error!("WATCHDOG: engine did not start in {:?}, stopping", deadline);
        // Running inside the watchdog task itself: detach, don't abort
        if let Some(watchdog) = session.watchdog.take() {
            watchdog.detach();
        }
        self.teardown(&mut session, Some(TunnelFailure::Timeout(deadline)))
            .await;
    }

    async fn on_engine_failure(&self, reason: String) {
        let mut session = self.session.lock().await;

        if !session.state.is_connected() {
            debug!("Ignoring engine failure in {}: {}", session.state, reason);
            return;
        }

        error!("Engine reported failure: {}", reason);
        self.teardown(&mut session, Some(TunnelFailure::EngineReported(reason)))
            .await;
    }

    async fn stop(&self) {
        let mut session = self.session.lock().await;

        if session.state == TunnelState::Inactive {
            debug!("Tunnel already stopped");
            return;
        }

        info!("Stopping tunnel ({})", session.state);
        self.teardown(&mut session, None).await;
    }

    /// The single teardown path. Every step is best-effort.
    async fn teardown(&self, session: &mut Session, failure: Option<TunnelFailure>) {
        if let Some(mut sampler) = session.sampler.take() {
            sampler.cancel();
        }

        self.release_engine(session.resources.tunnel.take()).await;

        if let Some(mut interface) = session.resources.interface.take() {
            if let Err(e) = interface.close() {
                warn!("Interface close failed: {}", e);
            }
        }

        if let Some(mut watchdog) = session.watchdog.take() {
            watchdog.cancel();
        }

        session.config = None;
        match failure {
            Some(failure) => {
                session.state = TunnelState::Error;
                self.events
                    .publish_state(TunnelState::Error, Some(failure.to_string()));
            }
            None => {
                session.state = TunnelState::Inactive;
                info!("Tunnel stopped");
                self.events
                    .publish_state(TunnelState::Inactive, Some("Stopped".to_string()));
            }
        }
    }

    async fn release_engine(&self, handle: Option<TunnelHandle>) {
        if handle.is_none() {
            return;
        }
        let engine = self.engine.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || engine.stop(handle)).await {
            error!("Engine stop task failed: {}", e);
        }
    }
}
