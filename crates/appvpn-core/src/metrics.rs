//! Metrics Sampler
//!
//! Periodic throughput and proxy-health reporting while connected.
//!
//! # Tick
//!
//! 1. Read cumulative rx/tx byte counters
//! 2. Delta against the previous reading, clamped at zero (counter resets
//!    never produce negative throughput)
//! 3. Divide by the measured elapsed time, not the nominal interval
//! 4. Spawn the health probe on its own task, so a hanging probe never
//!    delays the next tick
//! 5. When the probe finishes, publish a sample through the gate
//!
//! # Cancellation
//!
//! Cancelling closes the publish gate under its lock before the tasks are
//! aborted. A probe finishing afterwards finds the gate closed and its
//! sample is discarded, so no metrics event is ever observed after
//! `cancel` returns.

use crate::events::{EventBroadcaster, MetricsSample};
use crate::probe::Probe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use sysinfo::Networks;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Cumulative byte counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ByteTotals {
    pub rx: u64,
    pub tx: u64,
}

impl ByteTotals {
    pub fn new(rx: u64, tx: u64) -> Self {
        Self { rx, tx }
    }
}

/// Source of cumulative traffic counters. Reads must be cheap and
/// non-blocking; unsupported counters read as zero.
pub trait TrafficCounters: Send + Sync {
    fn totals(&self) -> ByteTotals;
}

/// Host-wide interface counters from the OS, summed over all interfaces or
/// restricted to one by name.
///
/// These count every process on the host, not only the tunnelled app.
/// Restrict to the tunnel interface, or supply a per-process
/// [`TrafficCounters`], when only the app's own traffic should count.
pub struct HostTrafficCounters {
    networks: Mutex<Networks>,
    interface: Option<String>,
}

impl HostTrafficCounters {
    pub fn new(interface: Option<String>) -> Self {
        Self {
            networks: Mutex::new(Networks::new_with_refreshed_list()),
            interface,
        }
    }
}

impl TrafficCounters for HostTrafficCounters {
    fn totals(&self) -> ByteTotals {
        let mut networks = self.networks.lock().unwrap_or_else(PoisonError::into_inner);
        networks.refresh(true);

        networks
            .list()
            .iter()
            .filter(|(name, _)| {
                self.interface
                    .as_deref()
                    .is_none_or(|wanted| wanted == name.as_str())
            })
            .fold(ByteTotals::default(), |acc, (_, data)| ByteTotals {
                rx: acc.rx.saturating_add(data.total_received()),
                tx: acc.tx.saturating_add(data.total_transmitted()),
            })
    }
}

/// Rates computed for one tick, plus the raw totals they came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Throughput {
    pub rx_bytes_per_sec: u64,
    pub tx_bytes_per_sec: u64,
    pub totals: ByteTotals,
}

impl Throughput {
    pub fn into_sample(self, proxy_online: bool, timestamp_ms: u64) -> MetricsSample {
        MetricsSample {
            rx_bytes_per_sec: self.rx_bytes_per_sec,
            tx_bytes_per_sec: self.tx_bytes_per_sec,
            rx_total_bytes: self.totals.rx,
            tx_total_bytes: self.totals.tx,
            proxy_online,
            timestamp_ms,
        }
    }
}

/// Turns successive counter readings into bytes-per-second
#[derive(Debug, Clone)]
pub struct ThroughputMeter {
    last: ByteTotals,
    last_at: Instant,
}

impl ThroughputMeter {
    /// Start from a baseline reading
    pub fn new(baseline: ByteTotals, at: Instant) -> Self {
        Self {
            last: baseline,
            last_at: at,
        }
    }

    pub fn sample(&mut self, totals: ByteTotals, at: Instant) -> Throughput {
        let elapsed_ms = at.saturating_duration_since(self.last_at).as_millis().max(1);
        let rate = |now: u64, before: u64| {
            let delta = u128::from(now.saturating_sub(before));
            u64::try_from(delta * 1000 / elapsed_ms).unwrap_or(u64::MAX)
        };

        let throughput = Throughput {
            rx_bytes_per_sec: rate(totals.rx, self.last.rx),
            tx_bytes_per_sec: rate(totals.tx, self.last.tx),
            totals,
        };

        self.last = totals;
        self.last_at = at;
        throughput
    }
}

/// Sampler settings for one connected session
#[derive(Debug, Clone)]
pub struct SamplerConfig {
    pub proxy_host: String,
    pub proxy_port: u16,
    pub interval: Duration,
    pub probe_budget: Duration,
}

struct GateState {
    open: bool,
    last_seq: u64,
}

/// Publish gate shared between the sampler and its probe tasks
struct SampleGate {
    state: Mutex<GateState>,
    events: EventBroadcaster,
}

impl SampleGate {
    fn new(events: EventBroadcaster) -> Self {
        Self {
            state: Mutex::new(GateState {
                open: true,
                last_seq: 0,
            }),
            events,
        }
    }

    /// Publish unless closed or superseded by a newer tick
    fn publish(&self, seq: u64, sample: MetricsSample) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.open {
            debug!("Metrics tick {} finished after cancel, discarded", seq);
            return false;
        }
        if seq <= state.last_seq {
            debug!("Metrics tick {} superseded by {}, discarded", seq, state.last_seq);
            return false;
        }
        state.last_seq = seq;
        self.events.publish_metrics(sample);
        true
    }

    fn close(&self) {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).open = false;
    }
}

/// Running sampler. Cancelled on [`MetricsSampler::cancel`] or drop.
pub struct MetricsSampler {
    gate: Arc<SampleGate>,
    task: Option<JoinHandle<()>>,
}

impl MetricsSampler {
    /// Start sampling. The first tick happens one interval from now.
    pub fn spawn(
        config: SamplerConfig,
        counters: Arc<dyn TrafficCounters>,
        prober: Arc<dyn Probe>,
        events: EventBroadcaster,
    ) -> Self {
        let gate = Arc::new(SampleGate::new(events));
        let task = tokio::spawn(run_sampler(config, counters, prober, gate.clone()));
        info!("Metrics sampler started");

        Self {
            gate,
            task: Some(task),
        }
    }

    /// Stop sampling. No sample is published once this returns.
    pub fn cancel(&mut self) {
        self.gate.close();
        if let Some(task) = self.task.take() {
            // Dropping the tick task's JoinSet aborts in-flight probes too
            task.abort();
            info!("Metrics sampler stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for MetricsSampler {
    fn drop(&mut self) {
        self.cancel();
    }
}

async fn run_sampler(
    config: SamplerConfig,
    counters: Arc<dyn TrafficCounters>,
    prober: Arc<dyn Probe>,
    gate: Arc<SampleGate>,
) {
    let mut meter = ThroughputMeter::new(counters.totals(), Instant::now());
    let start = tokio::time::Instant::now() + config.interval;
    let mut ticker = tokio::time::interval_at(start, config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut probes = JoinSet::new();
    let mut seq: u64 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                seq += 1;
                let throughput = meter.sample(counters.totals(), Instant::now());
                let timestamp_ms = unix_millis();
                debug!(
                    "Metrics tick {}: rx={}B/s tx={}B/s",
                    seq, throughput.rx_bytes_per_sec, throughput.tx_bytes_per_sec
                );

                let prober = prober.clone();
                let gate = gate.clone();
                let host = config.proxy_host.clone();
                let port = config.proxy_port;
                let budget = config.probe_budget;
                let tick = seq;
                probes.spawn(async move {
                    let online = prober.probe(&host, port, budget).await;
                    debug!("Metrics probe: host={} port={} online={}", host, port, online);
                    gate.publish(tick, throughput.into_sample(online, timestamp_ms));
                });
            }
            Some(done) = probes.join_next() => {
                if let Err(e) = done {
                    if e.is_panic() {
                        warn!("Metrics probe panicked: {}", e);
                    }
                }
            }
        }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
