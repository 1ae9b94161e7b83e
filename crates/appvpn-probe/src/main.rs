//! appvpn-probe: tunnel diagnostics from the command line
//!
//! Runs the same reachability prober and metrics sampler the tunnel manager
//! uses, against a real proxy and the host's interface counters.

use anyhow::{Context, Result, bail};
use appvpn_core::{
    DEFAULT_PROXY_PORT, EventBroadcaster, HostTrafficCounters, MetricsSampler, Probe,
    SamplerConfig, TcpProber, TunnelEvent, TunnelTimings,
};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Per-app tunnel diagnostics
#[derive(Parser)]
#[command(name = "appvpn-probe")]
#[command(version)]
#[command(about = "Probe a SOCKS proxy and watch tunnel throughput", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Timings file (TOML, millisecond fields)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one reachability probe against the proxy
    Check {
        /// Proxy host name or address
        host: String,

        /// Proxy port
        #[arg(default_value_t = DEFAULT_PROXY_PORT)]
        port: u16,

        /// Total probe budget (defaults to the preflight budget)
        #[arg(short, long)]
        budget_ms: Option<u64>,
    },

    /// Sample throughput and proxy health, one JSON line per sample
    Watch {
        /// Proxy host name or address
        host: String,

        /// Proxy port
        #[arg(default_value_t = DEFAULT_PROXY_PORT)]
        port: u16,

        /// Only count traffic on this interface (all interfaces otherwise)
        #[arg(short, long)]
        interface: Option<String>,

        /// Stop after this many samples
        #[arg(short = 'n', long)]
        count: Option<u64>,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CheckReport<'a> {
    host: &'a str,
    port: u16,
    reachable: bool,
    elapsed_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries JSON
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();

    let timings = load_timings(cli.config.as_deref())?;
    debug!("Timings: {:?}", timings);

    match cli.command {
        Commands::Check {
            host,
            port,
            budget_ms,
        } => cmd_check(&timings, &host, port, budget_ms).await,
        Commands::Watch {
            host,
            port,
            interface,
            count,
        } => cmd_watch(&timings, host, port, interface, count).await,
    }
}

/// Read timings from a TOML file, or use the defaults
fn load_timings(path: Option<&Path>) -> Result<TunnelTimings> {
    let Some(path) = path else {
        return Ok(TunnelTimings::default());
    };

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let timings = toml::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;

    info!("Loaded timings from {}", path.display());
    Ok(timings)
}

/// One probe; non-zero exit when unreachable
async fn cmd_check(
    timings: &TunnelTimings,
    host: &str,
    port: u16,
    budget_ms: Option<u64>,
) -> Result<()> {
    let budget = budget_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| timings.preflight_budget());

    let started = Instant::now();
    let reachable = TcpProber::from_timings(timings).probe(host, port, budget).await;
    let report = CheckReport {
        host,
        port,
        reachable,
        elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
    };
    println!("{}", serde_json::to_string(&report)?);

    if !reachable {
        bail!("Proxy {}:{} unreachable within {:?}", host, port, budget);
    }
    Ok(())
}

/// Print samples until `count` is reached or Ctrl-C
async fn cmd_watch(
    timings: &TunnelTimings,
    host: String,
    port: u16,
    interface: Option<String>,
    count: Option<u64>,
) -> Result<()> {
    let events = EventBroadcaster::new();
    let mut rx = events.subscribe();

    info!(
        "Watching {}:{} on {} every {:?}",
        host,
        port,
        interface.as_deref().unwrap_or("all interfaces"),
        timings.sample_interval()
    );

    let mut sampler = MetricsSampler::spawn(
        SamplerConfig {
            proxy_host: host,
            proxy_port: port,
            interval: timings.sample_interval(),
            probe_budget: timings.health_budget(),
        },
        Arc::new(HostTrafficCounters::new(interface)),
        Arc::new(TcpProber::from_timings(timings)),
        events,
    );

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut printed = 0u64;
    loop {
        tokio::select! {
            signal = &mut shutdown => {
                signal.context("Failed to listen for Ctrl-C")?;
                info!("Interrupted");
                break;
            }
            event = rx.recv() => match event {
                Ok(TunnelEvent::Metrics(sample)) => {
                    println!("{}", serde_json::to_string(&sample)?);
                    printed += 1;
                    if count.is_some_and(|limit| printed >= limit) {
                        break;
                    }
                }
                Ok(TunnelEvent::State(_)) => {}
                Err(RecvError::Lagged(skipped)) => warn!("Dropped {} samples", skipped),
                Err(RecvError::Closed) => break,
            },
        }
    }

    sampler.cancel();
    info!("Printed {} samples", printed);
    Ok(())
}
