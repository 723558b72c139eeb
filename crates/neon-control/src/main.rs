//! # NEON Controller
//!
//! Receives trigger packets and failure digests from the switches, runs the
//! congestion and failover logic, and dispatches the resulting control
//! actions.
//!
//! ## Usage
//!
//! ```bash
//! # Defaults: triggers on :50001, digests on :50002
//! neon-controller
//!
//! # Config file with a Prometheus endpoint override
//! neon-controller --config neon.toml --metrics-addr 0.0.0.0:9100
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use neon_control::Controller;
use neon_control::action::NoFlowSelector;
use neon_control::config::ControllerConfig;
use neon_control::dispatch::{ChannelSink, Dispatcher, LoggingExecutor};
use neon_control::listener::UdpListener;
use neon_control::metrics::{MetricsServer, MetricsSource};

#[derive(Parser, Debug)]
#[command(name = "neon-controller", about = "NEON congestion and failover controller")]
struct Cli {
    /// TOML configuration file. Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the trigger listen address.
    #[arg(long)]
    trigger_addr: Option<SocketAddr>,

    /// Override the failure digest listen address.
    #[arg(long)]
    digest_addr: Option<SocketAddr>,

    /// Serve Prometheus metrics on this address.
    #[arg(long)]
    metrics_addr: Option<SocketAddr>,

    /// Seconds between stats log lines.
    #[arg(long, default_value_t = 10)]
    stats_interval: u64,
}

fn main() -> anyhow::Result<()> {
    // ── Logging ─────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .compact()
        .init();

    // ── Config ──────────────────────────────────────────────────
    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => ControllerConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ControllerConfig::default(),
    };
    if let Some(addr) = cli.trigger_addr {
        config.listen.trigger_addr = addr;
    }
    if let Some(addr) = cli.digest_addr {
        config.listen.digest_addr = addr;
    }
    if cli.metrics_addr.is_some() {
        config.listen.metrics_addr = cli.metrics_addr;
    }

    tracing::info!(
        trigger = %config.listen.trigger_addr,
        digest = %config.listen.digest_addr,
        metrics = ?config.listen.metrics_addr,
        cooldown_ms = config.trigger.cooldown.as_millis() as u64,
        devices = config.devices.len(),
        "neon-controller starting"
    );

    // ── Dispatch ────────────────────────────────────────────────
    let (sink, rx) = ChannelSink::bounded(config.channel_capacity);
    let mut dispatcher =
        Dispatcher::spawn(rx, LoggingExecutor::default()).context("spawning dispatcher")?;

    // ── Controller + listeners ──────────────────────────────────
    let trigger_addr = config.listen.trigger_addr;
    let digest_addr = config.listen.digest_addr;
    let metrics_addr = config.listen.metrics_addr;
    let controller = Controller::new(config, Arc::new(sink), Arc::new(NoFlowSelector));

    let mut listener = UdpListener::start(controller.clone(), trigger_addr, digest_addr)
        .context("binding telemetry sockets")?;

    let mut metrics_server = match metrics_addr {
        Some(addr) => {
            let server = MetricsServer::start(addr, controller.clone())
                .with_context(|| format!("binding metrics server on {addr}"))?;
            tracing::info!(addr = %server.addr(), "metrics server listening");
            Some(server)
        }
        None => None,
    };

    // ── Graceful shutdown ───────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || {
            tracing::info!("shutting down...");
            running.store(false, Ordering::Relaxed);
        })
        .context("installing Ctrl-C handler")?;
    }

    // ── Main loop ───────────────────────────────────────────────
    let stats_interval = Duration::from_secs(cli.stats_interval.max(1));
    let mut last_stats_log = Instant::now();
    while running.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));

        if last_stats_log.elapsed() >= stats_interval {
            let s = controller.snapshot();
            tracing::info!(
                triggers = s.triggers_received,
                admitted = s.triggers_admitted,
                suppressed = s.triggers_suppressed,
                detours = s.detours_requested,
                digests = s.digests_received,
                primary_failed = s.links_primary_failed,
                both_failed = s.links_both_failed,
                action_failures = s.collaborator_failures,
                "controller stats"
            );
            last_stats_log = Instant::now();
        }
    }

    // ── Cleanup ─────────────────────────────────────────────────
    listener.stop();
    if let Some(server) = metrics_server.as_mut() {
        server.stop();
    }
    dispatcher.shutdown();
    let s = controller.snapshot();
    tracing::info!(
        triggers = s.triggers_received,
        digests = s.digests_received,
        "neon-controller stopped"
    );

    Ok(())
}
