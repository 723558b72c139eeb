//! # Telemetry Injector
//!
//! Sends hand-crafted trigger packets and failure digests to a running
//! controller. Used to replay congestion and failover scenarios without
//! programmable switches.
//!
//! ```bash
//! # A burst of 5 triggers from edge switch 5, 200 ms apart
//! neon-inject trigger --switch 5 --queue 85 --severity 95 --count 5 --interval-ms 200
//!
//! # Primary next hop on port 3 goes down
//! neon-inject digest --code primary-down --port 3
//!
//! # Full primary → backup → recovered sequence on port 3
//! neon-inject failover --port 3 --step-ms 1000
//! ```

use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use neon_wire::{FailureCode, FailureDigest, TriggerPacket};

#[derive(Parser, Debug)]
#[command(name = "neon-inject", about = "Send NEON telemetry packets to a controller")]
struct Cli {
    /// Controller trigger address.
    #[arg(long, default_value = "127.0.0.1:50001")]
    trigger_addr: SocketAddr,

    /// Controller digest address.
    #[arg(long, default_value = "127.0.0.1:50002")]
    digest_addr: SocketAddr,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send congestion trigger packets.
    Trigger {
        #[arg(long)]
        switch: u8,
        #[arg(long)]
        queue: u8,
        #[arg(long, default_value_t = 0)]
        severity: u8,
        #[arg(long, default_value_t = 0)]
        port: u8,
        #[arg(long, default_value_t = 1)]
        count: u32,
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,
    },
    /// Send one failure digest.
    Digest {
        #[arg(long, value_enum)]
        code: Code,
        #[arg(long)]
        port: u16,
        /// Report the failure on the backup next hop.
        #[arg(long, default_value_t = false)]
        backup: bool,
    },
    /// Primary down, backup down, then recovered on one port.
    Failover {
        #[arg(long)]
        port: u16,
        #[arg(long, default_value_t = 1000)]
        step_ms: u64,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Code {
    PrimaryDown,
    BackupDown,
    Recovered,
    BothDown,
}

impl From<Code> for FailureCode {
    fn from(c: Code) -> Self {
        match c {
            Code::PrimaryDown => FailureCode::PrimaryDown,
            Code::BackupDown => FailureCode::BackupDown,
            Code::Recovered => FailureCode::Recovered,
            Code::BothDown => FailureCode::BothDown,
        }
    }
}

fn send_digest(sock: &UdpSocket, to: SocketAddr, code: FailureCode, port: u16, primary: bool) -> anyhow::Result<()> {
    let digest = FailureDigest::new(code, port, primary);
    sock.send_to(&digest.to_bytes(), to)
        .with_context(|| format!("sending digest to {to}"))?;
    tracing::info!(code = code.as_str(), port, primary, %to, "digest sent");
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .compact()
        .init();

    let cli = Cli::parse();
    let sock = UdpSocket::bind("0.0.0.0:0").context("binding local socket")?;

    match cli.command {
        Command::Trigger {
            switch,
            queue,
            severity,
            port,
            count,
            interval_ms,
        } => {
            let mut packet = TriggerPacket::new(switch, queue, severity);
            packet.affected_port = port;
            for i in 0..count {
                packet.digest_count = i.min(u8::MAX as u32) as u8;
                sock.send_to(&packet.to_bytes(), cli.trigger_addr)
                    .with_context(|| format!("sending trigger to {}", cli.trigger_addr))?;
                tracing::info!(switch, queue, severity, seq = i, "trigger sent");
                if interval_ms > 0 && i + 1 < count {
                    std::thread::sleep(Duration::from_millis(interval_ms));
                }
            }
        }
        Command::Digest { code, port, backup } => {
            send_digest(&sock, cli.digest_addr, code.into(), port, !backup)?;
        }
        Command::Failover { port, step_ms } => {
            let steps = [
                (FailureCode::PrimaryDown, true),
                (FailureCode::BackupDown, false),
                (FailureCode::Recovered, true),
            ];
            for (i, (code, primary)) in steps.into_iter().enumerate() {
                if i > 0 {
                    std::thread::sleep(Duration::from_millis(step_ms));
                }
                send_digest(&sock, cli.digest_addr, code, port, primary)?;
            }
        }
    }

    Ok(())
}
