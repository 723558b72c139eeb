//! # Prometheus Metrics
//!
//! Controller counters, rendered in Prometheus text exposition format and
//! served over a minimal HTTP endpoint for scraping.

use std::fmt::Write;
use std::io::{Read, Write as IoWrite};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use serde::Serialize;

/// Monotonic counters updated on the hot path.
#[derive(Debug, Default)]
pub struct ControllerMetrics {
    pub triggers_received: AtomicU64,
    pub triggers_malformed: AtomicU64,
    pub triggers_suppressed: AtomicU64,
    pub triggers_admitted: AtomicU64,
    pub overloads: AtomicU64,
    pub detours_requested: AtomicU64,
    pub detours_protected: AtomicU64,
    pub ef_protection_signals: AtomicU64,
    pub ef_protection_activations: AtomicU64,
    pub ef_protection_deactivations: AtomicU64,
    pub digests_received: AtomicU64,
    pub digests_malformed: AtomicU64,
    pub digests_unmatched: AtomicU64,
    pub failover_transitions: AtomicU64,
    pub recoveries: AtomicU64,
    pub actions_submitted: AtomicU64,
    pub collaborator_failures: AtomicU64,
}

impl ControllerMetrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Point-in-time view of counters and gauges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub triggers_received: u64,
    pub triggers_malformed: u64,
    pub triggers_suppressed: u64,
    pub triggers_admitted: u64,
    pub overloads: u64,
    pub detours_requested: u64,
    pub detours_protected: u64,
    pub ef_protection_signals: u64,
    pub ef_protection_activations: u64,
    pub ef_protection_deactivations: u64,
    pub digests_received: u64,
    pub digests_malformed: u64,
    pub digests_unmatched: u64,
    pub failover_transitions: u64,
    pub recoveries: u64,
    pub actions_submitted: u64,
    pub collaborator_failures: u64,
    // Gauges
    pub links_primary_failed: u64,
    pub links_both_failed: u64,
    pub switches_tracked: u64,
    pub ports_tracked: u64,
    pub ports_ef_protected: u64,
}

impl MetricsSnapshot {
    /// Copy the counters; gauges are left at zero for the caller to fill in.
    pub fn from_counters(m: &ControllerMetrics) -> Self {
        Self {
            triggers_received: ControllerMetrics::get(&m.triggers_received),
            triggers_malformed: ControllerMetrics::get(&m.triggers_malformed),
            triggers_suppressed: ControllerMetrics::get(&m.triggers_suppressed),
            triggers_admitted: ControllerMetrics::get(&m.triggers_admitted),
            overloads: ControllerMetrics::get(&m.overloads),
            detours_requested: ControllerMetrics::get(&m.detours_requested),
            detours_protected: ControllerMetrics::get(&m.detours_protected),
            ef_protection_signals: ControllerMetrics::get(&m.ef_protection_signals),
            ef_protection_activations: ControllerMetrics::get(&m.ef_protection_activations),
            ef_protection_deactivations: ControllerMetrics::get(&m.ef_protection_deactivations),
            digests_received: ControllerMetrics::get(&m.digests_received),
            digests_malformed: ControllerMetrics::get(&m.digests_malformed),
            digests_unmatched: ControllerMetrics::get(&m.digests_unmatched),
            failover_transitions: ControllerMetrics::get(&m.failover_transitions),
            recoveries: ControllerMetrics::get(&m.recoveries),
            actions_submitted: ControllerMetrics::get(&m.actions_submitted),
            collaborator_failures: ControllerMetrics::get(&m.collaborator_failures),
            ..Self::default()
        }
    }
}

/// Anything that can produce a [`MetricsSnapshot`] on demand.
pub trait MetricsSource: Send + Sync + 'static {
    fn snapshot(&self) -> MetricsSnapshot;
}

fn write_metric(out: &mut String, name: &str, kind: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
    let _ = writeln!(out, "{name} {value}");
}

/// Render a snapshot as Prometheus text exposition format.
pub fn render_prometheus(s: &MetricsSnapshot) -> String {
    let mut out = String::with_capacity(2048);

    // ── Trigger path ────────────────────────────────────────────

    write_metric(&mut out, "neon_triggers_received_total", "counter", "Trigger packets received.", s.triggers_received);
    write_metric(&mut out, "neon_triggers_malformed_total", "counter", "Trigger packets dropped by the decoder.", s.triggers_malformed);
    write_metric(&mut out, "neon_triggers_suppressed_total", "counter", "Triggers suppressed by the per-switch cooldown.", s.triggers_suppressed);
    write_metric(&mut out, "neon_triggers_admitted_total", "counter", "Triggers admitted for analysis.", s.triggers_admitted);
    write_metric(&mut out, "neon_overloads_total", "counter", "Admitted triggers whose switch load crossed the overload threshold.", s.overloads);
    write_metric(&mut out, "neon_detours_requested_total", "counter", "Congestion detours submitted.", s.detours_requested);
    write_metric(&mut out, "neon_detours_protected_total", "counter", "Detours withheld because the flow class was protected.", s.detours_protected);
    write_metric(&mut out, "neon_ef_protection_signals_total", "counter", "EF protection requests submitted.", s.ef_protection_signals);

    let _ = writeln!(out, "# HELP neon_ef_protection_changes_total Port EF-protection flag flips, by direction.");
    let _ = writeln!(out, "# TYPE neon_ef_protection_changes_total counter");
    let _ = writeln!(out, "neon_ef_protection_changes_total{{edge=\"activated\"}} {}", s.ef_protection_activations);
    let _ = writeln!(out, "neon_ef_protection_changes_total{{edge=\"deactivated\"}} {}", s.ef_protection_deactivations);

    // ── Failover path ───────────────────────────────────────────

    write_metric(&mut out, "neon_digests_received_total", "counter", "Failure digests received.", s.digests_received);
    write_metric(&mut out, "neon_digests_malformed_total", "counter", "Failure digests dropped by the decoder.", s.digests_malformed);
    write_metric(&mut out, "neon_digests_unmatched_total", "counter", "Digests referring to a link with no active failure.", s.digests_unmatched);
    write_metric(&mut out, "neon_failover_transitions_total", "counter", "Link state transitions.", s.failover_transitions);
    write_metric(&mut out, "neon_recoveries_total", "counter", "Completed link recoveries.", s.recoveries);

    let _ = writeln!(out, "# HELP neon_links_failed Links currently failed, by state.");
    let _ = writeln!(out, "# TYPE neon_links_failed gauge");
    let _ = writeln!(out, "neon_links_failed{{state=\"primary_failed\"}} {}", s.links_primary_failed);
    let _ = writeln!(out, "neon_links_failed{{state=\"both_failed\"}} {}", s.links_both_failed);

    write_metric(&mut out, "neon_actions_submitted_total", "counter", "Control actions accepted by the collaborator sink.", s.actions_submitted);
    write_metric(&mut out, "neon_collaborator_failures_total", "counter", "Control actions the collaborator sink rejected.", s.collaborator_failures);

    // ── State sizes ─────────────────────────────────────────────

    write_metric(&mut out, "neon_switches_tracked", "gauge", "Switches with a cooldown entry.", s.switches_tracked);
    write_metric(&mut out, "neon_ports_tracked", "gauge", "Ports with QoS statistics.", s.ports_tracked);
    write_metric(&mut out, "neon_ports_ef_protected", "gauge", "Ports with EF protection active.", s.ports_ef_protected);

    out
}

/// A lightweight HTTP server that serves `/metrics` for Prometheus scraping.
pub struct MetricsServer {
    running: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
    addr: SocketAddr,
}

impl MetricsServer {
    pub fn start<S: MetricsSource>(bind_addr: SocketAddr, source: S) -> std::io::Result<Self> {
        let listener = TcpListener::bind(bind_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let running = Arc::new(AtomicBool::new(true));
        let running_clone = running.clone();

        let handle = thread::Builder::new()
            .name("neon-metrics".into())
            .spawn(move || serve_loop(listener, source, running_clone))
            .map_err(std::io::Error::other)?;

        Ok(MetricsServer {
            running,
            handle: Some(handle),
            addr,
        })
    }

    /// The address the server is actually listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MetricsServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn serve_loop<S: MetricsSource>(listener: TcpListener, source: S, running: Arc<AtomicBool>) {
    while running.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, _)) => handle_connection(stream, &source),
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                tracing::debug!(error = %e, "metrics accept failed");
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

fn handle_connection<S: MetricsSource>(mut stream: TcpStream, source: &S) {
    // The accepted socket may inherit non-blocking mode on some platforms.
    let _ = stream.set_nonblocking(false);
    let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
    let _ = stream.set_write_timeout(Some(Duration::from_secs(2)));

    let mut buf = [0u8; 1024];
    let n = match stream.read(&mut buf) {
        Ok(n) => n,
        Err(_) => return,
    };
    let request = String::from_utf8_lossy(&buf[..n]);

    if request.starts_with("GET /metrics") {
        let body = render_prometheus(&source.snapshot());
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        let _ = stream.write_all(response.as_bytes());
    } else {
        let response = "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
        let _ = stream.write_all(response.as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(MetricsSnapshot);

    impl MetricsSource for Fixed {
        fn snapshot(&self) -> MetricsSnapshot {
            self.0.clone()
        }
    }

    fn sample() -> MetricsSnapshot {
        MetricsSnapshot {
            triggers_received: 10,
            triggers_suppressed: 7,
            triggers_admitted: 3,
            detours_requested: 2,
            links_primary_failed: 1,
            ef_protection_activations: 2,
            ports_ef_protected: 4,
            ..MetricsSnapshot::default()
        }
    }

    fn fetch(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).expect("connect");
        stream
            .write_all(format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n").as_bytes())
            .unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut response = String::new();
        let _ = stream.read_to_string(&mut response);
        response
    }

    #[test]
    fn counters_snapshot() {
        let m = ControllerMetrics::default();
        ControllerMetrics::incr(&m.triggers_received);
        ControllerMetrics::incr(&m.triggers_received);
        ControllerMetrics::incr(&m.recoveries);
        let s = MetricsSnapshot::from_counters(&m);
        assert_eq!(s.triggers_received, 2);
        assert_eq!(s.recoveries, 1);
        assert_eq!(s.links_both_failed, 0);
    }

    #[test]
    fn render_prometheus_contains_help_and_values() {
        let out = render_prometheus(&sample());
        assert!(out.contains("# HELP neon_triggers_received_total"));
        assert!(out.contains("# TYPE neon_triggers_received_total counter"));
        assert!(out.contains("neon_triggers_suppressed_total 7"));
        assert!(out.contains("neon_detours_requested_total 2"));
        assert!(out.contains("neon_links_failed{state=\"primary_failed\"} 1"));
        assert!(out.contains("neon_links_failed{state=\"both_failed\"} 0"));
        assert!(out.contains("neon_ef_protection_changes_total{edge=\"activated\"} 2"));
        assert!(out.contains("neon_ef_protection_changes_total{edge=\"deactivated\"} 0"));
        assert!(out.contains("# TYPE neon_ports_ef_protected gauge"));
        assert!(out.contains("neon_ports_ef_protected 4"));
    }

    #[test]
    fn metrics_server_serves_prometheus() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut server = MetricsServer::start(addr, Fixed(sample())).expect("server should start");
        thread::sleep(Duration::from_millis(100));

        let response = fetch(server.addr(), "/metrics");
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("text/plain"));
        assert!(response.contains("neon_triggers_admitted_total 3"));

        server.stop();
    }

    #[test]
    fn metrics_server_404_on_wrong_path() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut server = MetricsServer::start(addr, Fixed(sample())).expect("server should start");
        thread::sleep(Duration::from_millis(100));

        let response = fetch(server.addr(), "/");
        assert!(response.starts_with("HTTP/1.1 404"));

        server.stop();
    }
}
