//! UDP ingress for triggers and failure digests.
//!
//! One blocking receive thread per socket. Each datagram is attributed to a
//! device through the configured address map and handed to the shared
//! [`Controller`].

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::controller::Controller;

const RECV_BUF: usize = 2048;
const READ_TIMEOUT: Duration = Duration::from_millis(200);

/// Which entry point a socket feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Trigger,
    Digest,
}

impl Channel {
    fn as_str(self) -> &'static str {
        match self {
            Channel::Trigger => "trigger",
            Channel::Digest => "digest",
        }
    }
}

/// Running trigger and digest receive threads.
pub struct UdpListener {
    running: Arc<AtomicBool>,
    handles: Vec<thread::JoinHandle<()>>,
    trigger_addr: SocketAddr,
    digest_addr: SocketAddr,
}

impl UdpListener {
    /// Bind both sockets and start receiving.
    pub fn start(controller: Controller, trigger_addr: SocketAddr, digest_addr: SocketAddr) -> std::io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let (trigger_sock, trigger_addr) = bind(trigger_addr)?;
        let (digest_sock, digest_addr) = bind(digest_addr)?;

        let mut handles = Vec::with_capacity(2);
        for (channel, sock) in [(Channel::Trigger, trigger_sock), (Channel::Digest, digest_sock)] {
            let controller = controller.clone();
            let running = running.clone();
            let handle = thread::Builder::new()
                .name(format!("neon-rx-{}", channel.as_str()))
                .spawn(move || receive_loop(channel, sock, controller, running))
                .map_err(std::io::Error::other)?;
            handles.push(handle);
        }

        info!(%trigger_addr, %digest_addr, "listening for switch telemetry");
        Ok(Self {
            running,
            handles,
            trigger_addr,
            digest_addr,
        })
    }

    pub fn trigger_addr(&self) -> SocketAddr {
        self.trigger_addr
    }

    pub fn digest_addr(&self) -> SocketAddr {
        self.digest_addr
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for UdpListener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn bind(addr: SocketAddr) -> std::io::Result<(UdpSocket, SocketAddr)> {
    let sock = UdpSocket::bind(addr)?;
    sock.set_read_timeout(Some(READ_TIMEOUT))?;
    let local = sock.local_addr()?;
    Ok((sock, local))
}

fn receive_loop(channel: Channel, sock: UdpSocket, controller: Controller, running: Arc<AtomicBool>) {
    let mut buf = [0u8; RECV_BUF];
    while running.load(Ordering::Relaxed) {
        let (n, src) = match sock.recv_from(&mut buf) {
            Ok(r) => r,
            Err(ref e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                continue;
            }
            Err(e) => {
                warn!(channel = channel.as_str(), error = %e, "receive failed");
                thread::sleep(Duration::from_millis(50));
                continue;
            }
        };

        // Device discovery happens inside the handlers, after a clean decode.
        let device = controller.config().device_for(src.ip());
        let now = Instant::now();
        match channel {
            Channel::Trigger => {
                let outcome = controller.handle_trigger(&buf[..n], device, now);
                debug!(%src, ?outcome, "trigger handled");
            }
            Channel::Digest => {
                let outcome = controller.handle_failure_digest(&buf[..n], device, now);
                debug!(%src, ?outcome, "digest handled");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{NoFlowSelector, RecordingSink};
    use crate::config::ControllerConfig;
    use crate::metrics::MetricsSource;
    use neon_common::ids::{DeviceId, LinkKey};
    use neon_wire::{FailureCode, FailureDigest, TriggerPacket};

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        for _ in 0..50 {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn datagrams_reach_the_controller() {
        let sink = Arc::new(RecordingSink::new());
        let ctl = Controller::new(ControllerConfig::default(), sink.clone(), Arc::new(NoFlowSelector));
        let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut listener = UdpListener::start(ctl.clone(), any, any).unwrap();

        let tx = UdpSocket::bind("127.0.0.1:0").unwrap();
        tx.send_to(&TriggerPacket::new(4, 90, 95).to_bytes(), listener.trigger_addr())
            .unwrap();
        tx.send_to(
            &FailureDigest::new(FailureCode::PrimaryDown, 3, true).to_bytes(),
            listener.digest_addr(),
        )
        .unwrap();

        let device = DeviceId::new("device:127.0.0.1");
        assert!(wait_for(|| ctl.failures().active_count() == 1));
        assert!(wait_for(|| ctl.snapshot().triggers_admitted == 1));
        assert_eq!(
            ctl.failures().state(&LinkKey::new(device.clone(), 3)),
            crate::failover::LinkState::PrimaryFailed
        );
        assert!(ctl.qos().policy(&device).is_some());
        assert_eq!(sink.count("program_qos_policy"), 1);

        listener.stop();
    }

    #[test]
    fn garbage_datagram_does_not_register_the_sender() {
        let sink = Arc::new(RecordingSink::new());
        let ctl = Controller::new(ControllerConfig::default(), sink.clone(), Arc::new(NoFlowSelector));
        let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut listener = UdpListener::start(ctl.clone(), any, any).unwrap();

        let tx = UdpSocket::bind("127.0.0.1:0").unwrap();
        tx.send_to(&[0xde, 0xad], listener.trigger_addr()).unwrap();

        assert!(wait_for(|| ctl.snapshot().triggers_malformed == 1));
        assert!(ctl.qos().policy(&DeviceId::new("device:127.0.0.1")).is_none());
        assert!(sink.actions().is_empty());

        listener.stop();
    }
}
