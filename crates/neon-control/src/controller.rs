//! The controller instance.
//!
//! Owns every store and exposes the two inbound entry points. Cloning is cheap
//! and all clones share state, so each receive thread holds its own handle.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use neon_common::ids::{DeviceId, SwitchId};
use neon_wire::{DecodeError, FailureEvent, TriggerEvent, decode_failure_digest, decode_trigger};

use crate::action::{ActionSink, CollaboratorError, ControlAction, FlowSelector};
use crate::config::ControllerConfig;
use crate::dedup::TriggerCooldown;
use crate::failover::{FailoverOutcome, FailureTracker, LinkState};
use crate::metrics::{ControllerMetrics, MetricsSnapshot, MetricsSource};
use crate::orchestrator::{CongestionDecision, CongestionOrchestrator, DetourDecision};
use crate::qos::{ProtectionEdge, QosPolicy, QosPolicyEngine};

/// Terminal result of [`Controller::handle_trigger`].
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerOutcome {
    /// Payload rejected by the decoder. No state touched.
    Dropped(DecodeError),
    /// Inside the switch's cooldown window.
    Suppressed { switch: SwitchId },
    Decided(CongestionDecision),
}

/// Terminal result of [`Controller::handle_failure_digest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DigestOutcome {
    /// Payload rejected by the decoder. No state touched.
    Dropped(DecodeError),
    Applied(FailoverOutcome),
}

/// Wraps the caller's sink to count submissions and failures.
struct MeteredSink {
    inner: Arc<dyn ActionSink>,
    metrics: Arc<ControllerMetrics>,
}

impl ActionSink for MeteredSink {
    fn submit(&self, action: ControlAction) -> Result<(), CollaboratorError> {
        let result = self.inner.submit(action);
        match result {
            Ok(()) => ControllerMetrics::incr(&self.metrics.actions_submitted),
            Err(_) => ControllerMetrics::incr(&self.metrics.collaborator_failures),
        }
        result
    }
}

/// Shared controller handle.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<Inner>,
}

struct Inner {
    config: ControllerConfig,
    cooldown: TriggerCooldown,
    failures: FailureTracker,
    qos: QosPolicyEngine,
    orchestrator: CongestionOrchestrator,
    sink: MeteredSink,
    selector: Arc<dyn FlowSelector>,
    metrics: Arc<ControllerMetrics>,
}

impl Controller {
    pub fn new(
        config: ControllerConfig,
        sink: Arc<dyn ActionSink>,
        selector: Arc<dyn FlowSelector>,
    ) -> Self {
        let metrics = Arc::new(ControllerMetrics::default());
        Self {
            inner: Arc::new(Inner {
                cooldown: TriggerCooldown::new(config.trigger.cooldown),
                failures: FailureTracker::new(config.failover.clone()),
                qos: QosPolicyEngine::new(config.qos),
                orchestrator: CongestionOrchestrator::new(&config.trigger),
                sink: MeteredSink {
                    inner: sink,
                    metrics: metrics.clone(),
                },
                selector,
                metrics,
                config,
            }),
        }
    }

    /// Process one trigger packet received from `ingress`.
    ///
    /// Decode, cooldown gate, congestion bookkeeping, then the detour and
    /// EF-protection decisions. Never panics; every path ends in an outcome.
    pub fn handle_trigger(&self, payload: &[u8], ingress: DeviceId, now: Instant) -> TriggerOutcome {
        let inner = &self.inner;
        ControllerMetrics::incr(&inner.metrics.triggers_received);

        let packet = match decode_trigger(payload) {
            Ok(p) => p,
            Err(e) => {
                ControllerMetrics::incr(&inner.metrics.triggers_malformed);
                warn!(device = %ingress, len = payload.len(), error = %e, "dropping malformed trigger");
                return TriggerOutcome::Dropped(e);
            }
        };

        self.ensure_device(&ingress);
        let event = TriggerEvent::new(packet, ingress, now);
        let switch = event.switch();
        if !inner.cooldown.try_admit(switch, &event, now) {
            ControllerMetrics::incr(&inner.metrics.triggers_suppressed);
            debug!(%switch, "trigger suppressed by cooldown");
            return TriggerOutcome::Suppressed { switch };
        }
        ControllerMetrics::incr(&inner.metrics.triggers_admitted);
        info!(
            %switch,
            device = %event.received_device,
            queue_pct = event.queue_depth_pct(),
            severity_pct = event.severity_pct(),
            port = event.affected_port(),
            "trigger admitted"
        );

        match inner.qos.update_congestion_level(
            &event.received_device,
            event.affected_port() as u32,
            event.queue_depth_pct() as i32,
        ) {
            Some(ProtectionEdge::Activated) => {
                ControllerMetrics::incr(&inner.metrics.ef_protection_activations)
            }
            Some(ProtectionEdge::Deactivated) => {
                ControllerMetrics::incr(&inner.metrics.ef_protection_deactivations)
            }
            None => {}
        }

        let decision = inner.orchestrator.respond(
            &event,
            &inner.qos,
            inner.selector.as_ref(),
            &inner.sink,
        );
        if decision.detour.is_warranted() {
            ControllerMetrics::incr(&inner.metrics.overloads);
        }
        match decision.detour {
            DetourDecision::Requested { .. } => {
                ControllerMetrics::incr(&inner.metrics.detours_requested)
            }
            DetourDecision::Protected { .. } => {
                ControllerMetrics::incr(&inner.metrics.detours_protected)
            }
            _ => {}
        }
        if decision.ef_protection {
            ControllerMetrics::incr(&inner.metrics.ef_protection_signals);
        }
        TriggerOutcome::Decided(decision)
    }

    /// Process one failure digest reported by `device`.
    pub fn handle_failure_digest(&self, payload: &[u8], device: DeviceId, now: Instant) -> DigestOutcome {
        let inner = &self.inner;
        ControllerMetrics::incr(&inner.metrics.digests_received);

        let digest = match decode_failure_digest(payload) {
            Ok(d) => d,
            Err(e) => {
                ControllerMetrics::incr(&inner.metrics.digests_malformed);
                warn!(%device, len = payload.len(), error = %e, "dropping malformed failure digest");
                return DigestOutcome::Dropped(e);
            }
        };

        if digest.code().is_some() {
            self.ensure_device(&device);
        }
        let outcome = inner
            .failures
            .apply(FailureEvent::new(digest, device, now), &inner.sink);
        match &outcome {
            FailoverOutcome::Transition { to, .. } => {
                ControllerMetrics::incr(&inner.metrics.failover_transitions);
                if *to == LinkState::Healthy {
                    ControllerMetrics::incr(&inner.metrics.recoveries);
                }
            }
            FailoverOutcome::Unmatched { .. } => {
                ControllerMetrics::incr(&inner.metrics.digests_unmatched)
            }
            FailoverOutcome::Refreshed { .. } | FailoverOutcome::UnknownCode { .. } => {}
        }
        DigestOutcome::Applied(outcome)
    }

    /// Install the default QoS policy for a newly seen device and ask the
    /// southbound side to program it.
    pub fn initialize_device(&self, device: &DeviceId) -> QosPolicy {
        let policy = self.inner.qos.initialize_policy(device);
        self.program_policy(device);
        policy
    }

    /// Initialize `device` unless it already has a policy. Returns `true` if it was new.
    ///
    /// Called by both entry points once a payload has decoded, so only
    /// devices that sent valid telemetry are discovered.
    pub fn ensure_device(&self, device: &DeviceId) -> bool {
        if self.inner.qos.ensure_policy(device).is_none() {
            return false;
        }
        info!(%device, "new device");
        self.program_policy(device);
        true
    }

    fn program_policy(&self, device: &DeviceId) {
        if let Err(e) = self.inner.sink.submit(ControlAction::ProgramQosPolicy {
            device: device.clone(),
        }) {
            warn!(%device, error = %e, "QoS programming request failed");
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.inner.config
    }

    pub fn cooldown(&self) -> &TriggerCooldown {
        &self.inner.cooldown
    }

    pub fn failures(&self) -> &FailureTracker {
        &self.inner.failures
    }

    pub fn qos(&self) -> &QosPolicyEngine {
        &self.inner.qos
    }

    pub fn orchestrator(&self) -> &CongestionOrchestrator {
        &self.inner.orchestrator
    }

    pub fn metrics(&self) -> &ControllerMetrics {
        &self.inner.metrics
    }
}

impl MetricsSource for Controller {
    fn snapshot(&self) -> MetricsSnapshot {
        let inner = &self.inner;
        let mut snap = MetricsSnapshot::from_counters(&inner.metrics);
        for (_, record) in inner.failures.active_failures() {
            match record.state {
                LinkState::PrimaryFailed => snap.links_primary_failed += 1,
                LinkState::BothFailed => snap.links_both_failed += 1,
                LinkState::Healthy => {}
            }
        }
        snap.switches_tracked = inner.cooldown.len() as u64;
        snap.ports_tracked = inner.qos.port_count() as u64;
        snap.ports_ef_protected = inner.qos.protected_ports() as u64;
        snap
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{FixedFlowSelector, FlowCandidate, NoFlowSelector, RecordingSink};
    use neon_common::ids::{FlowId, LinkKey};
    use neon_wire::{FailureCode, FailureDigest, TriggerPacket};
    use std::time::Duration;

    const EXAMPLE_TRIGGER: [u8; 14] = [1, 1, 5, 0, 0, 0, 0, 0x64, 85, 95, 4, 2, 0x00, 0x10];
    const EXAMPLE_DIGEST: [u8; 10] = [1, 0, 0x00, 0x05, 1, 1, 0x00, 0x00, 0x10, 0x00];

    fn controller(selector: Arc<dyn FlowSelector>) -> (Controller, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::new());
        let ctl = Controller::new(ControllerConfig::default(), sink.clone(), selector);
        (ctl, sink)
    }

    fn dev() -> DeviceId {
        DeviceId::new("device:s1")
    }

    #[test]
    fn example_trigger_warrants_detour_and_ef_protection() {
        let (ctl, sink) = controller(Arc::new(NoFlowSelector));
        let outcome = ctl.handle_trigger(&EXAMPLE_TRIGGER, dev(), Instant::now());
        let TriggerOutcome::Decided(d) = outcome else {
            panic!("expected decision");
        };
        assert_eq!(d.switch, SwitchId(5));
        assert!((d.estimate.load - 0.825).abs() < 1e-9);
        assert!(d.detour.is_warranted());
        assert!(d.ef_protection);
        assert_eq!(sink.count("engage_ef_protection"), 1);

        // Port 2 on the ingress device now carries 85 % congestion.
        let stats = ctl.qos().port_stats(&dev(), 2).unwrap();
        assert_eq!(stats.congestion_pct, 85);
        assert!(stats.ef_protection_active);
    }

    #[test]
    fn malformed_trigger_is_dropped_without_state() {
        let (ctl, sink) = controller(Arc::new(NoFlowSelector));
        let outcome = ctl.handle_trigger(&EXAMPLE_TRIGGER[..10], dev(), Instant::now());
        assert_eq!(
            outcome,
            TriggerOutcome::Dropped(DecodeError::TooShort { len: 10, min: 14 })
        );
        assert!(ctl.cooldown().is_empty());
        assert_eq!(ctl.qos().port_count(), 0);
        assert!(sink.actions().is_empty());
        assert_eq!(ctl.snapshot().triggers_malformed, 1);
    }

    #[test]
    fn repeated_trigger_within_cooldown_is_suppressed() {
        let (ctl, sink) = controller(Arc::new(NoFlowSelector));
        let t0 = Instant::now();
        assert!(matches!(
            ctl.handle_trigger(&EXAMPLE_TRIGGER, dev(), t0),
            TriggerOutcome::Decided(_)
        ));
        assert_eq!(
            ctl.handle_trigger(&EXAMPLE_TRIGGER, dev(), t0 + Duration::from_millis(400)),
            TriggerOutcome::Suppressed { switch: SwitchId(5) }
        );
        assert_eq!(sink.count("engage_ef_protection"), 1);
        assert!(matches!(
            ctl.handle_trigger(&EXAMPLE_TRIGGER, dev(), t0 + Duration::from_millis(1000)),
            TriggerOutcome::Decided(_)
        ));

        let snap = ctl.snapshot();
        assert_eq!(snap.triggers_received, 3);
        assert_eq!(snap.triggers_suppressed, 1);
        assert_eq!(snap.triggers_admitted, 2);
        assert_eq!(snap.switches_tracked, 1);
    }

    #[test]
    fn overloaded_trigger_with_candidate_installs_detour() {
        let selector = FixedFlowSelector(FlowCandidate {
            flow: FlowId::new("h1->h3"),
            dscp: 0,
        });
        let (ctl, sink) = controller(Arc::new(selector));
        let payload = TriggerPacket::new(3, 80, 10).to_bytes();
        let TriggerOutcome::Decided(d) = ctl.handle_trigger(&payload, dev(), Instant::now()) else {
            panic!("expected decision");
        };
        assert_eq!(
            d.detour,
            DetourDecision::Requested {
                flow: FlowId::new("h1->h3")
            }
        );
        assert!(!d.ef_protection);
        assert_eq!(sink.count("install_detour"), 1);
        assert_eq!(ctl.snapshot().detours_requested, 1);
    }

    #[test]
    fn example_digest_opens_failure_with_single_detour() {
        let (ctl, sink) = controller(Arc::new(NoFlowSelector));
        let outcome = ctl.handle_failure_digest(&EXAMPLE_DIGEST, dev(), Instant::now());
        let key = LinkKey::new(dev(), 5);
        assert_eq!(
            outcome,
            DigestOutcome::Applied(FailoverOutcome::Transition {
                key: key.clone(),
                from: LinkState::Healthy,
                to: LinkState::PrimaryFailed,
                downtime: None,
            })
        );
        assert_eq!(ctl.failures().state(&key), LinkState::PrimaryFailed);
        assert_eq!(sink.count("install_detour"), 1);
        assert_eq!(ctl.snapshot().links_primary_failed, 1);
    }

    #[test]
    fn primary_down_then_recovered_reports_downtime() {
        let (ctl, sink) = controller(Arc::new(NoFlowSelector));
        let t0 = Instant::now();
        let down = FailureDigest::new(FailureCode::PrimaryDown, 7, true).to_bytes();
        let up = FailureDigest::new(FailureCode::Recovered, 7, true).to_bytes();
        ctl.handle_failure_digest(&down, dev(), t0);
        let outcome = ctl.handle_failure_digest(&up, dev(), t0 + Duration::from_millis(1500));
        let DigestOutcome::Applied(FailoverOutcome::Transition { to, downtime, .. }) = outcome else {
            panic!("expected transition");
        };
        assert_eq!(to, LinkState::Healthy);
        assert_eq!(downtime, Some(Duration::from_millis(1500)));
        assert_eq!(ctl.failures().active_count(), 0);
        assert_eq!(sink.count("remove_detour"), 1);

        let snap = ctl.snapshot();
        assert_eq!(snap.failover_transitions, 2);
        assert_eq!(snap.recoveries, 1);
    }

    #[test]
    fn same_port_on_different_devices_are_independent() {
        let (ctl, _sink) = controller(Arc::new(NoFlowSelector));
        let t0 = Instant::now();
        ctl.handle_failure_digest(&EXAMPLE_DIGEST, DeviceId::new("device:s1"), t0);
        ctl.handle_failure_digest(&EXAMPLE_DIGEST, DeviceId::new("device:s2"), t0);
        assert_eq!(ctl.failures().active_count(), 2);
    }

    #[test]
    fn collaborator_failures_are_counted_not_raised() {
        let (ctl, sink) = controller(Arc::new(NoFlowSelector));
        sink.fail_with(Some(CollaboratorError::Disconnected));
        let outcome = ctl.handle_failure_digest(&EXAMPLE_DIGEST, dev(), Instant::now());
        assert!(matches!(outcome, DigestOutcome::Applied(_)));
        let snap = ctl.snapshot();
        assert!(snap.collaborator_failures >= 1);
        assert_eq!(snap.actions_submitted, 0);
    }

    #[test]
    fn initialize_device_programs_policy() {
        let (ctl, sink) = controller(Arc::new(NoFlowSelector));
        let policy = ctl.initialize_device(&dev());
        assert_eq!(policy.ef_reserved_bandwidth_pct, 20);
        assert!(ctl.qos().policy(&dev()).is_some());
        assert_eq!(
            sink.actions(),
            vec![ControlAction::ProgramQosPolicy { device: dev() }]
        );
    }

    #[test]
    fn ensure_device_initializes_once() {
        let (ctl, sink) = controller(Arc::new(NoFlowSelector));
        assert!(ctl.ensure_device(&dev()));
        assert!(!ctl.ensure_device(&dev()));
        assert_eq!(sink.count("program_qos_policy"), 1);
    }

    #[test]
    fn concurrent_discovery_programs_each_device_once() {
        let (ctl, sink) = controller(Arc::new(NoFlowSelector));
        let devices: Vec<_> = (0..32)
            .map(|i| DeviceId::new(format!("device:race{i}")))
            .collect();

        let mut handles = Vec::new();
        for device in &devices {
            let barrier = Arc::new(std::sync::Barrier::new(2));
            for _ in 0..2 {
                let ctl = ctl.clone();
                let device = device.clone();
                let barrier = barrier.clone();
                handles.push(std::thread::spawn(move || {
                    barrier.wait();
                    ctl.ensure_device(&device)
                }));
            }
        }
        let won = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|first| *first)
            .count();

        assert_eq!(won, devices.len());
        assert_eq!(sink.count("program_qos_policy"), devices.len());
        for device in &devices {
            assert!(ctl.qos().policy(device).is_some());
        }
    }

    #[test]
    fn malformed_digest_does_not_register_the_sender() {
        let (ctl, sink) = controller(Arc::new(NoFlowSelector));
        let outcome = ctl.handle_failure_digest(&EXAMPLE_DIGEST[..4], dev(), Instant::now());
        assert!(matches!(outcome, DigestOutcome::Dropped(_)));
        assert!(ctl.qos().policy(&dev()).is_none());
        assert!(sink.actions().is_empty());
    }

    #[test]
    fn ef_protection_edges_are_counted() {
        let (ctl, _sink) = controller(Arc::new(NoFlowSelector));
        let t0 = Instant::now();
        ctl.handle_trigger(&TriggerPacket::new(5, 85, 95).to_bytes(), dev(), t0);
        let snap = ctl.snapshot();
        assert_eq!(snap.ef_protection_activations, 1);
        assert_eq!(snap.ef_protection_deactivations, 0);

        // Still above 70 %: no new edge.
        ctl.handle_trigger(
            &TriggerPacket::new(5, 90, 95).to_bytes(),
            dev(),
            t0 + Duration::from_millis(1000),
        );
        assert_eq!(ctl.snapshot().ef_protection_activations, 1);

        ctl.handle_trigger(
            &TriggerPacket::new(5, 50, 10).to_bytes(),
            dev(),
            t0 + Duration::from_millis(2000),
        );
        let snap = ctl.snapshot();
        assert_eq!(snap.ef_protection_activations, 1);
        assert_eq!(snap.ef_protection_deactivations, 1);
    }

    #[test]
    fn clones_share_state() {
        let (ctl, _sink) = controller(Arc::new(NoFlowSelector));
        let other = ctl.clone();
        other.handle_failure_digest(&EXAMPLE_DIGEST, dev(), Instant::now());
        assert_eq!(ctl.failures().active_count(), 1);
    }
}
