//! # Congestion Response
//!
//! Partial load analysis for a single switch, run on every admitted trigger:
//!
//! $$\text{load} = 0.1 \cdot p + 0.1 \cdot s + 0.5 \cdot q + 0.3 \cdot e$$
//!
//! where `q` is the queue fill (0–1), `e` is 1 for edge switches and 0 for
//! infrastructure, and `p`/`s` are the packet-count and average-size factors.
//! Those two are fixed at 0.5 until flow telemetry is wired in. With them,
//! an infrastructure switch tops out at 0.60 and never reaches 0.70.
//!
//! Overload and EF protection are decided independently.

use std::ops::RangeInclusive;

use serde::Serialize;
use tracing::{debug, info, warn};

use neon_common::ids::{FlowId, SwitchId};
use neon_common::models::TrafficClass;
use neon_wire::TriggerEvent;

use crate::action::{ActionSink, ControlAction, DetourTarget, FlowSelector};
use crate::config::TriggerConfig;
use crate::qos::{QosPolicyEngine, classify};

/// Packet-count factor placeholder.
pub const PACKET_COUNT_FACTOR: f64 = 0.5;
/// Average packet size factor placeholder.
pub const AVG_SIZE_FACTOR: f64 = 0.5;

const W_PACKET_COUNT: f64 = 0.1;
const W_AVG_SIZE: f64 = 0.1;
const W_QUEUE: f64 = 0.5;
const W_EDGE: f64 = 0.3;

/// Load estimate of one switch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LoadEstimate {
    pub infrastructure: bool,
    /// Queue fill as a fraction, capped at 1.
    pub queue_factor: f64,
    pub load: f64,
}

/// What happened to the detour half of a decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum DetourDecision {
    /// Load below the overload threshold.
    NotNeeded,
    /// Overloaded, detour submitted for this flow.
    Requested { flow: FlowId },
    /// Overloaded, but the selector had no candidate.
    NoEligibleFlow,
    /// Overloaded, but the candidate's class may not be detoured at this level.
    Protected { flow: FlowId, class: TrafficClass },
    /// Overloaded, but a collaborator failed.
    Failed { reason: String },
}

impl DetourDecision {
    pub fn is_warranted(&self) -> bool {
        !matches!(self, DetourDecision::NotNeeded)
    }
}

/// Outcome of one admitted trigger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CongestionDecision {
    pub switch: SwitchId,
    pub estimate: LoadEstimate,
    pub detour: DetourDecision,
    /// Whether EF protection was signalled for the switch.
    pub ef_protection: bool,
}

/// Decides whether an admitted trigger warrants a detour and/or EF protection.
pub struct CongestionOrchestrator {
    overload_threshold: f64,
    ef_severity_threshold: u8,
    infrastructure: RangeInclusive<u8>,
}

impl CongestionOrchestrator {
    pub fn new(config: &TriggerConfig) -> Self {
        Self {
            overload_threshold: config.overload_threshold,
            ef_severity_threshold: config.ef_severity_threshold,
            infrastructure: config.infrastructure.clone(),
        }
    }

    pub fn is_infrastructure(&self, switch: SwitchId) -> bool {
        self.infrastructure.contains(&switch.0)
    }

    pub fn estimate_load(&self, switch: SwitchId, queue_depth_pct: u8) -> LoadEstimate {
        let infrastructure = self.is_infrastructure(switch);
        let queue_factor = (queue_depth_pct as f64 / 100.0).min(1.0);
        let edge = if infrastructure { 0.0 } else { 1.0 };
        let load = W_PACKET_COUNT * PACKET_COUNT_FACTOR
            + W_AVG_SIZE * AVG_SIZE_FACTOR
            + W_QUEUE * queue_factor
            + W_EDGE * edge;
        LoadEstimate {
            infrastructure,
            queue_factor,
            load,
        }
    }

    pub fn is_overloaded(&self, estimate: &LoadEstimate) -> bool {
        estimate.load >= self.overload_threshold
    }

    pub fn needs_ef_protection(&self, severity_pct: u8) -> bool {
        severity_pct >= self.ef_severity_threshold
    }

    /// Evaluate an admitted trigger and submit whatever it warrants.
    pub fn respond(
        &self,
        event: &TriggerEvent,
        qos: &QosPolicyEngine,
        selector: &dyn FlowSelector,
        sink: &dyn ActionSink,
    ) -> CongestionDecision {
        let switch = event.switch();
        let queue = event.queue_depth_pct();
        let estimate = self.estimate_load(switch, queue);
        debug!(
            %switch,
            load = estimate.load,
            infrastructure = estimate.infrastructure,
            queue_pct = queue,
            "estimated switch load"
        );

        let detour = if self.is_overloaded(&estimate) {
            info!(%switch, load = estimate.load, "switch overloaded, initiating detour");
            self.request_detour(event, qos, selector, sink)
        } else {
            debug!(%switch, load = estimate.load, "load acceptable, no detour needed");
            DetourDecision::NotNeeded
        };

        let ef_protection = self.needs_ef_protection(event.severity_pct());
        if ef_protection {
            warn!(
                %switch,
                severity_pct = event.severity_pct(),
                "critical congestion, engaging EF protection"
            );
            if let Err(e) = sink.submit(ControlAction::EngageEfProtection {
                switch,
                severity_pct: event.severity_pct(),
            }) {
                warn!(%switch, error = %e, "EF protection request failed");
            }
        }

        CongestionDecision {
            switch,
            estimate,
            detour,
            ef_protection,
        }
    }

    /// Pick a flow off the congested switch and ask for a detour.
    ///
    /// Class eligibility is judged against the thresholds of the device the
    /// trigger arrived from (`event.received_device`), not the congested
    /// switch: triggers carry only a numeric switch id and there is no
    /// mapping from it to a device. Per-device threshold overrides on the
    /// congested switch itself are therefore not consulted.
    fn request_detour(
        &self,
        event: &TriggerEvent,
        qos: &QosPolicyEngine,
        selector: &dyn FlowSelector,
        sink: &dyn ActionSink,
    ) -> DetourDecision {
        let switch = event.switch();
        let queue = event.queue_depth_pct();

        let candidate = match selector.select_flow(switch, queue) {
            Ok(Some(c)) => c,
            Ok(None) => {
                debug!(%switch, "no suitable flow found for detour");
                return DetourDecision::NoEligibleFlow;
            }
            Err(e) => {
                warn!(%switch, error = %e, "flow selection failed");
                return DetourDecision::Failed {
                    reason: e.to_string(),
                };
            }
        };

        let class = classify(candidate.dscp);
        if !qos.is_eligible_for_detour_on(&event.received_device, class, queue) {
            info!(%switch, flow = %candidate.flow, class = class.as_str(), queue_pct = queue, "flow class protected at this congestion level");
            return DetourDecision::Protected {
                flow: candidate.flow,
                class,
            };
        }

        info!(%switch, flow = %candidate.flow, "requesting detour");
        match sink.submit(ControlAction::InstallDetour {
            avoid: DetourTarget::Switch { switch },
            flow: Some(candidate.flow.clone()),
        }) {
            Ok(()) => DetourDecision::Requested {
                flow: candidate.flow,
            },
            Err(e) => {
                warn!(%switch, error = %e, "detour request failed");
                DetourDecision::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }
}
