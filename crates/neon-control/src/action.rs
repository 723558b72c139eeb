//! Control actions and the collaborator seams.
//!
//! The core never performs southbound work itself. Every side effect is a
//! [`ControlAction`] submitted to an [`ActionSink`]; submission must not block
//! and its failure is reported, never raised.

use std::sync::Mutex;

use serde::Serialize;
use thiserror::Error;

use neon_common::ids::{DeviceId, FlowId, LinkKey, SwitchId};

/// What a detour must route around.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DetourTarget {
    /// A congested switch.
    Switch { switch: SwitchId },
    /// A failed port.
    Port { link: LinkKey },
}

/// A request handed to external collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlAction {
    /// Install an SRv6 detour. `flow = None` detours everything crossing the target.
    InstallDetour {
        avoid: DetourTarget,
        flow: Option<FlowId>,
    },
    /// Remove the detour installed for a failed link.
    RemoveDetour { link: LinkKey },
    /// Tell the topology service a link changed state.
    NotifyTopology { link: LinkKey, up: bool },
    /// Probe a link aggressively until it recovers or the budget runs out.
    QuickRecovery {
        link: LinkKey,
        timeout_ms: u64,
        interval_ms: u64,
    },
    /// Start health checks (echo/BFD) on a link with no working path.
    HealthCheck { link: LinkKey },
    /// Shield EF traffic on a switch under extreme congestion.
    EngageEfProtection { switch: SwitchId, severity_pct: u8 },
    /// Push the default QoS registers to a device.
    ProgramQosPolicy { device: DeviceId },
}

impl ControlAction {
    pub fn name(&self) -> &'static str {
        match self {
            ControlAction::InstallDetour { .. } => "install_detour",
            ControlAction::RemoveDetour { .. } => "remove_detour",
            ControlAction::NotifyTopology { .. } => "notify_topology",
            ControlAction::QuickRecovery { .. } => "quick_recovery",
            ControlAction::HealthCheck { .. } => "health_check",
            ControlAction::EngageEfProtection { .. } => "engage_ef_protection",
            ControlAction::ProgramQosPolicy { .. } => "program_qos_policy",
        }
    }
}

/// Failure raised by a collaborator. Always non-fatal for the core.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollaboratorError {
    #[error("collaborator queue full")]
    Backpressure,
    #[error("collaborator disconnected")]
    Disconnected,
    #[error("collaborator rejected request: {0}")]
    Rejected(String),
}

/// Receives control actions. Implementations must return promptly.
pub trait ActionSink: Send + Sync {
    fn submit(&self, action: ControlAction) -> Result<(), CollaboratorError>;
}

/// A flow the telemetry store considers the best detour candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowCandidate {
    pub flow: FlowId,
    /// DSCP of the flow, used to check detour eligibility.
    pub dscp: u8,
}

/// Picks which flow to move off a congested switch.
pub trait FlowSelector: Send + Sync {
    fn select_flow(
        &self,
        switch: SwitchId,
        queue_fill_pct: u8,
    ) -> Result<Option<FlowCandidate>, CollaboratorError>;
}

/// Selector used when no telemetry store is wired in. Never finds a flow.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFlowSelector;

impl FlowSelector for NoFlowSelector {
    fn select_flow(
        &self,
        switch: SwitchId,
        queue_fill_pct: u8,
    ) -> Result<Option<FlowCandidate>, CollaboratorError> {
        tracing::debug!(%switch, queue_fill_pct, "no flow store configured");
        Ok(None)
    }
}

/// Selector that always proposes the same flow.
#[derive(Debug, Clone)]
pub struct FixedFlowSelector(pub FlowCandidate);

impl FlowSelector for FixedFlowSelector {
    fn select_flow(
        &self,
        _switch: SwitchId,
        _queue_fill_pct: u8,
    ) -> Result<Option<FlowCandidate>, CollaboratorError> {
        Ok(Some(self.0.clone()))
    }
}

/// In-memory sink that keeps every submitted action. Can be told to fail.
#[derive(Debug, Default)]
pub struct RecordingSink {
    actions: Mutex<Vec<ControlAction>>,
    fail_with: Mutex<Option<CollaboratorError>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent submission fail with `err` (`None` restores success).
    pub fn fail_with(&self, err: Option<CollaboratorError>) {
        *self.fail_with.lock().unwrap_or_else(|e| e.into_inner()) = err;
    }

    pub fn actions(&self) -> Vec<ControlAction> {
        self.actions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn take(&self) -> Vec<ControlAction> {
        std::mem::take(&mut *self.actions.lock().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn count(&self, name: &str) -> usize {
        self.actions().iter().filter(|a| a.name() == name).count()
    }
}

impl ActionSink for RecordingSink {
    fn submit(&self, action: ControlAction) -> Result<(), CollaboratorError> {
        if let Some(err) = self
            .fail_with
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
        {
            return Err(err);
        }
        self.actions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(action);
        Ok(())
    }
}
