//! # FRR Failover State Machine
//!
//! One state per protected link, driven by failure digests:
//!
//! ```text
//!               PrimaryDown                BackupDown / BothDown
//!   Healthy ───────────────▶ PrimaryFailed ──────────────────────▶ BothFailed
//!      ▲  │                        │                                  │
//!      │  └────────────────────────┼──────── BothDown ───────────────▶│
//!      │                           │                                  │
//!      └──────── Recovered ────────┴──────────── Recovered ───────────┘
//! ```
//!
//! `Healthy` links have no record. Side effects are submitted to an
//! [`ActionSink`] and never awaited. A failed submission leaves the link
//! failed so the next digest for it can retry.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use neon_common::ids::LinkKey;
use neon_wire::{FailureCode, FailureEvent};

use crate::action::{ActionSink, ControlAction, DetourTarget};
use crate::config::FailoverConfig;

/// Failover state of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Healthy,
    /// Traffic rides the backup next hop; a detour is (or should be) installed.
    PrimaryFailed,
    /// No working next hop; recovery probing in progress.
    BothFailed,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Healthy => "healthy",
            LinkState::PrimaryFailed => "primary_failed",
            LinkState::BothFailed => "both_failed",
        }
    }
}

/// A currently failed link.
#[derive(Debug, Clone)]
pub struct LinkFailureRecord {
    /// Digest that opened the failure.
    pub event: FailureEvent,
    pub state: LinkState,
    pub detected_at: Instant,
    /// Latest digest seen for this link.
    pub last_update: Instant,
    pub recovered_at: Option<Instant>,
    /// End of the quick-recovery budget, once probing has started.
    pub probe_deadline: Option<Instant>,
    /// Whether the detour request was accepted by the collaborator.
    pub detour_active: bool,
    /// Digests received for this link, including the first.
    pub digests: u32,
}

/// Result of applying one digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailoverOutcome {
    /// The link changed state.
    Transition {
        key: LinkKey,
        from: LinkState,
        to: LinkState,
        /// Set when the transition ends a failure.
        downtime: Option<Duration>,
    },
    /// The link stayed in its failed state; the record was refreshed.
    Refreshed { key: LinkKey, state: LinkState },
    /// BackupDown or Recovered for a link with no active failure.
    Unmatched { key: LinkKey, code: FailureCode },
    /// Failure code outside the protocol. Nothing applied.
    UnknownCode { key: LinkKey, code: u8 },
}

impl FailoverOutcome {
    pub fn key(&self) -> &LinkKey {
        match self {
            FailoverOutcome::Transition { key, .. }
            | FailoverOutcome::Refreshed { key, .. }
            | FailoverOutcome::Unmatched { key, .. }
            | FailoverOutcome::UnknownCode { key, .. } => key,
        }
    }
}

/// Side effects decided under the key lock, dispatched after it is released.
#[derive(Default)]
struct Effects {
    actions: Vec<ControlAction>,
    installs_detour: bool,
}

impl Effects {
    fn push(&mut self, action: ControlAction) {
        if matches!(action, ControlAction::InstallDetour { .. }) {
            self.installs_detour = true;
        }
        self.actions.push(action);
    }
}

/// Tracks failed links and drives their state machine.
pub struct FailureTracker {
    config: FailoverConfig,
    active: DashMap<LinkKey, LinkFailureRecord>,
    /// Downtime of the last completed failure per link.
    recoveries: DashMap<LinkKey, Duration>,
}

impl FailureTracker {
    pub fn new(config: FailoverConfig) -> Self {
        Self {
            config,
            active: DashMap::new(),
            recoveries: DashMap::new(),
        }
    }

    /// Current state of a link.
    pub fn state(&self, key: &LinkKey) -> LinkState {
        self.active
            .get(key)
            .map(|r| r.state)
            .unwrap_or(LinkState::Healthy)
    }

    pub fn record(&self, key: &LinkKey) -> Option<LinkFailureRecord> {
        self.active.get(key).map(|r| r.clone())
    }

    /// Snapshot of every active failure.
    pub fn active_failures(&self) -> Vec<(LinkKey, LinkFailureRecord)> {
        self.active
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Downtime of the most recent recovered failure on `key`.
    pub fn recovery_time(&self, key: &LinkKey) -> Option<Duration> {
        self.recoveries.get(key).map(|d| *d)
    }

    /// Forget every tracked failure.
    pub fn clear(&self) {
        self.active.clear();
        self.recoveries.clear();
        info!("cleared all failure tracking");
    }

    /// Apply a digest. Never fails: problems are logged and reported in the outcome.
    pub fn apply(&self, event: FailureEvent, sink: &dyn ActionSink) -> FailoverOutcome {
        let key = event.key();
        let Some(code) = event.code() else {
            warn!(link = %key, code = event.digest.failure_code, "unknown FRR failure code, digest dropped");
            return FailoverOutcome::UnknownCode {
                key,
                code: event.digest.failure_code,
            };
        };

        let mut effects = Effects::default();
        let outcome = match code {
            FailureCode::PrimaryDown => self.on_primary_down(key.clone(), event, &mut effects),
            FailureCode::BackupDown => self.on_backup_down(key.clone(), event, &mut effects),
            FailureCode::BothDown => self.on_both_down(key.clone(), event, &mut effects),
            FailureCode::Recovered => self.on_recovered(key.clone(), event, &mut effects),
        };

        self.dispatch(&key, effects, sink);
        outcome
    }

    fn on_primary_down(
        &self,
        key: LinkKey,
        event: FailureEvent,
        effects: &mut Effects,
    ) -> FailoverOutcome {
        let now = event.detected_at;
        match self.active.entry(key.clone()) {
            Entry::Vacant(vac) => {
                warn!(link = %key, count = event.digest.failure_count, "primary link failed");
                effects.push(ControlAction::InstallDetour {
                    avoid: DetourTarget::Port { link: key.clone() },
                    flow: None,
                });
                effects.push(ControlAction::NotifyTopology {
                    link: key.clone(),
                    up: false,
                });
                vac.insert(LinkFailureRecord {
                    event,
                    state: LinkState::PrimaryFailed,
                    detected_at: now,
                    last_update: now,
                    recovered_at: None,
                    probe_deadline: None,
                    detour_active: false,
                    digests: 1,
                });
                FailoverOutcome::Transition {
                    key,
                    from: LinkState::Healthy,
                    to: LinkState::PrimaryFailed,
                    downtime: None,
                }
            }
            Entry::Occupied(mut occ) => {
                let rec = occ.get_mut();
                rec.last_update = now;
                rec.digests += 1;
                rec.event.digest.failure_count = event.digest.failure_count;
                if !rec.detour_active {
                    info!(link = %key, "retrying detour installation");
                    effects.push(ControlAction::InstallDetour {
                        avoid: DetourTarget::Port { link: key.clone() },
                        flow: None,
                    });
                }
                debug!(link = %key, state = rec.state.as_str(), "repeated primary-down digest");
                FailoverOutcome::Refreshed {
                    key,
                    state: rec.state,
                }
            }
        }
    }

    fn on_backup_down(
        &self,
        key: LinkKey,
        event: FailureEvent,
        effects: &mut Effects,
    ) -> FailoverOutcome {
        let now = event.detected_at;
        let Some(mut rec) = self.active.get_mut(&key) else {
            warn!(link = %key, "backup-down digest with no active failure, ignoring");
            return FailoverOutcome::Unmatched {
                key,
                code: FailureCode::BackupDown,
            };
        };

        rec.last_update = now;
        rec.digests += 1;
        let from = rec.state;
        if from == LinkState::PrimaryFailed {
            error!(link = %key, "backup link also failed, both links down");
            rec.state = LinkState::BothFailed;
        }
        self.probe_round(&key, &mut rec, now, effects);

        if from == LinkState::PrimaryFailed {
            FailoverOutcome::Transition {
                key,
                from,
                to: LinkState::BothFailed,
                downtime: None,
            }
        } else {
            FailoverOutcome::Refreshed {
                key,
                state: rec.state,
            }
        }
    }

    /// Request another quick-recovery round unless the budget, measured from
    /// the primary failure, is spent.
    fn probe_round(
        &self,
        key: &LinkKey,
        rec: &mut LinkFailureRecord,
        now: Instant,
        effects: &mut Effects,
    ) {
        let deadline = *rec
            .probe_deadline
            .get_or_insert(rec.detected_at + self.config.recovery_timeout);
        if now < deadline {
            debug!(
                link = %key,
                interval_ms = self.config.probe_interval.as_millis() as u64,
                "scheduling recovery probe"
            );
            effects.push(ControlAction::QuickRecovery {
                link: key.clone(),
                timeout_ms: deadline.saturating_duration_since(now).as_millis() as u64,
                interval_ms: self.config.probe_interval.as_millis() as u64,
            });
        } else {
            error!(
                link = %key,
                elapsed_ms = now.saturating_duration_since(rec.detected_at).as_millis() as u64,
                "recovery timeout exceeded"
            );
        }
    }

    fn on_both_down(
        &self,
        key: LinkKey,
        event: FailureEvent,
        effects: &mut Effects,
    ) -> FailoverOutcome {
        let now = event.detected_at;
        error!(link = %key, "both primary and backup links failed");
        effects.push(ControlAction::HealthCheck { link: key.clone() });

        match self.active.entry(key.clone()) {
            Entry::Vacant(vac) => {
                vac.insert(LinkFailureRecord {
                    event,
                    state: LinkState::BothFailed,
                    detected_at: now,
                    last_update: now,
                    recovered_at: None,
                    probe_deadline: None,
                    detour_active: false,
                    digests: 1,
                });
                FailoverOutcome::Transition {
                    key,
                    from: LinkState::Healthy,
                    to: LinkState::BothFailed,
                    downtime: None,
                }
            }
            Entry::Occupied(mut occ) => {
                let rec = occ.get_mut();
                let from = rec.state;
                rec.state = LinkState::BothFailed;
                rec.last_update = now;
                rec.digests += 1;
                if from == LinkState::BothFailed {
                    FailoverOutcome::Refreshed {
                        key,
                        state: LinkState::BothFailed,
                    }
                } else {
                    FailoverOutcome::Transition {
                        key,
                        from,
                        to: LinkState::BothFailed,
                        downtime: None,
                    }
                }
            }
        }
    }

    fn on_recovered(
        &self,
        key: LinkKey,
        event: FailureEvent,
        effects: &mut Effects,
    ) -> FailoverOutcome {
        let now = event.detected_at;
        let Some((_, mut rec)) = self.active.remove(&key) else {
            debug!(link = %key, "recovery digest for healthy link");
            return FailoverOutcome::Unmatched {
                key,
                code: FailureCode::Recovered,
            };
        };

        rec.recovered_at = Some(now);
        rec.event.mark_recovered(now);
        let downtime = now.saturating_duration_since(rec.detected_at);
        info!(
            link = %key,
            downtime_ms = downtime.as_millis() as u64,
            digests = rec.digests,
            "link recovered"
        );
        self.recoveries.insert(key.clone(), downtime);

        effects.push(ControlAction::RemoveDetour { link: key.clone() });
        effects.push(ControlAction::NotifyTopology {
            link: key.clone(),
            up: true,
        });

        FailoverOutcome::Transition {
            key,
            from: rec.state,
            to: LinkState::Healthy,
            downtime: Some(downtime),
        }
    }

    fn dispatch(&self, key: &LinkKey, effects: Effects, sink: &dyn ActionSink) {
        let mut detour_ok = None;
        for action in effects.actions {
            let is_install = matches!(action, ControlAction::InstallDetour { .. });
            let name = action.name();
            match sink.submit(action) {
                Ok(()) => {
                    if is_install {
                        detour_ok = Some(true);
                    }
                }
                Err(e) => {
                    error!(link = %key, action = name, error = %e, "control action failed");
                    if is_install {
                        detour_ok = Some(false);
                    }
                }
            }
        }

        if effects.installs_detour {
            // The record may have been removed by a racing recovery; that is fine.
            if let (Some(ok), Some(mut rec)) = (detour_ok, self.active.get_mut(key)) {
                rec.detour_active = ok;
            }
        }
    }
}
