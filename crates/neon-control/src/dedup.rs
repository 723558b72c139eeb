//! # Trigger Cooldown
//!
//! A switch that keeps its queue above threshold emits a trigger on every
//! digest. The cache collapses such bursts into at most one admitted trigger
//! per switch per cooldown window. The window slides: each admitted trigger
//! restarts it from its own arrival time, so triggers spaced wider than the
//! cooldown are all admitted.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use neon_common::ids::SwitchId;
use neon_wire::TriggerEvent;

struct CooldownEntry {
    last_admitted: Instant,
    /// Kept for inspection only; never consulted for admission.
    last_event: TriggerEvent,
}

/// Per-switch sliding suppression window.
pub struct TriggerCooldown {
    cooldown: Duration,
    entries: DashMap<SwitchId, CooldownEntry>,
}

impl TriggerCooldown {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            entries: DashMap::new(),
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    fn in_window(&self, last: Instant, now: Instant) -> bool {
        // A `now` earlier than the last admission counts as zero elapsed.
        now.saturating_duration_since(last) < self.cooldown
    }

    /// Whether a trigger from `key` arriving at `now` may proceed.
    ///
    /// Check-only. Callers racing on the same key should use [`try_admit`](Self::try_admit).
    pub fn should_process(&self, key: SwitchId, now: Instant) -> bool {
        match self.entries.get(&key) {
            Some(entry) => !self.in_window(entry.last_admitted, now),
            None => true,
        }
    }

    /// Restart the window for `key` at `now`.
    pub fn record(&self, key: SwitchId, event: TriggerEvent, now: Instant) {
        self.entries.insert(
            key,
            CooldownEntry {
                last_admitted: now,
                last_event: event,
            },
        );
    }

    /// Check and record under the key's lock. Returns `true` if admitted.
    pub fn try_admit(&self, key: SwitchId, event: &TriggerEvent, now: Instant) -> bool {
        match self.entries.entry(key) {
            Entry::Occupied(mut occ) => {
                if self.in_window(occ.get().last_admitted, now) {
                    return false;
                }
                let entry = occ.get_mut();
                entry.last_admitted = now;
                entry.last_event = event.clone();
                true
            }
            Entry::Vacant(vac) => {
                vac.insert(CooldownEntry {
                    last_admitted: now,
                    last_event: event.clone(),
                });
                true
            }
        }
    }

    /// Most recently admitted trigger for a switch.
    pub fn last_event(&self, key: SwitchId) -> Option<TriggerEvent> {
        self.entries.get(&key).map(|e| e.last_event.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}
