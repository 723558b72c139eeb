//! # DSCP-Aware QoS Policy
//!
//! Three traffic classes, three detour thresholds. Best effort is moved off a
//! congested path first, assured forwarding next, and expedited forwarding
//! only as a last resort:
//!
//! | Class | DSCP | Queue | Detour at |
//! |-------|------|-------|-----------|
//! | EF    | 46   | 0     | ≥ 90 %    |
//! | AF    | 34   | 1     | ≥ 75 %    |
//! | BE    | *    | 2     | ≥ 70 %    |
//!
//! EF protection engages on a port once its congestion reaches 70 %.
//!
//! The free functions are pure. [`QosPolicyEngine`] adds the per-device
//! policy records and per-port statistics.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use tracing::{info, warn};

use neon_common::ids::{DeviceId, PortKey};
use neon_common::models::{OutputQueue, TrafficClass};

use crate::config::QosConfig;

// ─── Pure decisions ─────────────────────────────────────────────────────────

/// Map a DSCP code point to its class. Anything unrecognized is best effort.
pub fn classify(dscp: u8) -> TrafficClass {
    TrafficClass::from_dscp(dscp)
}

/// Detour eligibility with the default thresholds.
pub fn is_eligible_for_detour(class: TrafficClass, congestion_pct: u8) -> bool {
    DetourThresholds::default().allows(class, congestion_pct)
}

/// Output queue for a priority rank. Ranks outside 0..=2 go to the control queue.
pub fn select_queue(priority: u8) -> OutputQueue {
    match TrafficClass::from_priority(priority) {
        Some(class) => OutputQueue::from(class),
        None => OutputQueue::Control,
    }
}

/// Whether EF protection should be on at the given congestion level.
pub fn should_activate_ef_protection(congestion_pct: u8) -> bool {
    congestion_pct >= QosConfig::default().ef_protection_threshold
}

// ─── Records ────────────────────────────────────────────────────────────────

/// Per-class congestion thresholds (percent) at which detours are allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DetourThresholds {
    pub ef: u8,
    pub af: u8,
    pub be: u8,
}

impl Default for DetourThresholds {
    fn default() -> Self {
        let q = QosConfig::default();
        Self {
            ef: q.ef_detour_threshold,
            af: q.af_detour_threshold,
            be: q.be_detour_threshold,
        }
    }
}

impl DetourThresholds {
    pub fn for_class(&self, class: TrafficClass) -> u8 {
        match class {
            TrafficClass::Ef => self.ef,
            TrafficClass::Af => self.af,
            TrafficClass::Be => self.be,
        }
    }

    pub fn allows(&self, class: TrafficClass, congestion_pct: u8) -> bool {
        congestion_pct >= self.for_class(class)
    }
}

/// QoS policy installed on one device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QosPolicy {
    pub device: DeviceId,
    /// Share of link bandwidth reserved for EF.
    pub ef_reserved_bandwidth_pct: u8,
    pub thresholds: DetourThresholds,
    pub ef_protection_enabled: bool,
    pub created_at: DateTime<Utc>,
}

/// Packet and byte counters of one class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClassCounters {
    pub packets: u64,
    pub bytes: u64,
}

/// QoS statistics of one port.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QosPortStats {
    pub key: PortKey,
    /// 0–100, clamped.
    pub congestion_pct: u8,
    pub ef: ClassCounters,
    pub af: ClassCounters,
    pub be: ClassCounters,
    pub ef_protection_active: bool,
    pub last_update: DateTime<Utc>,
}

impl QosPortStats {
    fn new(key: PortKey) -> Self {
        Self {
            key,
            congestion_pct: 0,
            ef: ClassCounters::default(),
            af: ClassCounters::default(),
            be: ClassCounters::default(),
            ef_protection_active: false,
            last_update: Utc::now(),
        }
    }

    pub fn counters(&self, class: TrafficClass) -> ClassCounters {
        match class {
            TrafficClass::Ef => self.ef,
            TrafficClass::Af => self.af,
            TrafficClass::Be => self.be,
        }
    }

    fn counters_mut(&mut self, class: TrafficClass) -> &mut ClassCounters {
        match class {
            TrafficClass::Ef => &mut self.ef,
            TrafficClass::Af => &mut self.af,
            TrafficClass::Be => &mut self.be,
        }
    }
}

/// EF-protection flag flip reported by [`QosPolicyEngine::update_congestion_level`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectionEdge {
    Activated,
    Deactivated,
}

// ─── Engine ─────────────────────────────────────────────────────────────────

/// Per-device policies and per-port statistics.
pub struct QosPolicyEngine {
    defaults: QosConfig,
    policies: DashMap<DeviceId, QosPolicy>,
    ports: DashMap<PortKey, QosPortStats>,
}

impl QosPolicyEngine {
    pub fn new(defaults: QosConfig) -> Self {
        Self {
            defaults,
            policies: DashMap::new(),
            ports: DashMap::new(),
        }
    }

    fn default_thresholds(&self) -> DetourThresholds {
        DetourThresholds {
            ef: self.defaults.ef_detour_threshold,
            af: self.defaults.af_detour_threshold,
            be: self.defaults.be_detour_threshold,
        }
    }

    fn default_policy(&self, device: &DeviceId) -> QosPolicy {
        QosPolicy {
            device: device.clone(),
            ef_reserved_bandwidth_pct: self.defaults.ef_reserved_bandwidth_pct,
            thresholds: self.default_thresholds(),
            ef_protection_enabled: true,
            created_at: Utc::now(),
        }
    }

    fn log_initialized(policy: &QosPolicy) {
        info!(
            device = %policy.device,
            ef_reserve_pct = policy.ef_reserved_bandwidth_pct,
            ef_threshold = policy.thresholds.ef,
            af_threshold = policy.thresholds.af,
            be_threshold = policy.thresholds.be,
            "initialized QoS policy"
        );
    }

    /// Install the default policy on a device, replacing any existing one.
    pub fn initialize_policy(&self, device: &DeviceId) -> QosPolicy {
        let policy = self.default_policy(device);
        Self::log_initialized(&policy);
        self.policies.insert(device.clone(), policy.clone());
        policy
    }

    /// Install the default policy only if the device has none.
    ///
    /// Check and insert happen under the entry lock, so concurrent callers
    /// for one device get exactly one `Some`. An existing policy, including
    /// any threshold override, is left untouched.
    pub fn ensure_policy(&self, device: &DeviceId) -> Option<QosPolicy> {
        match self.policies.entry(device.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(vac) => {
                let policy = self.default_policy(device);
                Self::log_initialized(&policy);
                vac.insert(policy.clone());
                Some(policy)
            }
        }
    }

    pub fn policy(&self, device: &DeviceId) -> Option<QosPolicy> {
        self.policies.get(device).map(|p| p.clone())
    }

    /// Replace a device's detour thresholds. Takes effect on the next decision.
    ///
    /// Returns `false` (and changes nothing) if the device has no policy.
    pub fn update_detour_thresholds(&self, device: &DeviceId, thresholds: DetourThresholds) -> bool {
        match self.policies.get_mut(device) {
            Some(mut policy) => {
                policy.thresholds = thresholds;
                info!(
                    %device,
                    ef = thresholds.ef,
                    af = thresholds.af,
                    be = thresholds.be,
                    "updated QoS thresholds"
                );
                true
            }
            None => {
                warn!(%device, "threshold update for device without QoS policy");
                false
            }
        }
    }

    /// Thresholds in force on a device: its policy, or the defaults.
    pub fn thresholds_for(&self, device: &DeviceId) -> DetourThresholds {
        self.policies
            .get(device)
            .map(|p| p.thresholds)
            .unwrap_or_else(|| self.default_thresholds())
    }

    /// Detour eligibility using the device's own thresholds.
    pub fn is_eligible_for_detour_on(
        &self,
        device: &DeviceId,
        class: TrafficClass,
        congestion_pct: u8,
    ) -> bool {
        self.thresholds_for(device).allows(class, congestion_pct)
    }

    /// Store a port's congestion level and recompute its EF-protection flag.
    ///
    /// The level is clamped to 0..=100. Returns the edge when the flag flips.
    pub fn update_congestion_level(
        &self,
        device: &DeviceId,
        port: u32,
        congestion_pct: i32,
    ) -> Option<ProtectionEdge> {
        let key = PortKey::new(device.clone(), port);
        let level = congestion_pct.clamp(0, 100) as u8;
        let mut stats = self
            .ports
            .entry(key.clone())
            .or_insert_with(|| QosPortStats::new(key));
        stats.congestion_pct = level;
        stats.last_update = Utc::now();

        let needed = level >= self.defaults.ef_protection_threshold;
        if needed == stats.ef_protection_active {
            return None;
        }
        stats.ef_protection_active = needed;
        let edge = if needed {
            ProtectionEdge::Activated
        } else {
            ProtectionEdge::Deactivated
        };
        info!(
            %device,
            port,
            congestion_pct = level,
            edge = ?edge,
            "EF protection changed"
        );
        Some(edge)
    }

    /// Account packets seen on a port to their DSCP class.
    pub fn record_traffic(&self, device: &DeviceId, port: u32, dscp: u8, packets: u64, bytes: u64) {
        let key = PortKey::new(device.clone(), port);
        let mut stats = self
            .ports
            .entry(key.clone())
            .or_insert_with(|| QosPortStats::new(key));
        let counters = stats.counters_mut(classify(dscp));
        counters.packets = counters.packets.saturating_add(packets);
        counters.bytes = counters.bytes.saturating_add(bytes);
        stats.last_update = Utc::now();
    }

    pub fn port_stats(&self, device: &DeviceId, port: u32) -> Option<QosPortStats> {
        self.ports
            .get(&PortKey::new(device.clone(), port))
            .map(|s| s.clone())
    }

    /// Number of ports currently under EF protection.
    pub fn protected_ports(&self) -> usize {
        self.ports.iter().filter(|s| s.ef_protection_active).count()
    }

    pub fn port_count(&self) -> usize {
        self.ports.len()
    }
}
