//! Controller-side events.
//!
//! A decoded packet becomes an event once the controller attaches the context
//! the wire bytes do not carry: the receiving device and the controller clock.

use std::time::{Duration, Instant};

use neon_common::ids::{DeviceId, LinkKey, SwitchId};

use crate::wire::{DigestKey, FailureCode, FailureDigest, TriggerPacket};

/// A validated congestion trigger. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerEvent {
    pub packet: TriggerPacket,
    /// Device the trigger was intercepted on.
    pub received_device: DeviceId,
    /// Controller clock at receipt.
    pub received_at: Instant,
}

impl TriggerEvent {
    pub fn new(packet: TriggerPacket, received_device: DeviceId, received_at: Instant) -> Self {
        TriggerEvent {
            packet,
            received_device,
            received_at,
        }
    }

    pub fn switch(&self) -> SwitchId {
        SwitchId(self.packet.switch_id)
    }

    pub fn queue_depth_pct(&self) -> u8 {
        self.packet.queue_depth_pct
    }

    pub fn severity_pct(&self) -> u8 {
        self.packet.severity_pct
    }

    pub fn affected_port(&self) -> u8 {
        self.packet.affected_port
    }
}

/// A failure digest bound to the device that owns the failed port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureEvent {
    pub digest: FailureDigest,
    pub device: DeviceId,
    /// Controller clock when the digest was received.
    pub detected_at: Instant,
    /// Set once a recovery for this failure has been observed.
    pub recovered_at: Option<Instant>,
}

impl FailureEvent {
    pub fn new(digest: FailureDigest, device: DeviceId, detected_at: Instant) -> Self {
        FailureEvent {
            digest,
            device,
            detected_at,
            recovered_at: None,
        }
    }

    /// Tracking key: the failed port on its owning device.
    pub fn key(&self) -> LinkKey {
        LinkKey::new(self.device.clone(), self.digest.port_id)
    }

    /// Key as the data plane reported it, before device binding.
    pub fn digest_key(&self) -> DigestKey {
        self.digest.provisional_key()
    }

    pub fn code(&self) -> Option<FailureCode> {
        self.digest.code()
    }

    pub fn mark_recovered(&mut self, at: Instant) {
        if self.recovered_at.is_none() {
            self.recovered_at = Some(at);
        }
    }

    /// Time between detection and recovery, once recovered.
    pub fn downtime(&self) -> Option<Duration> {
        self.recovered_at
            .map(|at| at.saturating_duration_since(self.detected_at))
    }
}
