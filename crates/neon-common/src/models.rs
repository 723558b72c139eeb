//! DSCP traffic classes and output queues.

use std::fmt;

use serde::{Deserialize, Serialize};

/// DSCP code point for Expedited Forwarding.
pub const DSCP_EF: u8 = 46;
/// DSCP code point for Assured Forwarding (AF41).
pub const DSCP_AF: u8 = 34;
/// DSCP code point for Best Effort.
pub const DSCP_BE: u8 = 0;

/// Priority bucket a packet falls into.
///
/// The numeric priority doubles as the scheduling rank: 0 is served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrafficClass {
    /// Expedited Forwarding — latency critical, detoured last.
    Ef,
    /// Assured Forwarding.
    Af,
    /// Best Effort — detoured first.
    Be,
}

impl TrafficClass {
    pub const ALL: [TrafficClass; 3] = [TrafficClass::Ef, TrafficClass::Af, TrafficClass::Be];

    /// Classify a DSCP value. Unrecognized code points land in best effort.
    pub fn from_dscp(dscp: u8) -> Self {
        match dscp {
            DSCP_EF => TrafficClass::Ef,
            DSCP_AF => TrafficClass::Af,
            _ => TrafficClass::Be,
        }
    }

    /// Priority rank (0 = EF, 1 = AF, 2 = BE).
    pub fn priority(self) -> u8 {
        match self {
            TrafficClass::Ef => 0,
            TrafficClass::Af => 1,
            TrafficClass::Be => 2,
        }
    }

    pub fn from_priority(priority: u8) -> Option<Self> {
        match priority {
            0 => Some(TrafficClass::Ef),
            1 => Some(TrafficClass::Af),
            2 => Some(TrafficClass::Be),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TrafficClass::Ef => "ef",
            TrafficClass::Af => "af",
            TrafficClass::Be => "be",
        }
    }

    /// Human readable name for logs.
    pub fn display_name(self) -> &'static str {
        match self {
            TrafficClass::Ef => "EF (Expedited Forwarding)",
            TrafficClass::Af => "AF (Assured Forwarding)",
            TrafficClass::Be => "BE (Best Effort)",
        }
    }
}

impl fmt::Display for TrafficClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Egress queue on the switch scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum OutputQueue {
    Ef = 0,
    Af = 1,
    Be = 2,
    Control = 3,
}

impl OutputQueue {
    pub fn id(self) -> u8 {
        self as u8
    }
}

impl From<TrafficClass> for OutputQueue {
    fn from(class: TrafficClass) -> Self {
        match class {
            TrafficClass::Ef => OutputQueue::Ef,
            TrafficClass::Af => OutputQueue::Af,
            TrafficClass::Be => OutputQueue::Be,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dscp_classification() {
        assert_eq!(TrafficClass::from_dscp(46), TrafficClass::Ef);
        assert_eq!(TrafficClass::from_dscp(34), TrafficClass::Af);
        assert_eq!(TrafficClass::from_dscp(0), TrafficClass::Be);
        assert_eq!(TrafficClass::from_dscp(12), TrafficClass::Be);
        assert_eq!(TrafficClass::from_dscp(63), TrafficClass::Be);
    }

    #[test]
    fn priority_roundtrips_for_known_classes() {
        for class in TrafficClass::ALL {
            assert_eq!(TrafficClass::from_priority(class.priority()), Some(class));
        }
        assert_eq!(TrafficClass::from_priority(3), None);
    }

    #[test]
    fn queue_ids_follow_priority() {
        assert_eq!(OutputQueue::from(TrafficClass::Ef).id(), 0);
        assert_eq!(OutputQueue::from(TrafficClass::Af).id(), 1);
        assert_eq!(OutputQueue::from(TrafficClass::Be).id(), 2);
        assert_eq!(OutputQueue::Control.id(), 3);
    }
}
