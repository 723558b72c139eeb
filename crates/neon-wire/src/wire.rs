//! # NEON Wire Format
//!
//! Two fixed-layout, big-endian messages travel from the data plane to the
//! controller.
//!
//! ## Congestion Trigger (14 bytes)
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   Version=1   |  MsgType=1    |   Switch ID   |   Reserved    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                     Timestamp (32-bit, ms)                    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! | Queue Depth % |  Severity %   | Digest Count  | Affected Port |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |          Flow Label           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! ## FRR Failure Digest (10 bytes)
//!
//! ```text
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! | DigestType=1  | Failure Code  |            Port ID            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  Is Primary   | Failure Count |   Timestamp (32-bit, ms) ...  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  ... Timestamp                |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Bytes past the fixed layout are ignored.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Trigger protocol version.
pub const TRIGGER_VERSION: u8 = 1;

/// Message type of a congestion trigger.
pub const MSG_TYPE_TRIGGER: u8 = 1;

/// Encoded size of a trigger packet.
pub const TRIGGER_LEN: usize = 14;

/// Digest type of an FRR failure digest.
pub const FRR_DIGEST_TYPE: u8 = 1;

/// Encoded size of a failure digest.
pub const DIGEST_LEN: usize = 10;

// ─── Errors ──────────────────────────────────────────────────────────────────

/// Why a telemetry message was rejected. Always recoverable: drop the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("message too short: {len} bytes, need {min}")]
    TooShort { len: usize, min: usize },
    #[error("unsupported version: expected {expected}, got {got}")]
    VersionMismatch { expected: u8, got: u8 },
    #[error("unexpected message type: expected {expected}, got {got}")]
    TypeMismatch { expected: u8, got: u8 },
}

// ─── Congestion Trigger ─────────────────────────────────────────────────────

/// Decoded congestion trigger, exactly as the switch sent it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerPacket {
    pub version: u8,
    pub msg_type: u8,
    /// Switch that crossed its queue threshold.
    pub switch_id: u8,
    pub reserved: u8,
    /// Switch clock in milliseconds.
    pub timestamp_ms: u32,
    /// Queue fill percentage. Not clamped here.
    pub queue_depth_pct: u8,
    /// Congestion severity percentage. Not clamped here.
    pub severity_pct: u8,
    /// Number of digests that fed the trigger.
    pub digest_count: u8,
    pub affected_port: u8,
    /// Correlation label for the flow that tripped the threshold.
    pub flow_label: u16,
}

impl TriggerPacket {
    /// Build a valid trigger with the current version and message type.
    pub fn new(switch_id: u8, queue_depth_pct: u8, severity_pct: u8) -> Self {
        TriggerPacket {
            version: TRIGGER_VERSION,
            msg_type: MSG_TYPE_TRIGGER,
            switch_id,
            reserved: 0,
            timestamp_ms: 0,
            queue_depth_pct,
            severity_pct,
            digest_count: 0,
            affected_port: 0,
            flow_label: 0,
        }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.version);
        buf.put_u8(self.msg_type);
        buf.put_u8(self.switch_id);
        buf.put_u8(self.reserved);
        buf.put_u32(self.timestamp_ms);
        buf.put_u8(self.queue_depth_pct);
        buf.put_u8(self.severity_pct);
        buf.put_u8(self.digest_count);
        buf.put_u8(self.affected_port);
        buf.put_u16(self.flow_label);
    }

    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(TRIGGER_LEN);
        self.encode(&mut buf);
        buf
    }

    /// Decode and validate a trigger. Length is checked before version,
    /// version before message type.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        if buf.remaining() < TRIGGER_LEN {
            return Err(DecodeError::TooShort {
                len: buf.remaining(),
                min: TRIGGER_LEN,
            });
        }

        let version = buf.get_u8();
        if version != TRIGGER_VERSION {
            return Err(DecodeError::VersionMismatch {
                expected: TRIGGER_VERSION,
                got: version,
            });
        }
        let msg_type = buf.get_u8();
        if msg_type != MSG_TYPE_TRIGGER {
            return Err(DecodeError::TypeMismatch {
                expected: MSG_TYPE_TRIGGER,
                got: msg_type,
            });
        }

        Ok(TriggerPacket {
            version,
            msg_type,
            switch_id: buf.get_u8(),
            reserved: buf.get_u8(),
            timestamp_ms: buf.get_u32(),
            queue_depth_pct: buf.get_u8(),
            severity_pct: buf.get_u8(),
            digest_count: buf.get_u8(),
            affected_port: buf.get_u8(),
            flow_label: buf.get_u16(),
        })
    }
}

impl fmt::Display for TriggerPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Trigger{{switch={}, queue={}%, severity={}%, digests={}, port={}}}",
            self.switch_id,
            self.queue_depth_pct,
            self.severity_pct,
            self.digest_count,
            self.affected_port
        )
    }
}

/// Decode a congestion trigger from a raw payload.
pub fn decode_trigger(mut payload: &[u8]) -> Result<TriggerPacket, DecodeError> {
    TriggerPacket::decode(&mut payload)
}

// ─── Failure Digest ─────────────────────────────────────────────────────────

/// What the switch observed about a protected link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FailureCode {
    PrimaryDown = 0,
    BackupDown = 1,
    Recovered = 2,
    BothDown = 3,
}

impl FailureCode {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(FailureCode::PrimaryDown),
            1 => Some(FailureCode::BackupDown),
            2 => Some(FailureCode::Recovered),
            3 => Some(FailureCode::BothDown),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureCode::PrimaryDown => "primary_down",
            FailureCode::BackupDown => "backup_down",
            FailureCode::Recovered => "recovered",
            FailureCode::BothDown => "both_down",
        }
    }
}

/// Key for a digest whose owning device is not known yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DigestKey {
    pub code: u8,
    pub port: u16,
}

impl fmt::Display for DigestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.code, self.port)
    }
}

/// Decoded FRR failure digest. Carries no device identity: the caller
/// resolves that from the digest channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDigest {
    pub digest_type: u8,
    /// Raw failure code. Unknown codes are kept so processing can report them.
    pub failure_code: u8,
    pub port_id: u16,
    pub is_primary: bool,
    /// Consecutive failures seen by the switch.
    pub failure_count: u8,
    /// Switch clock in milliseconds.
    pub timestamp_ms: u32,
}

impl FailureDigest {
    pub fn new(code: FailureCode, port_id: u16, is_primary: bool) -> Self {
        FailureDigest {
            digest_type: FRR_DIGEST_TYPE,
            failure_code: code as u8,
            port_id,
            is_primary,
            failure_count: 1,
            timestamp_ms: 0,
        }
    }

    /// Typed failure code, `None` for values outside the protocol.
    pub fn code(&self) -> Option<FailureCode> {
        FailureCode::from_byte(self.failure_code)
    }

    pub fn provisional_key(&self) -> DigestKey {
        DigestKey {
            code: self.failure_code,
            port: self.port_id,
        }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.digest_type);
        buf.put_u8(self.failure_code);
        buf.put_u16(self.port_id);
        buf.put_u8(self.is_primary as u8);
        buf.put_u8(self.failure_count);
        buf.put_u32(self.timestamp_ms);
    }

    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(DIGEST_LEN);
        self.encode(&mut buf);
        buf
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        if buf.remaining() < DIGEST_LEN {
            return Err(DecodeError::TooShort {
                len: buf.remaining(),
                min: DIGEST_LEN,
            });
        }

        let digest_type = buf.get_u8();
        if digest_type != FRR_DIGEST_TYPE {
            return Err(DecodeError::TypeMismatch {
                expected: FRR_DIGEST_TYPE,
                got: digest_type,
            });
        }

        Ok(FailureDigest {
            digest_type,
            failure_code: buf.get_u8(),
            port_id: buf.get_u16(),
            is_primary: buf.get_u8() == 1,
            failure_count: buf.get_u8(),
            timestamp_ms: buf.get_u32(),
        })
    }
}

impl fmt::Display for FailureDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = self.code().map(FailureCode::as_str).unwrap_or("unknown");
        write!(
            f,
            "FailureDigest{{code={code}, port={}, primary={}, count={}}}",
            self.port_id, self.is_primary, self.failure_count
        )
    }
}

/// Decode an FRR failure digest from a raw payload.
pub fn decode_failure_digest(mut payload: &[u8]) -> Result<FailureDigest, DecodeError> {
    FailureDigest::decode(&mut payload)
}
