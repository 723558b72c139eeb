//! # neon-wire
//!
//! Binary telemetry formats emitted by the programmable switches.
//!
//! ## Crate structure
//!
//! - [`wire`] — Trigger packet and failure digest layouts, encode/decode
//! - [`event`] — Controller-side events built from decoded packets

pub mod event;
pub mod wire;

pub use event::{FailureEvent, TriggerEvent};
pub use wire::{
    decode_failure_digest, decode_trigger, DecodeError, DigestKey, FailureCode, FailureDigest,
    TriggerPacket,
};
