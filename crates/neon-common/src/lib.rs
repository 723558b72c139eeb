//! Shared types for the NEON controller.
//!
//! This crate contains:
//! - **Identifiers** — devices, switches, flows and the composite keys used by
//!   every keyed store (`LinkKey`, `PortKey`)
//! - **Traffic classes** — DSCP buckets and their output queues

pub mod ids;
pub mod models;
