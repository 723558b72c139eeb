//! NEON control-plane core.
//!
//! Turns switch telemetry into detour and failover decisions:
//!
//! - [`dedup`] — per-switch trigger cooldown
//! - [`failover`] — per-link FRR failover state machine
//! - [`qos`] — DSCP classes, detour thresholds, EF protection, port stats
//! - [`orchestrator`] — load estimate and detour decision for a trigger
//! - [`controller`] — the long-lived instance owning all of the above
//! - [`action`] — control actions and the collaborator traits they flow through
//! - [`dispatch`], [`listener`], [`metrics`], [`config`] — process plumbing

pub mod action;
pub mod config;
pub mod controller;
pub mod dedup;
pub mod dispatch;
pub mod failover;
pub mod listener;
pub mod metrics;
pub mod orchestrator;
pub mod qos;

pub use controller::{Controller, DigestOutcome, TriggerOutcome};
