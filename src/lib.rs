//! kcp-sim: control-plane simulator for managed Kubernetes runtimes
//!
//! Drives Runtime objects through shoot provisioning, credential rotation
//! and tenant module synchronisation, either against live clusters or
//! against the in-memory `MemoryStore`.

pub mod broker;
pub mod clock;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod store;
pub mod telemetry;

pub use crate::error::{Error, Result};
