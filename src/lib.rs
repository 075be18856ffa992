//! VPP Manager Library
//!
//! This library exposes the supervisor modules for integration testing.
//! The binary entry point is in main.rs.

pub mod config;
pub mod controller;
pub mod error;
pub mod escalation;
pub mod hostnet;
pub mod lifecycle;
pub mod logging;
pub mod process;
pub mod signals;
pub mod snapshot;
pub mod uplink;
pub mod vppapi;
