//! Supervisor-level errors
//!
//! Failures inside one generation never leave the controller as errors;
//! these are the outcomes that end the whole run, plus config problems.

use crate::lifecycle::Generation;
use crate::uplink::UplinkDriver;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("failed to read config file {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to spawn dataplane {binary:?} for generation {generation}: {source}")]
    Spawn {
        binary: PathBuf,
        generation: Generation,
        #[source]
        source: io::Error,
    },

    #[error("no uplink driver is supported for interface {interface}")]
    NoSupportedDriver { interface: String },

    #[error("uplink driver {driver} failed in generation {generation} and retries are disabled")]
    ExplicitDriverFailed {
        driver: UplinkDriver,
        generation: Generation,
    },

    #[error("all {attempted} uplink drivers failed to keep the dataplane running")]
    DriversExhausted { attempted: usize },
}
