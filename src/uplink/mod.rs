//! Uplink Strategies
//!
//! An uplink strategy knows how to hand the node's uplink interface to the
//! dataplane and how to give it back:
//!
//! 1. `preconfigure_linux`: snapshot the link, then prepare it on the host
//! 2. `create_main_vpp_interface`: attach it inside the running dataplane
//! 3. `restore_linux`: put the snapshot back (best-effort, never fails)
//!
//! Strategies are tried in priority order; `af_packet` works everywhere and
//! is always last.

mod af_packet;
mod af_xdp;

pub use af_packet::AfPacketStrategy;
pub use af_xdp::AfXdpStrategy;

use crate::config::{AfPacketSection, AfXdpSection, ManagerConfig};
use crate::error::ManagerError;
use crate::hostnet;
use crate::snapshot::HostSnapshot;
use crate::vppapi::VppApi;
use anyhow::{bail, Context, Result};
use clap::ValueEnum;
use nix::unistd::Pid;
use serde::Deserialize;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{error, info, warn};

/// Interface index VPP must assign to the uplink (0 is `local0`).
pub const DATA_INTERFACE_SW_IF_INDEX: u32 = 1;

/// How long restore waits for the link to come back from the dataplane.
const LINK_RETURN_ATTEMPTS: u32 = 10;
const LINK_RETURN_INTERVAL: Duration = Duration::from_millis(500);

/// Names of the uplink drivers.
#[derive(ValueEnum, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum UplinkDriver {
    AfXdp,
    AfPacket,
}

impl fmt::Display for UplinkDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UplinkDriver::AfXdp => "af_xdp",
            UplinkDriver::AfPacket => "af_packet",
        };
        f.write_str(name)
    }
}

/// Host parameters shared by every strategy instance.
#[derive(Debug, Clone, PartialEq)]
pub struct UplinkParams {
    pub interface: String,
    pub af_packet: AfPacketSection,
    pub af_xdp: AfXdpSection,
    baseline: OnceLock<HostSnapshot>,
}

impl UplinkParams {
    pub fn new(interface: String, af_packet: AfPacketSection, af_xdp: AfXdpSection) -> Self {
        Self {
            interface,
            af_packet,
            af_xdp,
            baseline: OnceLock::new(),
        }
    }

    /// The uplink as the operator configured it, before any strategy touched it.
    ///
    /// Captured on first use and shared by every later generation, so a
    /// partial restore never becomes the state the next strategy restores to.
    pub fn baseline(&self) -> Result<HostSnapshot> {
        if let Some(snapshot) = self.baseline.get() {
            return Ok(snapshot.clone());
        }
        let snapshot = HostSnapshot::capture(&self.interface)
            .with_context(|| format!("Error finding link {}", self.interface))?;
        Ok(self.baseline.get_or_init(|| snapshot).clone())
    }

    /// Seed the baseline; returns false if one was already captured.
    #[cfg(test)]
    pub(crate) fn set_baseline(&self, snapshot: HostSnapshot) -> bool {
        self.baseline.set(snapshot).is_ok()
    }
}

impl From<&ManagerConfig> for UplinkParams {
    fn from(config: &ManagerConfig) -> Self {
        Self::new(
            config.interface.clone(),
            config.af_packet.clone(),
            config.af_xdp.clone(),
        )
    }
}

/// Capability contract of an uplink strategy.
pub trait UplinkStrategy: Send {
    fn driver(&self) -> UplinkDriver;

    /// Whether this host can use the strategy; `warn` logs the reason when not.
    fn is_supported(&self, warn: bool) -> bool;

    /// Snapshot the uplink, then prepare it on the host side.
    fn preconfigure_linux(&mut self) -> Result<()>;

    /// Attach the uplink inside the running dataplane `pid`.
    fn create_main_vpp_interface(&mut self, vpp: &dyn VppApi, pid: Pid) -> Result<()>;

    /// Give the uplink back to the host. Never fails; problems are logged.
    fn restore_linux(&mut self);
}

/// Candidate strategies for a run.
pub enum Selection {
    /// Supported strategies in priority order; failures fall through to the next
    Ordered(Vec<Box<dyn UplinkStrategy>>),
    /// A single configured strategy; its failure ends the run
    Explicit(Box<dyn UplinkStrategy>),
}

/// Build the strategy for `driver`.
pub fn new_strategy(driver: UplinkDriver, params: Arc<UplinkParams>) -> Box<dyn UplinkStrategy> {
    match driver {
        UplinkDriver::AfXdp => Box::new(AfXdpStrategy::new(params)),
        UplinkDriver::AfPacket => Box::new(AfPacketStrategy::new(params)),
    }
}

/// Supported strategies, best first.
pub fn supported_strategies(params: Arc<UplinkParams>) -> Vec<Box<dyn UplinkStrategy>> {
    [UplinkDriver::AfXdp, UplinkDriver::AfPacket]
        .into_iter()
        .map(|driver| new_strategy(driver, Arc::clone(&params)))
        .filter(|strategy| strategy.is_supported(false))
        .collect()
}

/// Pick the strategies for this run from the configuration.
pub fn select(
    native_driver: Option<UplinkDriver>,
    params: Arc<UplinkParams>,
) -> Result<Selection, ManagerError> {
    if let Some(driver) = native_driver {
        let strategy = new_strategy(driver, params);
        if !strategy.is_supported(true) {
            warn!(%driver, "configured uplink driver reports unsupported, trying anyway");
        }
        return Ok(Selection::Explicit(strategy));
    }

    let strategies = supported_strategies(Arc::clone(&params));
    if strategies.is_empty() {
        return Err(ManagerError::NoSupportedDriver {
            interface: params.interface.clone(),
        });
    }
    let names: Vec<String> = strategies.iter().map(|s| s.driver().to_string()).collect();
    info!(drivers = ?names, "uplink drivers to try");
    Ok(Selection::Ordered(strategies))
}

/// Fail loudly when VPP gave the uplink an unexpected index.
pub fn check_sw_if_index(driver: UplinkDriver, sw_if_index: u32) -> Result<()> {
    if sw_if_index != DATA_INTERFACE_SW_IF_INDEX {
        bail!(
            "Created {} interface has wrong swIfIndex {} (expected {})",
            driver,
            sw_if_index,
            DATA_INTERFACE_SW_IF_INDEX
        );
    }
    Ok(())
}

/// Shared restore path: bring the link back up and re-add its configuration.
///
/// Does nothing without a snapshot, or when the link was down before the
/// supervisor touched it.
pub(crate) fn restore_host_link(driver: UplinkDriver, snapshot: Option<HostSnapshot>) {
    let snapshot = match snapshot {
        Some(snapshot) => snapshot,
        None => {
            info!(%driver, "no host snapshot taken, nothing to restore");
            return;
        }
    };
    if !snapshot.is_up {
        info!(%driver, interface = %snapshot.interface, "uplink was down before, leaving it down");
        return;
    }

    let interface = snapshot.interface.as_str();
    if let Err(e) = hostnet::wait_for_link(interface, LINK_RETURN_ATTEMPTS, LINK_RETURN_INTERVAL) {
        warn!(%driver, interface, "cannot restore uplink: {:#}", e);
        return;
    }
    if let Err(e) = hostnet::set_link_up(interface) {
        warn!(%driver, interface, "Error setting uplink up: {:#}", e);
        return;
    }
    if !snapshot.promisc_on {
        info!(%driver, interface, "Setting promisc off");
        if let Err(e) = hostnet::set_promisc(interface, false) {
            error!(%driver, interface, "{:#}", e);
        }
    }
    hostnet::restore_if_conf(&snapshot);
    info!(%driver, interface, "uplink restored to host");
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_snapshot(gateways: Vec<&str>) -> HostSnapshot {
        let routes = gateways
            .into_iter()
            .map(|route| {
                let mut parts = route.split_whitespace();
                let dst = parts.next().unwrap_or_default().to_string();
                let gateway = parts.nth(1).map(str::to_string);
                crate::snapshot::Route {
                    dst,
                    gateway,
                    protocol: None,
                    scope: None,
                    metric: None,
                    ipv6: false,
                }
            })
            .collect();
        HostSnapshot {
            interface: "eth0".to_string(),
            // Down before supervision: restore leaves the host alone
            is_up: false,
            promisc_on: false,
            hardware_addr: Some("52:54:00:12:34:56".to_string()),
            mtu: 1500,
            addresses: vec![],
            routes,
        }
    }

    fn params() -> Arc<UplinkParams> {
        Arc::new(UplinkParams::from(&ManagerConfig {
            interface: "eth0".to_string(),
            ..ManagerConfig::default()
        }))
    }

    #[test]
    fn test_driver_display() {
        assert_eq!(UplinkDriver::AfPacket.to_string(), "af_packet");
        assert_eq!(UplinkDriver::AfXdp.to_string(), "af_xdp");
    }

    #[test]
    fn test_driver_from_cli_value() {
        let driver = UplinkDriver::from_str("af_xdp", false).unwrap();
        assert_eq!(driver, UplinkDriver::AfXdp);
    }

    #[test]
    fn test_new_strategy_driver() {
        assert_eq!(
            new_strategy(UplinkDriver::AfPacket, params()).driver(),
            UplinkDriver::AfPacket
        );
        assert_eq!(
            new_strategy(UplinkDriver::AfXdp, params()).driver(),
            UplinkDriver::AfXdp
        );
    }

    #[test]
    fn test_af_packet_is_last_fallback() {
        let strategies = supported_strategies(params());
        let last = strategies.last().expect("af_packet is always supported");
        assert_eq!(last.driver(), UplinkDriver::AfPacket);
    }

    #[test]
    fn test_explicit_selection() {
        match select(Some(UplinkDriver::AfPacket), params()).unwrap() {
            Selection::Explicit(strategy) => assert_eq!(strategy.driver(), UplinkDriver::AfPacket),
            Selection::Ordered(_) => panic!("expected explicit selection"),
        }
    }

    #[test]
    fn test_check_sw_if_index() {
        assert!(check_sw_if_index(UplinkDriver::AfPacket, DATA_INTERFACE_SW_IF_INDEX).is_ok());
        let err = check_sw_if_index(UplinkDriver::AfPacket, 2).unwrap_err();
        assert!(err.to_string().contains("wrong swIfIndex 2"));
    }

    #[test]
    fn test_baseline_is_kept_once_captured() {
        let params = params();
        let original = sample_snapshot(vec!["default via 10.0.0.1"]);
        assert!(params.set_baseline(original.clone()));
        // A later, damaged view of the link never replaces it
        assert!(!params.set_baseline(sample_snapshot(vec![])));
        assert_eq!(params.baseline().unwrap(), original);
    }

    #[test]
    fn test_restore_without_snapshot_is_noop() {
        restore_host_link(UplinkDriver::AfPacket, None);
    }
}
