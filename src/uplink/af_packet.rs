//! AF_PACKET uplink: VPP reads the interface through a packet socket.
//!
//! Slow but works with any kernel driver, so it is the last resort.

use super::{check_sw_if_index, restore_host_link, UplinkDriver, UplinkParams, UplinkStrategy};
use crate::hostnet;
use crate::snapshot::HostSnapshot;
use crate::vppapi::{AfPacketCreate, VppApi};
use anyhow::{Context, Result};
use nix::unistd::Pid;
use std::sync::Arc;
use tracing::info;

pub struct AfPacketStrategy {
    params: Arc<UplinkParams>,
    snapshot: Option<HostSnapshot>,
}

impl AfPacketStrategy {
    pub fn new(params: Arc<UplinkParams>) -> Self {
        Self {
            params,
            snapshot: None,
        }
    }

    /// Take the run's shared baseline as this generation's snapshot.
    pub(super) fn load_snapshot(&mut self) -> Result<&HostSnapshot> {
        let snapshot = self.params.baseline()?;
        Ok(&*self.snapshot.insert(snapshot))
    }

    fn request(&self) -> AfPacketCreate {
        AfPacketCreate {
            host_if: self.params.interface.clone(),
            hw_addr: self
                .snapshot
                .as_ref()
                .and_then(|s| s.hardware_addr.clone()),
            num_rx_queues: self.params.af_packet.num_rx_queues,
            num_tx_queues: self.params.af_packet.num_tx_queues,
        }
    }
}

impl UplinkStrategy for AfPacketStrategy {
    fn driver(&self) -> UplinkDriver {
        UplinkDriver::AfPacket
    }

    fn is_supported(&self, _warn: bool) -> bool {
        true
    }

    fn preconfigure_linux(&mut self) -> Result<()> {
        self.load_snapshot()?;
        let interface = self.params.interface.as_str();
        hostnet::set_promisc(interface, true)?;
        hostnet::remove_if_conf(interface, false)?;
        Ok(())
    }

    fn create_main_vpp_interface(&mut self, vpp: &dyn VppApi, pid: Pid) -> Result<()> {
        let interface = self.params.interface.as_str();
        hostnet::move_to_netns(interface, pid)?;
        hostnet::set_link_up_in_netns(interface, pid)?;

        let sw_if_index = vpp
            .create_af_packet(&self.request())
            .context("Error creating AF_PACKET interface")?;
        info!(sw_if_index, "Created AF_PACKET interface");

        check_sw_if_index(self.driver(), sw_if_index)
    }

    fn restore_linux(&mut self) {
        restore_host_link(self.driver(), self.snapshot.take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AfPacketSection;
    use crate::uplink::AfXdpStrategy;

    fn strategy() -> AfPacketStrategy {
        AfPacketStrategy::new(Arc::new(UplinkParams::new(
            "eth0".to_string(),
            AfPacketSection {
                num_rx_queues: 2,
                num_tx_queues: 2,
            },
            Default::default(),
        )))
    }

    #[test]
    fn test_always_supported() {
        assert!(strategy().is_supported(true));
    }

    #[test]
    fn test_request_without_snapshot_has_no_mac() {
        let request = strategy().request();
        assert_eq!(request.host_if, "eth0");
        assert!(request.hw_addr.is_none());
        assert_eq!(request.num_rx_queues, 2);
    }

    #[test]
    fn test_request_reuses_snapshot_mac() {
        let mut strategy = strategy();
        strategy.snapshot = Some(HostSnapshot {
            interface: "eth0".to_string(),
            is_up: true,
            promisc_on: false,
            hardware_addr: Some("52:54:00:12:34:56".to_string()),
            mtu: 1500,
            addresses: vec![],
            routes: vec![],
        });
        assert_eq!(
            strategy.request().hw_addr.as_deref(),
            Some("52:54:00:12:34:56")
        );
    }

    #[test]
    fn test_next_strategy_restores_original_snapshot() {
        let mut af_packet = strategy();
        let params = Arc::clone(&af_packet.params);
        let original = HostSnapshot {
            interface: "eth0".to_string(),
            is_up: false,
            promisc_on: false,
            hardware_addr: Some("52:54:00:12:34:56".to_string()),
            mtu: 1500,
            addresses: vec![],
            routes: vec![crate::snapshot::Route {
                dst: "default".to_string(),
                gateway: Some("10.0.0.1".to_string()),
                protocol: None,
                scope: None,
                metric: None,
                ipv6: false,
            }],
        };
        assert!(params.set_baseline(original.clone()));

        // First generation takes and gives back the link
        let mut af_xdp = AfXdpStrategy::new(Arc::clone(&params));
        assert_eq!(af_xdp.load_snapshot().unwrap(), &original);
        af_xdp.restore_linux();

        // Second generation must see the operator's state, not what is left
        assert_eq!(af_packet.load_snapshot().unwrap(), &original);
        assert_eq!(af_packet.request().hw_addr.as_deref(), Some("52:54:00:12:34:56"));
    }

    #[test]
    fn test_restore_consumes_snapshot() {
        let mut strategy = strategy();
        strategy.snapshot = Some(HostSnapshot {
            interface: "eth0".to_string(),
            // Down before supervision: restore leaves the host alone
            is_up: false,
            promisc_on: false,
            hardware_addr: None,
            mtu: 1500,
            addresses: vec![],
            routes: vec![],
        });
        strategy.restore_linux();
        assert!(strategy.snapshot.is_none());
    }
}
