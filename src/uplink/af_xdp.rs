//! AF_XDP uplink: VPP shares UMEM rings with the kernel driver.
//!
//! Needs kernel 5.4+ and an MTU that fits in one XDP frame.

use super::{check_sw_if_index, restore_host_link, UplinkDriver, UplinkParams, UplinkStrategy};
use crate::hostnet;
use crate::snapshot::HostSnapshot;
use crate::vppapi::{AfXdpCreate, VppApi};
use anyhow::{bail, Context, Result};
use nix::sys::utsname::uname;
use nix::unistd::Pid;
use std::sync::Arc;
use tracing::{info, warn};

/// Largest MTU an XDP frame can carry.
pub const MAX_AF_XDP_MTU: u32 = 3072;

/// Oldest kernel with usable AF_XDP.
const MIN_KERNEL: (u32, u32) = (5, 4);

pub struct AfXdpStrategy {
    params: Arc<UplinkParams>,
    snapshot: Option<HostSnapshot>,
}

impl AfXdpStrategy {
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

    fn request(&self) -> AfXdpCreate {
        AfXdpCreate {
            host_if: self.params.interface.clone(),
            num_rx_queues: self.params.af_xdp.num_rx_queues,
            rx_ring_size: self.params.af_xdp.rx_ring_size,
            tx_ring_size: self.params.af_xdp.tx_ring_size,
        }
    }
}

/// Parse "major.minor" from a kernel release string such as `5.15.0-91-generic`.
pub fn kernel_version(release: &str) -> Option<(u32, u32)> {
    let mut parts = release.split(|c: char| !c.is_ascii_digit());
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

pub fn kernel_supports_af_xdp(release: &str) -> bool {
    kernel_version(release).is_some_and(|version| version >= MIN_KERNEL)
}

impl UplinkStrategy for AfXdpStrategy {
    fn driver(&self) -> UplinkDriver {
        UplinkDriver::AfXdp
    }

    fn is_supported(&self, warn: bool) -> bool {
        let release = uname()
            .map(|u| u.release().to_string_lossy().into_owned())
            .unwrap_or_default();
        if !kernel_supports_af_xdp(&release) {
            if warn {
                warn!(kernel = %release, "AF_XDP needs kernel 5.4 or newer");
            }
            return false;
        }

        match self.params.baseline() {
            Ok(snapshot) if snapshot.mtu > MAX_AF_XDP_MTU => {
                if warn {
                    warn!(mtu = snapshot.mtu, "AF_XDP supports an MTU of at most {}", MAX_AF_XDP_MTU);
                }
                false
            }
            Ok(_) => true,
            Err(e) => {
                if warn {
                    warn!("cannot inspect uplink for AF_XDP: {:#}", e);
                }
                false
            }
        }
    }

    fn preconfigure_linux(&mut self) -> Result<()> {
        let mtu = self.load_snapshot()?.mtu;
        let interface = self.params.interface.as_str();
        if mtu > MAX_AF_XDP_MTU {
            bail!("MTU {} of {} is too large for AF_XDP", mtu, interface);
        }
        hostnet::remove_if_conf(interface, true)?;
        Ok(())
    }

    fn create_main_vpp_interface(&mut self, vpp: &dyn VppApi, pid: Pid) -> Result<()> {
        let interface = self.params.interface.as_str();
        hostnet::move_to_netns(interface, pid)?;
        hostnet::set_link_up_in_netns(interface, pid)?;

        let sw_if_index = vpp
            .create_af_xdp(&self.request())
            .context("Error creating AF_XDP interface")?;
        info!(sw_if_index, "Created AF_XDP interface");

        check_sw_if_index(self.driver(), sw_if_index)
    }

    fn restore_linux(&mut self) {
        restore_host_link(self.driver(), self.snapshot.take());
    }
}
