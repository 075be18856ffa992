//! Dataplane control client
//!
//! The supervisor only needs a handful of calls from VPP: wait until the
//! control socket answers, and create the uplink interface. [`VppApi`] is
//! the seam; [`VppCtl`] drives the VPP CLI socket through `vppctl`.

use std::io;
use std::path::PathBuf;
use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// Interval between readiness probes
const READY_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum VppApiError {
    #[error("failed to run {binary:?}: {source}")]
    Transport {
        binary: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("VPP rejected `{command}`: {reply}")]
    Rejected { command: String, reply: String },

    #[error("could not find interface {name} in VPP reply")]
    UnknownInterface { name: String },

    #[error("VPP did not answer on its control socket within {0:?}")]
    NotReady(Duration),
}

/// Parameters for an AF_PACKET (host-interface) uplink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AfPacketCreate {
    pub host_if: String,
    pub hw_addr: Option<String>,
    pub num_rx_queues: u32,
    pub num_tx_queues: u32,
}

impl AfPacketCreate {
    /// Name VPP gives the interface.
    pub fn vpp_name(&self) -> String {
        format!("host-{}", self.host_if)
    }

    pub fn to_cli(&self) -> String {
        let mut cmd = format!("create host-interface name {}", self.host_if);
        if let Some(mac) = &self.hw_addr {
            cmd.push_str(&format!(" hw-addr {}", mac));
        }
        cmd.push_str(&format!(
            " num-rx-queues {} num-tx-queues {}",
            self.num_rx_queues, self.num_tx_queues
        ));
        cmd
    }
}

/// Parameters for an AF_XDP uplink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AfXdpCreate {
    pub host_if: String,
    pub num_rx_queues: u32,
    pub rx_ring_size: u32,
    pub tx_ring_size: u32,
}

impl AfXdpCreate {
    pub fn vpp_name(&self) -> String {
        format!("xdp-{}", self.host_if)
    }

    pub fn to_cli(&self) -> String {
        format!(
            "create interface af_xdp host-if {} name {} num-rx-queues {} rx-queue-size {} tx-queue-size {}",
            self.host_if,
            self.vpp_name(),
            self.num_rx_queues,
            self.rx_ring_size,
            self.tx_ring_size
        )
    }
}

/// Calls the supervisor makes into the running dataplane.
pub trait VppApi: Send + Sync {
    /// Block until the control socket answers or `timeout` elapses.
    fn wait_ready(&self, timeout: Duration) -> Result<(), VppApiError>;

    /// Create the AF_PACKET uplink and return its interface index.
    fn create_af_packet(&self, request: &AfPacketCreate) -> Result<u32, VppApiError>;

    /// Create the AF_XDP uplink and return its interface index.
    fn create_af_xdp(&self, request: &AfXdpCreate) -> Result<u32, VppApiError>;
}

/// [`VppApi`] over `vppctl -s <cli socket>`.
pub struct VppCtl {
    binary: PathBuf,
    socket: PathBuf,
}

impl VppCtl {
    pub fn new(binary: PathBuf, socket: PathBuf) -> Self {
        Self { binary, socket }
    }

    /// Run one CLI command and return its checked reply.
    fn exec(&self, command: &str) -> Result<String, VppApiError> {
        debug!(command, "vppctl");
        let output = Command::new(&self.binary)
            .arg("-s")
            .arg(&self.socket)
            .args(command.split_whitespace())
            .output()
            .map_err(|source| VppApiError::Transport {
                binary: self.binary.clone(),
                source,
            })?;

        let mut reply = String::from_utf8_lossy(&output.stdout).into_owned();
        reply.push_str(&String::from_utf8_lossy(&output.stderr));
        if !output.status.success() {
            return Err(VppApiError::Rejected {
                command: command.to_string(),
                reply: reply.trim().to_string(),
            });
        }
        check_reply(command, &reply)
    }

    fn sw_if_index(&self, name: &str) -> Result<u32, VppApiError> {
        let reply = self.exec(&format!("show interface {}", name))?;
        parse_sw_if_index(&reply, name).ok_or_else(|| VppApiError::UnknownInterface {
            name: name.to_string(),
        })
    }
}

impl VppApi for VppCtl {
    fn wait_ready(&self, timeout: Duration) -> Result<(), VppApiError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.exec("show version") {
                Ok(reply) if reply.trim_start().starts_with("vpp") => return Ok(()),
                Ok(_) | Err(VppApiError::Rejected { .. }) => {}
                Err(e) => return Err(e),
            }
            if Instant::now() >= deadline {
                return Err(VppApiError::NotReady(timeout));
            }
            thread::sleep(READY_POLL_INTERVAL);
        }
    }

    fn create_af_packet(&self, request: &AfPacketCreate) -> Result<u32, VppApiError> {
        self.exec(&request.to_cli())?;
        self.sw_if_index(&request.vpp_name())
    }

    fn create_af_xdp(&self, request: &AfXdpCreate) -> Result<u32, VppApiError> {
        self.exec(&request.to_cli())?;
        self.sw_if_index(&request.vpp_name())
    }
}

/// Treat CLI error replies as rejections.
///
/// VPP reports CLI errors on stdout, prefixed with the command path, or as
/// "unknown input".
pub fn check_reply(command: &str, reply: &str) -> Result<String, VppApiError> {
    let verb: Vec<&str> = command.split_whitespace().take(2).collect();
    let error_prefix = format!("{}:", verb.join(" "));
    let rejected = reply.lines().any(|line| {
        let line = line.trim();
        line.starts_with("unknown input") || line.starts_with(&error_prefix)
    });
    if rejected {
        return Err(VppApiError::Rejected {
            command: command.to_string(),
            reply: reply.trim().to_string(),
        });
    }
    Ok(reply.to_string())
}

/// Find the `Idx` column of `name` in a `show interface` table.
pub fn parse_sw_if_index(reply: &str, name: &str) -> Option<u32> {
    reply.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        if fields.next()? != name {
            return None;
        }
        fields.next()?.parse().ok()
    })
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const SHOW_INTERFACE: &str = "\
              Name               Idx    State  MTU (L3/IP4/IP6/MPLS)     Counter          Count
host-eth0                         1      down         9000/0/0/0
local0                            0      down          0/0/0/0
";

    #[test]
    fn test_parse_sw_if_index() {
        assert_eq!(parse_sw_if_index(SHOW_INTERFACE, "host-eth0"), Some(1));
        assert_eq!(parse_sw_if_index(SHOW_INTERFACE, "local0"), Some(0));
        assert_eq!(parse_sw_if_index(SHOW_INTERFACE, "host-eth1"), None);
    }

    #[test]
    fn test_parse_sw_if_index_ignores_header() {
        assert_eq!(parse_sw_if_index(SHOW_INTERFACE, "Name"), None);
    }

    #[test]
    fn test_check_reply_accepts_interface_name() {
        let reply = check_reply("create host-interface name eth0", "host-eth0\n").unwrap();
        assert_eq!(reply.trim(), "host-eth0");
    }

    #[test]
    fn test_check_reply_rejects_command_error() {
        let err = check_reply(
            "create host-interface name eth0",
            "create host-interface: Linux kernel error: No such device\n",
        )
        .unwrap_err();
        assert!(matches!(err, VppApiError::Rejected { .. }));
    }

    #[test]
    fn test_check_reply_rejects_unknown_input() {
        let err = check_reply("show bogus", "unknown input `bogus'\n").unwrap_err();
        assert!(err.to_string().contains("show bogus"));
    }

    #[test]
    fn test_af_packet_cli() {
        let request = AfPacketCreate {
            host_if: "eth0".to_string(),
            hw_addr: Some("02:00:00:00:00:01".to_string()),
            num_rx_queues: 2,
            num_tx_queues: 1,
        };
        assert_eq!(
            request.to_cli(),
            "create host-interface name eth0 hw-addr 02:00:00:00:00:01 num-rx-queues 2 num-tx-queues 1"
        );
        assert_eq!(request.vpp_name(), "host-eth0");
    }

    #[test]
    fn test_af_xdp_cli() {
        let request = AfXdpCreate {
            host_if: "ens5".to_string(),
            num_rx_queues: 4,
            rx_ring_size: 2048,
            tx_ring_size: 1024,
        };
        assert_eq!(
            request.to_cli(),
            "create interface af_xdp host-if ens5 name xdp-ens5 num-rx-queues 4 rx-queue-size 2048 tx-queue-size 1024"
        );
    }

    #[test]
    fn test_missing_vppctl_is_transport_error() {
        let ctl = VppCtl::new(
            PathBuf::from("/nonexistent/vppctl"),
            PathBuf::from("/tmp/cli.sock"),
        );
        let err = ctl.wait_ready(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, VppApiError::Transport { .. }));
    }
}
