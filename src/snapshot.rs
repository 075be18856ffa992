//! Host Network Snapshot
//!
//! State of the uplink before the supervisor touches it, read from
//! `ip -j` (iproute2 JSON output). Taken by a strategy's preconfigure step
//! and consumed by the same strategy's restore step.

use crate::hostnet;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// One address assigned to the uplink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub family: String,
    pub local: String,
    pub prefixlen: u8,
    #[serde(default)]
    pub scope: Option<String>,
}

impl Address {
    pub fn cidr(&self) -> String {
        format!("{}/{}", self.local, self.prefixlen)
    }

    /// Link-local addresses come back on their own when the link goes up.
    pub fn is_link_local(&self) -> bool {
        self.scope.as_deref() == Some("link")
    }
}

/// One route through the uplink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub dst: String,
    #[serde(default)]
    pub gateway: Option<String>,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub metric: Option<u32>,
    #[serde(default)]
    pub ipv6: bool,
}

impl Route {
    /// Kernel routes are recreated with their address.
    pub fn is_kernel(&self) -> bool {
        self.protocol.as_deref() == Some("kernel")
    }

    /// Arguments for `ip route replace`.
    pub fn replace_args(&self, interface: &str) -> Vec<String> {
        let mut args = Vec::new();
        if self.ipv6 {
            args.push("-6".to_string());
        }
        args.extend(["route", "replace", self.dst.as_str()].map(String::from));
        if let Some(gateway) = &self.gateway {
            args.extend(["via".to_string(), gateway.clone()]);
        }
        args.extend(["dev".to_string(), interface.to_string()]);
        if let Some(metric) = self.metric {
            args.extend(["metric".to_string(), metric.to_string()]);
        }
        args
    }
}

#[derive(Deserialize)]
struct LinkJson {
    #[serde(default)]
    flags: Vec<String>,
    #[serde(default)]
    mtu: u32,
    #[serde(default)]
    address: Option<String>,
}

#[derive(Deserialize)]
struct AddrJson {
    #[serde(default)]
    addr_info: Vec<Address>,
}

/// Captured state of the uplink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSnapshot {
    pub interface: String,
    pub is_up: bool,
    pub promisc_on: bool,
    pub hardware_addr: Option<String>,
    pub mtu: u32,
    pub addresses: Vec<Address>,
    pub routes: Vec<Route>,
}

impl HostSnapshot {
    /// Read the current state of `interface`.
    pub fn capture(interface: &str) -> Result<Self> {
        let link = hostnet::ip(&["-j", "link", "show", "dev", interface])?;
        let addrs = hostnet::ip(&["-j", "addr", "show", "dev", interface])?;
        let routes4 = hostnet::ip(&["-j", "-4", "route", "show", "dev", interface])?;
        let routes6 = hostnet::ip(&["-j", "-6", "route", "show", "dev", interface])?;
        Self::from_ip_json(interface, &link, &addrs, &routes4, &routes6)
            .with_context(|| format!("Error reading configuration of {}", interface))
    }

    /// Build a snapshot from the raw `ip -j` replies.
    pub fn from_ip_json(
        interface: &str,
        link: &str,
        addrs: &str,
        routes4: &str,
        routes6: &str,
    ) -> Result<Self> {
        let links: Vec<LinkJson> = serde_json::from_str(link).context("bad link JSON")?;
        let link = links
            .into_iter()
            .next()
            .with_context(|| format!("link {} not found", interface))?;

        let addresses = serde_json::from_str::<Vec<AddrJson>>(addrs)
            .context("bad address JSON")?
            .into_iter()
            .flat_map(|a| a.addr_info)
            .collect();

        let mut routes: Vec<Route> = parse_routes(routes4, false)?;
        routes.extend(parse_routes(routes6, true)?);

        Ok(Self {
            interface: interface.to_string(),
            is_up: link.flags.iter().any(|f| f == "UP"),
            promisc_on: link.flags.iter().any(|f| f == "PROMISC"),
            hardware_addr: link.address,
            mtu: link.mtu,
            addresses,
            routes,
        })
    }

    /// Addresses to re-add on restore.
    pub fn restorable_addresses(&self) -> impl Iterator<Item = &Address> {
        self.addresses.iter().filter(|a| !a.is_link_local())
    }

    /// Routes to re-add on restore.
    pub fn restorable_routes(&self) -> impl Iterator<Item = &Route> {
        self.routes.iter().filter(|r| !r.is_kernel())
    }
}

fn parse_routes(json: &str, ipv6: bool) -> Result<Vec<Route>> {
    // `ip -j route` prints nothing at all for an empty table on some versions
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    let mut routes: Vec<Route> = serde_json::from_str(json).context("bad route JSON")?;
    for route in &mut routes {
        route.ipv6 = ipv6;
    }
    Ok(routes)
}

// =============================================================================
// Unit Tests
// =============================================================================
