//! Host-side link operations
//!
//! Thin wrappers around iproute2. Operations that must happen inside the
//! dataplane's network namespace run on a short-lived thread that joins the
//! namespace with `setns` before invoking `ip`.

use crate::snapshot::HostSnapshot;
use anyhow::{anyhow, bail, Context, Result};
use nix::sched::{setns, CloneFlags};
use nix::unistd::Pid;
use std::fs::File;
use std::process::Command;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

/// Run `ip <args>` and return its stdout.
pub fn ip<S: AsRef<str>>(args: &[S]) -> Result<String> {
    let args: Vec<&str> = args.iter().map(|a| a.as_ref()).collect();
    let output = Command::new("ip")
        .args(&args)
        .output()
        .context("Failed to execute 'ip' command - is iproute2 installed?")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("'ip {}' failed: {}", args.join(" "), stderr.trim());
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

pub fn set_promisc(interface: &str, on: bool) -> Result<()> {
    let mode = if on { "on" } else { "off" };
    ip(&["link", "set", "dev", interface, "promisc", mode])
        .with_context(|| format!("Error set link {} promisc {}", interface, mode))?;
    Ok(())
}

pub fn set_link_up(interface: &str) -> Result<()> {
    ip(&["link", "set", "dev", interface, "up"])?;
    Ok(())
}

pub fn set_link_down(interface: &str) -> Result<()> {
    ip(&["link", "set", "dev", interface, "down"])?;
    Ok(())
}

/// Strip addresses and routes from the uplink so the host stops using it.
pub fn remove_if_conf(interface: &str, down: bool) -> Result<()> {
    ip(&["addr", "flush", "dev", interface])
        .with_context(|| format!("Error flushing addresses of {}", interface))?;
    ip(&["-4", "route", "flush", "dev", interface])?;
    ip(&["-6", "route", "flush", "dev", interface])?;
    if down {
        set_link_down(interface)?;
    }
    Ok(())
}

/// Re-add the snapshot's addresses and routes. Failures are logged.
pub fn restore_if_conf(snapshot: &HostSnapshot) {
    let interface = snapshot.interface.as_str();
    for address in snapshot.restorable_addresses() {
        let cidr = address.cidr();
        if let Err(e) = ip(&["addr", "replace", cidr.as_str(), "dev", interface]) {
            warn!(interface, address = %cidr, "cannot restore address: {:#}", e);
        }
    }
    for route in snapshot.restorable_routes() {
        if let Err(e) = ip(route.replace_args(interface).as_slice()) {
            warn!(interface, dst = %route.dst, "cannot restore route: {:#}", e);
        }
    }
}

/// Wait for `interface` to be visible in this namespace.
///
/// After the dataplane exits, a link that was moved into its namespace
/// pops back into the host namespace asynchronously.
pub fn wait_for_link(interface: &str, attempts: u32, interval: Duration) -> Result<()> {
    for attempt in 1..=attempts {
        if ip(&["link", "show", "dev", interface]).is_ok() {
            return Ok(());
        }
        if attempt < attempts {
            thread::sleep(interval);
        }
    }
    bail!("link {} did not reappear after {} attempts", interface, attempts)
}

/// Move `interface` into the network namespace of `pid`.
pub fn move_to_netns(interface: &str, pid: Pid) -> Result<()> {
    let pid = pid.to_string();
    ip(&["link", "set", "dev", interface, "netns", pid.as_str()])
        .context("cannot move uplink to vpp netns")?;
    Ok(())
}

/// Bring `interface` up inside the network namespace of `pid`.
pub fn set_link_up_in_netns(interface: &str, pid: Pid) -> Result<()> {
    let ns_path = format!("/proc/{}/ns/net", pid);
    let interface = interface.to_string();

    let worker = thread::Builder::new()
        .name("netns-link".into())
        .spawn(move || -> Result<()> {
            let ns = File::open(&ns_path).with_context(|| format!("cannot open {}", ns_path))?;
            // Only this thread changes namespace; it exits right after.
            setns(&ns, CloneFlags::CLONE_NEWNET)
                .context("setns(CLONE_NEWNET) failed - requires CAP_SYS_ADMIN")?;
            set_link_up(&interface)
        })?;

    worker
        .join()
        .map_err(|_| anyhow!("netns worker panicked"))?
        .context("cannot set uplink up in vpp ns")?;
    info!(pid = %pid, "uplink is up in the dataplane namespace");
    Ok(())
}
