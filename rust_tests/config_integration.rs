//! Configuration Integration Tests
//!
//! TOML file plus CLI override precedence, and the binary's behaviour on a
//! configuration it cannot run with.

use clap::Parser;
use std::fs;
use std::process::{Command, Stdio};
use std::time::Duration;
use tempfile::TempDir;
use vpp_manager::config::{Cli, ManagerConfig};
use vpp_manager::error::ManagerError;
use vpp_manager::uplink::UplinkDriver;
use wait_timeout::ChildExt;

const SAMPLE: &str = r#"
interface = "eth1"
sigkill_timeout_secs = 5
log_level = "debug"

[vpp]
binary = "/opt/vpp/bin/vpp"
config_file = "/opt/vpp/startup.conf"

[af_xdp]
num_rx_queues = 4
rx_ring_size = 2048
"#;

fn write_config(dir: &TempDir, contents: &str) -> String {
    let path = dir.path().join("config.toml");
    fs::write(&path, contents).unwrap();
    path.to_string_lossy().into_owned()
}

#[test]
fn test_file_values_are_loaded() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, SAMPLE);
    let cli = Cli::try_parse_from(["vpp-manager", "--config", &path]).unwrap();

    let config = ManagerConfig::load(&cli).unwrap();

    assert_eq!(config.interface, "eth1");
    assert_eq!(config.sigkill_timeout(), Duration::from_secs(5));
    assert_eq!(config.log_level, "debug");
    assert_eq!(config.vpp.binary.to_str(), Some("/opt/vpp/bin/vpp"));
    assert_eq!(config.af_xdp.num_rx_queues, 4);
    assert_eq!(config.af_xdp.rx_ring_size, 2048);
    // Unset keys keep their defaults
    assert_eq!(config.af_xdp.tx_ring_size, 1024);
    assert_eq!(config.af_packet.num_rx_queues, 1);
    assert_eq!(config.native_driver, None);
}

#[test]
fn test_cli_overrides_file() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, SAMPLE);
    let cli = Cli::try_parse_from([
        "vpp-manager",
        "--config",
        &path,
        "-i",
        "ens3",
        "--native-driver",
        "af_packet",
        "--sigkill-timeout",
        "9",
        "--vpp-binary",
        "/usr/local/bin/vpp",
    ])
    .unwrap();

    let config = ManagerConfig::load(&cli).unwrap();

    assert_eq!(config.interface, "ens3");
    assert_eq!(config.native_driver, Some(UplinkDriver::AfPacket));
    assert_eq!(config.sigkill_timeout_secs, 9);
    assert_eq!(config.vpp.binary.to_str(), Some("/usr/local/bin/vpp"));
    // Not overridden
    assert_eq!(config.log_level, "debug");
}

#[test]
fn test_missing_file_uses_defaults() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("absent.toml");
    let cli = Cli::try_parse_from([
        "vpp-manager",
        "--config",
        path.to_str().unwrap(),
        "--interface",
        "eth0",
    ])
    .unwrap();

    let config = ManagerConfig::load(&cli).unwrap();

    assert_eq!(config.interface, "eth0");
    assert_eq!(config.sigkill_timeout(), Duration::from_secs(2));
    assert_eq!(config.vpp.config_file.to_str(), Some("/etc/vpp/startup.conf"));
}

#[test]
fn test_unknown_key_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "interface = \"eth0\"\nuplink_mtu = 9000\n");
    let cli = Cli::try_parse_from(["vpp-manager", "--config", &path]).unwrap();

    let err = ManagerConfig::load(&cli).unwrap_err();
    assert!(matches!(err, ManagerError::ConfigParse { .. }));
}

#[test]
fn test_zero_sigkill_timeout_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "interface = \"eth0\"\n");
    let cli = Cli::try_parse_from([
        "vpp-manager",
        "--config",
        &path,
        "--sigkill-timeout",
        "0",
    ])
    .unwrap();

    let err = ManagerConfig::load(&cli).unwrap_err();
    assert!(matches!(err, ManagerError::InvalidConfig(_)));
}

#[test]
fn test_unknown_driver_name_is_a_usage_error() {
    let result = Cli::try_parse_from(["vpp-manager", "--native-driver", "dpdk"]);
    assert!(result.is_err());
}

#[test]
fn test_binary_refuses_to_run_without_interface() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("absent.toml");

    let mut child = Command::new(env!("CARGO_BIN_EXE_vpp-manager"))
        .arg("--config")
        .arg(&path)
        .env_remove("VPP_MANAGER_INTERFACE")
        .env_remove("VPP_MANAGER_NATIVE_DRIVER")
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();

    let status = match child.wait_timeout(Duration::from_secs(10)).unwrap() {
        Some(status) => status,
        None => {
            child.kill().unwrap();
            panic!("vpp-manager did not exit on an invalid configuration");
        }
    };
    assert!(!status.success());

    let output = child.wait_with_output().unwrap();
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("uplink interface is required"),
        "unexpected stderr: {}",
        stderr
    );
}
