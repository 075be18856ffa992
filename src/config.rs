//! Configuration Loader
//! - CLI argument parsing with clap (each flag also readable from the environment)
//! - Optional TOML file with per-driver tunables
//!
//! CLI values override file values; the merged [`ManagerConfig`] is an
//! immutable snapshot for the whole run.

use crate::error::ManagerError;
use crate::uplink::UplinkDriver;
use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Default seconds between a graceful termination signal and SIGKILL.
pub const DEFAULT_SIGKILL_TIMEOUT_SECS: u64 = 2;

/// Default config file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/vpp-manager/config.toml";

// =============================================================================
// CLI Configuration
// =============================================================================

/// VPP dataplane supervisor
#[derive(Parser, Debug, Default)]
#[command(name = "vpp-manager", version, about = "Supervises the VPP dataplane and its uplink")]
pub struct Cli {
    /// Path to the TOML config file (also: VPP_MANAGER_CONFIG env var)
    #[arg(long, env = "VPP_MANAGER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Uplink interface handed to VPP (also: VPP_MANAGER_INTERFACE env var)
    #[arg(long, short = 'i', env = "VPP_MANAGER_INTERFACE")]
    pub interface: Option<String>,

    /// Use only this uplink driver, with no fallback (also: VPP_MANAGER_NATIVE_DRIVER env var)
    #[arg(long, value_enum, env = "VPP_MANAGER_NATIVE_DRIVER")]
    pub native_driver: Option<UplinkDriver>,

    /// VPP binary to run (also: VPP_MANAGER_VPP_BINARY env var)
    #[arg(long, env = "VPP_MANAGER_VPP_BINARY")]
    pub vpp_binary: Option<PathBuf>,

    /// Seconds to wait before escalating to SIGKILL (also: VPP_MANAGER_SIGKILL_TIMEOUT env var)
    #[arg(long, env = "VPP_MANAGER_SIGKILL_TIMEOUT")]
    pub sigkill_timeout: Option<u64>,

    /// Log filter used when RUST_LOG is unset (also: VPP_MANAGER_LOG_LEVEL env var)
    #[arg(long, env = "VPP_MANAGER_LOG_LEVEL")]
    pub log_level: Option<String>,
}

// =============================================================================
// File Configuration
// =============================================================================

/// `[vpp]` section
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct VppSection {
    pub binary: PathBuf,
    /// Startup config passed as `vpp -c <file>`
    pub config_file: PathBuf,
    pub ctl_binary: PathBuf,
    pub cli_socket: PathBuf,
    /// Seconds to wait for the CLI socket to answer after spawn
    pub ready_timeout_secs: u64,
}

impl Default for VppSection {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("/usr/bin/vpp"),
            config_file: PathBuf::from("/etc/vpp/startup.conf"),
            ctl_binary: PathBuf::from("/usr/bin/vppctl"),
            cli_socket: PathBuf::from("/var/run/vpp/cli.sock"),
            ready_timeout_secs: 10,
        }
    }
}

/// `[af_packet]` section
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AfPacketSection {
    pub num_rx_queues: u32,
    pub num_tx_queues: u32,
}

impl Default for AfPacketSection {
    fn default() -> Self {
        Self {
            num_rx_queues: 1,
            num_tx_queues: 1,
        }
    }
}

/// `[af_xdp]` section
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AfXdpSection {
    pub num_rx_queues: u32,
    pub rx_ring_size: u32,
    pub tx_ring_size: u32,
}

impl Default for AfXdpSection {
    fn default() -> Self {
        Self {
            num_rx_queues: 1,
            rx_ring_size: 1024,
            tx_ring_size: 1024,
        }
    }
}

/// Resolved configuration for one supervisor run.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ManagerConfig {
    pub interface: String,
    pub native_driver: Option<UplinkDriver>,
    pub sigkill_timeout_secs: u64,
    pub log_level: String,
    pub vpp: VppSection,
    pub af_packet: AfPacketSection,
    pub af_xdp: AfXdpSection,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            interface: String::new(),
            native_driver: None,
            sigkill_timeout_secs: DEFAULT_SIGKILL_TIMEOUT_SECS,
            log_level: "info".to_string(),
            vpp: VppSection::default(),
            af_packet: AfPacketSection::default(),
            af_xdp: AfXdpSection::default(),
        }
    }
}

impl ManagerConfig {
    /// Parse a TOML document.
    pub fn from_toml(contents: &str, path: &Path) -> Result<Self, ManagerError> {
        toml::from_str(contents).map_err(|source| ManagerError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Read `path`; a missing file yields the defaults.
    pub fn from_file(path: &Path) -> Result<Self, ManagerError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path).map_err(|source| ManagerError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&contents, path)
    }

    /// Load the file named by the CLI (or the default path) and apply CLI overrides.
    pub fn load(cli: &Cli) -> Result<Self, ManagerError> {
        let path = cli
            .config
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        let mut config = Self::from_file(&path)?;
        config.apply_cli(cli);
        config.validate()?;
        Ok(config)
    }

    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(interface) = &cli.interface {
            self.interface = interface.clone();
        }
        if let Some(driver) = cli.native_driver {
            self.native_driver = Some(driver);
        }
        if let Some(binary) = &cli.vpp_binary {
            self.vpp.binary = binary.clone();
        }
        if let Some(secs) = cli.sigkill_timeout {
            self.sigkill_timeout_secs = secs;
        }
        if let Some(level) = &cli.log_level {
            self.log_level = level.clone();
        }
    }

    pub fn validate(&self) -> Result<(), ManagerError> {
        if self.interface.trim().is_empty() {
            return Err(ManagerError::InvalidConfig(
                "an uplink interface is required".to_string(),
            ));
        }
        if self.sigkill_timeout_secs == 0 {
            return Err(ManagerError::InvalidConfig(
                "sigkill_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.vpp.ready_timeout_secs == 0 {
            return Err(ManagerError::InvalidConfig(
                "vpp.ready_timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn sigkill_timeout(&self) -> Duration {
        Duration::from_secs(self.sigkill_timeout_secs)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.vpp.ready_timeout_secs)
    }

    /// Log the resolved configuration once at startup.
    pub fn log_summary(&self) {
        let driver = self
            .native_driver
            .map(|d| d.to_string())
            .unwrap_or_else(|| "auto".to_string());
        info!(
            interface = %self.interface,
            native_driver = %driver,
            sigkill_timeout_secs = self.sigkill_timeout_secs,
            vpp_binary = %self.vpp.binary.display(),
            vpp_config = %self.vpp.config_file.display(),
            "vpp-manager configuration"
        );
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn path() -> PathBuf {
        PathBuf::from("test.toml")
    }

    #[test]
    fn test_parse_empty_config() {
        let config = ManagerConfig::from_toml("", &path()).unwrap();
        assert_eq!(config, ManagerConfig::default());
        assert_eq!(config.sigkill_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_parse_full_config() {
        let toml_content = r#"
interface = "eth1"
native_driver = "af_packet"
sigkill_timeout_secs = 5

[vpp]
binary = "/opt/vpp/bin/vpp"
ready_timeout_secs = 3

[af_xdp]
num_rx_queues = 4
rx_ring_size = 2048
"#;
        let config = ManagerConfig::from_toml(toml_content, &path()).unwrap();
        assert_eq!(config.interface, "eth1");
        assert_eq!(config.native_driver, Some(UplinkDriver::AfPacket));
        assert_eq!(config.sigkill_timeout_secs, 5);
        assert_eq!(config.vpp.binary, PathBuf::from("/opt/vpp/bin/vpp"));
        assert_eq!(config.vpp.cli_socket, VppSection::default().cli_socket);
        assert_eq!(config.af_xdp.num_rx_queues, 4);
        assert_eq!(config.af_xdp.rx_ring_size, 2048);
        assert_eq!(config.af_xdp.tx_ring_size, 1024);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = ManagerConfig::from_toml("interfce = \"eth0\"", &path()).unwrap_err();
        assert!(matches!(err, ManagerError::ConfigParse { .. }));
    }

    #[test]
    fn test_unknown_driver_rejected() {
        let err = ManagerConfig::from_toml("native_driver = \"dpdk\"", &path()).unwrap_err();
        assert!(matches!(err, ManagerError::ConfigParse { .. }));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = ManagerConfig::from_file(&temp_dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, ManagerConfig::default());
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut config =
            ManagerConfig::from_toml("interface = \"eth0\"\nsigkill_timeout_secs = 9", &path())
                .unwrap();
        let cli = Cli {
            interface: Some("ens5".to_string()),
            sigkill_timeout: Some(1),
            native_driver: Some(UplinkDriver::AfXdp),
            ..Cli::default()
        };
        config.apply_cli(&cli);
        assert_eq!(config.interface, "ens5");
        assert_eq!(config.sigkill_timeout_secs, 1);
        assert_eq!(config.native_driver, Some(UplinkDriver::AfXdp));
    }

    #[test]
    fn test_validate_requires_interface() {
        let err = ManagerConfig::default().validate().unwrap_err();
        assert!(err.to_string().contains("interface"));
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let config = ManagerConfig {
            interface: "eth0".to_string(),
            sigkill_timeout_secs: 0,
            ..ManagerConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
