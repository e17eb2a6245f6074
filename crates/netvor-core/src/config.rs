//! Settings
//!
//! Loaded from a TOML file; every field has a default so an empty file (or
//! no file at all) gives a working setup.
//!
//! ```toml
//! data_dir = "/var/lib/netvor"
//! engine_binary = "/usr/local/bin/xray"
//! relay_binary = "/usr/local/bin/tun2socks"
//!
//! [interface]
//! name = "netvor0"
//! session_name = "Netvor"
//! address = "10.10.0.2"
//! prefix_len = 32
//! dns = "1.1.1.1"
//! routes = ["0.0.0.0/0"]
//! mtu = 1500
//! exclude_self = true
//!
//! [stats]
//! interval_ms = 1000
//! all_interfaces = false
//! ```

use crate::error::{Error, Result};
use crate::interface::InterfaceSettings;
use crate::stats::InterfaceCounters;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Longest Linux interface name
const MAX_IFNAME_LEN: usize = 15;

/// Top-level settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Profile store root
    pub data_dir: PathBuf,
    /// Proxy engine executable
    pub engine_binary: PathBuf,
    /// Packet relay executable
    pub relay_binary: PathBuf,
    pub interface: InterfaceSettings,
    pub stats: StatsSettings,
}

/// Traffic sampling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsSettings {
    /// Sampling period in milliseconds
    pub interval_ms: u64,
    /// Count every interface instead of only the tunnel
    pub all_interfaces: bool,
}

impl Default for StatsSettings {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            all_interfaces: false,
        }
    }
}

impl StatsSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Counters to sample for a session on `tunnel`
    pub fn counters(&self, tunnel: &str) -> InterfaceCounters {
        if self.all_interfaces {
            InterfaceCounters::all()
        } else {
            InterfaceCounters::for_interface(tunnel)
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            engine_binary: PathBuf::from("/usr/local/bin/xray"),
            relay_binary: PathBuf::from("/usr/local/bin/tun2socks"),
            interface: InterfaceSettings::default(),
            stats: StatsSettings::default(),
        }
    }
}

/// `$XDG_DATA_HOME/netvor`, `~/.local/share/netvor`, or `./netvor-data`
fn default_data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("XDG_DATA_HOME").filter(|d| !d.is_empty()) {
        return PathBuf::from(dir).join("netvor");
    }
    if let Some(home) = std::env::var_os("HOME").filter(|d| !d.is_empty()) {
        return PathBuf::from(home).join(".local/share/netvor");
    }
    PathBuf::from("netvor-data")
}

impl Settings {
    /// Load from TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Settings(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let settings: Settings =
            toml::from_str(content).map_err(|e| Error::Settings(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Export as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Settings(e.to_string()))
    }

    /// Check values the rest of the system relies on
    pub fn validate(&self) -> Result<()> {
        let iface = &self.interface;

        if iface.name.is_empty() || iface.name.len() > MAX_IFNAME_LEN {
            return Err(Error::Settings(format!(
                "interface name must be 1-{} characters",
                MAX_IFNAME_LEN
            )));
        }
        if iface.address.parse::<Ipv4Addr>().is_err() {
            return Err(Error::Settings(format!(
                "interface address '{}' is not an IPv4 address",
                iface.address
            )));
        }
        if iface.prefix_len > 32 {
            return Err(Error::Settings(format!(
                "prefix length {} out of range",
                iface.prefix_len
            )));
        }
        if iface.dns.parse::<IpAddr>().is_err() {
            return Err(Error::Settings(format!(
                "dns '{}' is not an IP address",
                iface.dns
            )));
        }
        if iface.routes.is_empty() {
            return Err(Error::Settings("at least one route is required".into()));
        }
        if !(576..=65535).contains(&iface.mtu) {
            return Err(Error::Settings(format!("mtu {} out of range", iface.mtu)));
        }
        if self.stats.interval_ms == 0 {
            return Err(Error::Settings("stats interval must be positive".into()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let settings = Settings::from_toml("").unwrap();
        assert_eq!(settings.interface, InterfaceSettings::default());
        assert_eq!(settings.stats.interval(), Duration::from_millis(1000));
        assert_eq!(settings.engine_binary, PathBuf::from("/usr/local/bin/xray"));
    }

    #[test]
    fn test_partial_override() {
        let settings = Settings::from_toml(
            r#"
            data_dir = "/tmp/netvor"

            [interface]
            name = "tun7"
            mtu = 1400

            [stats]
            interval_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(settings.data_dir, PathBuf::from("/tmp/netvor"));
        assert_eq!(settings.interface.name, "tun7");
        assert_eq!(settings.interface.mtu, 1400);
        assert_eq!(settings.interface.address, "10.10.0.2");
        assert_eq!(settings.stats.interval_ms, 250);
        assert_eq!(
            settings.stats.counters(&settings.interface.name),
            InterfaceCounters::for_interface("tun7")
        );
    }

    #[test]
    fn test_all_interfaces_counters() {
        let settings = Settings::from_toml("[stats]
all_interfaces = true").unwrap();
        assert_eq!(settings.stats.interval_ms, 1000);
        assert_eq!(
            settings.stats.counters(&settings.interface.name),
            InterfaceCounters::all()
        );
    }

    #[test]
    fn test_toml_roundtrip() {
        let settings = Settings::default();
        let parsed = Settings::from_toml(&settings.to_toml().unwrap()).unwrap();
        assert_eq!(parsed, settings);
    }

    #[test]
    fn test_validation() {
        let bad = [
            "[interface]\nname = \"\"",
            "[interface]\nname = \"much-too-long-name0\"",
            "[interface]\naddress = \"not-an-ip\"",
            "[interface]\nprefix_len = 33",
            "[interface]\ndns = \"dns.example\"",
            "[interface]\nroutes = []",
            "[interface]\nmtu = 100",
            "[stats]\ninterval_ms = 0",
        ];

        for content in bad {
            let err = Settings::from_toml(content).unwrap_err();
            assert!(matches!(err, Error::Settings(_)), "{content}");
        }
    }

    #[test]
    fn test_malformed_toml() {
        assert!(matches!(
            Settings::from_toml("data_dir = ").unwrap_err(),
            Error::Settings(_)
        ));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            Settings::from_toml_file(Path::new("/nonexistent/netvor.toml")).unwrap_err(),
            Error::Settings(_)
        ));
    }
}
