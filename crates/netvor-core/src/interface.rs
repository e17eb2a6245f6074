//! Virtual network interface
//!
//! The relay reads and writes raw IP packets on a file descriptor handed to
//! it at launch. Where that descriptor comes from is platform business:
//!
//! - [`FdInterfaceProvider`] wraps a descriptor a platform layer already
//!   established (e.g. a mobile VPN service)
//! - [`LinuxTunProvider`] creates a TUN device itself and routes the host's
//!   traffic into it with `ip`

use serde::{Deserialize, Serialize};
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use tracing::{debug, info, warn};

/// Interface parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterfaceSettings {
    /// Device name (Linux TUN only)
    pub name: String,
    /// Session label shown by the platform
    pub session_name: String,
    /// Interface address
    pub address: String,
    /// Prefix length of `address`
    pub prefix_len: u8,
    /// DNS server pushed to the interface
    pub dns: String,
    /// Routes sent through the interface
    pub routes: Vec<String>,
    /// MTU, also passed to the relay
    pub mtu: u32,
    /// Keep this process (and its children) off the tunnel
    pub exclude_self: bool,
}

impl Default for InterfaceSettings {
    fn default() -> Self {
        Self {
            name: "netvor0".to_string(),
            session_name: "Netvor".to_string(),
            address: "10.10.0.2".to_string(),
            prefix_len: 32,
            dns: "1.1.1.1".to_string(),
            routes: vec!["0.0.0.0/0".to_string()],
            mtu: 1500,
            exclude_self: true,
        }
    }
}

impl InterfaceSettings {
    /// `address/prefix_len`
    pub fn cidr(&self) -> String {
        format!("{}/{}", self.address, self.prefix_len)
    }
}

/// An established interface
pub trait InterfaceHandle: Send + Sync {
    /// Descriptor the relay is handed
    fn raw_fd(&self) -> RawFd;

    /// Interface name, for logs
    fn name(&self) -> &str;

    /// Release the descriptor and undo any host configuration.
    ///
    /// Safe to call more than once.
    fn close(&mut self);
}

/// Establishes interfaces
pub trait InterfaceProvider: Send + Sync {
    fn establish(&self, settings: &InterfaceSettings) -> io::Result<Box<dyn InterfaceHandle>>;
}

/// Descriptor-backed handle; closing drops the descriptor
pub struct FdInterface {
    name: String,
    fd: Option<OwnedFd>,
}

impl FdInterface {
    pub fn new(name: impl Into<String>, fd: OwnedFd) -> Self {
        Self {
            name: name.into(),
            fd: Some(fd),
        }
    }

    pub fn is_open(&self) -> bool {
        self.fd.is_some()
    }
}

impl InterfaceHandle for FdInterface {
    fn raw_fd(&self) -> RawFd {
        self.fd.as_ref().map(|fd| fd.as_raw_fd()).unwrap_or(-1)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn close(&mut self) {
        if self.fd.take().is_some() {
            debug!("Closed interface descriptor for {}", self.name);
        }
    }
}

/// Hands out duplicates of a descriptor established elsewhere
pub struct FdInterfaceProvider {
    fd: OwnedFd,
}

impl FdInterfaceProvider {
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }
}

impl InterfaceProvider for FdInterfaceProvider {
    fn establish(&self, settings: &InterfaceSettings) -> io::Result<Box<dyn InterfaceHandle>> {
        let fd = self.fd.try_clone()?;
        Ok(Box::new(FdInterface::new(settings.session_name.clone(), fd)))
    }
}

/// Routing table holding the tunnel routes
pub const ROUTE_TABLE: u32 = 1010;

/// `ip rule` priority keeping this process on the main table
pub const BYPASS_RULE_PRIORITY: u32 = 9000;

/// `ip rule` priority sending everything else to [`ROUTE_TABLE`]
pub const TUNNEL_RULE_PRIORITY: u32 = 9001;

/// Creates a TUN device and routes traffic into it
#[derive(Debug, Clone, Default)]
pub struct LinuxTunProvider;

impl LinuxTunProvider {
    pub fn new() -> Self {
        Self
    }
}

/// `ip` invocations that configure the device, each paired with its undo
fn setup_plan(settings: &InterfaceSettings, uid: u32) -> Vec<(Vec<String>, Vec<String>)> {
    let args = |s: &[&str]| s.iter().map(|a| a.to_string()).collect::<Vec<_>>();
    let name = settings.name.as_str();
    let table = ROUTE_TABLE.to_string();
    let table = table.as_str();
    let mtu = settings.mtu.to_string();
    let cidr = settings.cidr();
    let cidr = cidr.as_str();

    let mut plan = vec![
        (
            args(&["addr", "add", cidr, "dev", name]),
            args(&["addr", "del", cidr, "dev", name]),
        ),
        (
            args(&["link", "set", "dev", name, "mtu", mtu.as_str(), "up"]),
            args(&["link", "set", "dev", name, "down"]),
        ),
    ];

    for route in &settings.routes {
        let route = route.as_str();
        plan.push((
            args(&["route", "add", route, "dev", name, "table", table]),
            args(&["route", "del", route, "dev", name, "table", table]),
        ));
    }

    if settings.exclude_self {
        let uidrange = format!("{}-{}", uid, uid);
        let priority = BYPASS_RULE_PRIORITY.to_string();
        plan.push((
            args(&[
                "rule",
                "add",
                "uidrange",
                uidrange.as_str(),
                "lookup",
                "main",
                "priority",
                priority.as_str(),
            ]),
            args(&["rule", "del", "priority", priority.as_str()]),
        ));
    }

    let priority = TUNNEL_RULE_PRIORITY.to_string();
    plan.push((
        args(&["rule", "add", "lookup", table, "priority", priority.as_str()]),
        args(&["rule", "del", "priority", priority.as_str()]),
    ));

    plan
}

fn run_ip(args: &[String]) -> io::Result<()> {
    debug!("ip {}", args.join(" "));

    let output = std::process::Command::new("ip").args(args).output()?;
    if !output.status.success() {
        return Err(io::Error::other(format!(
            "ip {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// TUN device plus the host configuration applied for it
pub struct LinuxTun {
    device: FdInterface,
    undo: Vec<Vec<String>>,
}

impl LinuxTun {
    fn teardown(&mut self) {
        // Reverse order; the device itself goes away with its descriptor.
        while let Some(args) = self.undo.pop() {
            if let Err(e) = run_ip(&args) {
                debug!("Teardown step skipped: {}", e);
            }
        }
    }
}

impl InterfaceHandle for LinuxTun {
    fn raw_fd(&self) -> RawFd {
        self.device.raw_fd()
    }

    fn name(&self) -> &str {
        self.device.name()
    }

    fn close(&mut self) {
        if !self.device.is_open() {
            return;
        }
        self.teardown();
        self.device.close();
        info!("TUN interface {} closed", self.device.name());
    }
}

impl Drop for LinuxTun {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(target_os = "linux")]
mod tun {
    use std::ffi::CString;
    use std::fs::OpenOptions;
    use std::io;
    use std::os::fd::{AsRawFd, OwnedFd};

    /// `_IOW('T', 202, int)`
    const TUNSETIFF: u64 = 0x4004_54ca;

    /// Open `/dev/net/tun` and attach a layer-3 device named `name`
    pub fn open(name: &str) -> io::Result<OwnedFd> {
        let c_name = CString::new(name)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid interface name"))?;
        let name_bytes = c_name.as_bytes_with_nul();
        if name_bytes.len() > libc::IFNAMSIZ {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("interface name '{}' too long", name),
            ));
        }

        let file = OpenOptions::new().read(true).write(true).open("/dev/net/tun")?;

        // SAFETY: ifreq is plain old data; zeroed is a valid value
        let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
        for (dst, src) in ifr.ifr_name.iter_mut().zip(name_bytes) {
            *dst = *src as libc::c_char;
        }
        ifr.ifr_ifru.ifru_flags = (libc::IFF_TUN | libc::IFF_NO_PI) as libc::c_short;

        // SAFETY: the fd is open and ifr outlives the call
        let result = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &mut ifr) };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(file.into())
    }
}

#[cfg(not(target_os = "linux"))]
mod tun {
    use std::io;
    use std::os::fd::OwnedFd;

    pub fn open(_name: &str) -> io::Result<OwnedFd> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "TUN devices are only supported on Linux",
        ))
    }
}

impl InterfaceProvider for LinuxTunProvider {
    fn establish(&self, settings: &InterfaceSettings) -> io::Result<Box<dyn InterfaceHandle>> {
        let fd = tun::open(&settings.name)?;
        let mut handle = LinuxTun {
            device: FdInterface::new(settings.name.clone(), fd),
            undo: Vec::new(),
        };

        // SAFETY: getuid has no preconditions
        let uid = unsafe { libc::getuid() };

        for (apply, undo) in setup_plan(settings, uid) {
            // On error the handle drops and undoes what was applied.
            run_ip(&apply)?;
            handle.undo.push(undo);
        }

        if let Err(e) = std::process::Command::new("resolvectl")
            .args(["dns", &settings.name, &settings.dns])
            .output()
        {
            warn!("Could not set DNS {} on {}: {}", settings.dns, settings.name, e);
        }

        info!(
            "TUN interface {} up ({}, mtu {}, session '{}')",
            settings.name,
            settings.cidr(),
            settings.mtu,
            settings.session_name
        );

        Ok(Box::new(handle))
    }
}
