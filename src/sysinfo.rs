//! System inventory — device identity and network state readers.
//!
//! Everything is behind the `SystemInspector` trait so endpoint handlers
//! and tests can swap in fixtures. The host implementation reads Linux
//! sysfs/procfs (root-prefixed for tests) and enumerates interfaces via
//! getifaddrs.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::PathBuf;

/// Interfaces beyond this are silently dropped from the report.
pub const MAX_INTERFACES: usize = 32;

#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub tpm: TpmInfo,
    pub board: BoardInfo,
    pub cpu: CpuInfo,
    pub os: OsInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct TpmInfo {
    pub present: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BoardInfo {
    pub manufacturer: String,
    pub model: String,
    pub serial: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CpuInfo {
    pub architecture: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct OsInfo {
    pub distribution: String,
    pub version: String,
    pub fips_enabled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkInfo {
    pub interfaces: Vec<InterfaceInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InterfaceInfo {
    pub name: String,
    pub mac_address: String,
    pub link_state: LinkState,
    pub ip_addresses: Vec<IpAddressInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Up,
    Down,
}

#[derive(Debug, Clone, Serialize)]
pub struct IpAddressInfo {
    pub ip: String,
    pub prefix: u8,
    pub family: AddressFamily,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

/// Pluggable inventory provider.
pub trait SystemInspector: Send + Sync {
    fn device_info(&self) -> Result<DeviceInfo>;
    fn network_info(&self) -> Result<NetworkInfo>;
}

/// Reads the running host. `root` prefixes every file access so tests can
/// point it at a fixture tree.
pub struct HostInspector {
    root: PathBuf,
}

impl HostInspector {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn read_trimmed(&self, relative: &str) -> Option<String> {
        let path = self.root.join(relative);
        fs::read_to_string(path)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }
}

impl SystemInspector for HostInspector {
    fn device_info(&self) -> Result<DeviceInfo> {
        let tpm_dir = self.root.join("sys/class/tpm/tpm0");
        let tpm = TpmInfo {
            present: tpm_dir.exists(),
            manufacturer: self.read_trimmed("sys/class/tpm/tpm0/device/manufacturer"),
            model: self.read_trimmed("sys/class/tpm/tpm0/device/description"),
            version: self.read_trimmed("sys/class/tpm/tpm0/tpm_version_major"),
        };

        let board = BoardInfo {
            manufacturer: self
                .read_trimmed("sys/class/dmi/id/board_vendor")
                .unwrap_or_else(|| "unknown".into()),
            model: self
                .read_trimmed("sys/class/dmi/id/board_name")
                .unwrap_or_else(|| "unknown".into()),
            serial: self
                .read_trimmed("sys/class/dmi/id/product_serial")
                .unwrap_or_else(|| "unknown".into()),
        };

        let os_release = fs::read_to_string(self.root.join("etc/os-release"))
            .context("Failed to read os-release")?;
        let (distribution, version) = parse_os_release(&os_release);
        let fips_enabled = self
            .read_trimmed("proc/sys/crypto/fips_enabled")
            .map(|v| v == "1")
            .unwrap_or(false);

        Ok(DeviceInfo {
            tpm,
            board,
            cpu: CpuInfo {
                architecture: std::env::consts::ARCH.to_string(),
            },
            os: OsInfo {
                distribution,
                version,
                fips_enabled,
            },
        })
    }

    fn network_info(&self) -> Result<NetworkInfo> {
        Ok(NetworkInfo {
            interfaces: enumerate_interfaces()?,
        })
    }
}

/// Walk getifaddrs once, folding link-layer, IPv4, and IPv6 records into
/// per-interface entries. Ordering follows first appearance.
fn enumerate_interfaces() -> Result<Vec<InterfaceInfo>> {
    use nix::net::if_::InterfaceFlags;

    let mut interfaces: Vec<InterfaceInfo> = Vec::new();
    let addrs = nix::ifaddrs::getifaddrs().context("getifaddrs failed")?;

    for ifaddr in addrs {
        let position = interfaces
            .iter()
            .position(|i| i.name == ifaddr.interface_name);
        let entry = match position {
            Some(idx) => &mut interfaces[idx],
            None => {
                let link_state = if ifaddr.flags.contains(InterfaceFlags::IFF_RUNNING) {
                    LinkState::Up
                } else {
                    LinkState::Down
                };
                interfaces.push(InterfaceInfo {
                    name: ifaddr.interface_name.clone(),
                    mac_address: String::new(),
                    link_state,
                    ip_addresses: Vec::new(),
                });
                interfaces.last_mut().unwrap()
            }
        };

        let Some(address) = ifaddr.address else {
            continue;
        };
        if let Some(link) = address.as_link_addr() {
            if let Some(mac) = link.addr() {
                entry.mac_address = format_mac(&mac);
            }
        } else if let Some(sin) = address.as_sockaddr_in() {
            let prefix = ifaddr
                .netmask
                .and_then(|m| m.as_sockaddr_in().map(|m| u32::from(m.ip()).count_ones() as u8))
                .unwrap_or(32);
            entry.ip_addresses.push(IpAddressInfo {
                ip: sin.ip().to_string(),
                prefix,
                family: AddressFamily::Ipv4,
            });
        } else if let Some(sin6) = address.as_sockaddr_in6() {
            let prefix = ifaddr
                .netmask
                .and_then(|m| m.as_sockaddr_in6().map(|m| ipv6_prefix_len(&m.ip())))
                .unwrap_or(128);
            entry.ip_addresses.push(IpAddressInfo {
                ip: sin6.ip().to_string(),
                prefix,
                family: AddressFamily::Ipv6,
            });
        }
    }

    interfaces.truncate(MAX_INTERFACES);
    Ok(interfaces)
}

fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

fn ipv6_prefix_len(mask: &std::net::Ipv6Addr) -> u8 {
    mask.octets().iter().map(|b| b.count_ones() as u8).sum()
}

/// Pull NAME and VERSION_ID out of os-release, unquoting values.
fn parse_os_release(content: &str) -> (String, String) {
    let mut distribution = String::from("unknown");
    let mut version = String::from("unknown");
    for line in content.lines() {
        if let Some(value) = line.strip_prefix("NAME=") {
            distribution = unquote(value);
        } else if let Some(value) = line.strip_prefix("VERSION_ID=") {
            version = unquote(value);
        }
    }
    (distribution, version)
}

fn unquote(value: &str) -> String {
    value.trim().trim_matches('"').to_string()
}
