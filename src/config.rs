//! Configuration loading and validation.
//!
//! The config file is TOML. Role-specific field requirements are enforced
//! when the file is turned into [`VpnOptions`]: the server needs a
//! `[[users]]` credential list, the client a single `user`/`pass` pair.

use crate::auth::UserCredential;
use crate::error::{VpnError, VpnResult};
use crate::peers::virtual_ip;
use ipnet::Ipv4Net;
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::Path;

/// Default MTU for the TUN device (leaves room for the WebSocket/TCP and
/// AES-GCM overhead inside a standard 1500-byte path).
pub const DEFAULT_MTU: u16 = 1400;

fn default_mtu() -> u16 {
    DEFAULT_MTU
}

/// One `[[users]]` entry of the server config.
#[derive(Debug, Clone, Deserialize)]
pub struct UserEntry {
    pub username: String,
    pub password: String,
    /// Virtual address assigned to the user, with or without a CIDR suffix.
    pub ipaddress: String,
}

/// Raw config file contents.
#[derive(Debug, Clone, Deserialize)]
pub struct FileConfig {
    /// MTU for the TUN device.
    #[serde(default = "default_mtu")]
    pub mtu: u16,
    /// Transport endpoint: the address the client dials / the server binds.
    pub server: String,
    /// Virtual address + CIDR assigned to this node, e.g. "10.0.0.1/24".
    pub address: String,
    /// HTTP Host header used in the WebSocket handshake (client).
    #[serde(default)]
    pub host_header: Option<String>,
    /// Physical default gateway, handed to the route installer.
    #[serde(default)]
    pub default_gateway: Option<Ipv4Addr>,
    /// CIDRs that bypass the tunnel.
    #[serde(default)]
    pub whitelist: Vec<String>,
    /// Addresses dropped per packet (and routed for dropping).
    #[serde(default)]
    pub blacklist: Vec<String>,
    /// Client credential.
    #[serde(default)]
    pub user: Option<String>,
    /// Client credential.
    #[serde(default)]
    pub pass: Option<String>,
    /// Server credential list.
    #[serde(default)]
    pub users: Vec<UserEntry>,
    /// Explicit TUN device name.
    #[serde(default)]
    pub tun_name: Option<String>,
}

/// Validated runtime options.
#[derive(Debug, Clone)]
pub struct VpnOptions {
    pub mtu: u16,
    pub server_addr: String,
    pub local_addr: Ipv4Net,
    pub host_header: Option<String>,
    pub default_gateway: Option<Ipv4Addr>,
    pub is_server: bool,
    pub users: Vec<UserCredential>,
    pub whitelist: Vec<Ipv4Net>,
    pub blacklist: Vec<Ipv4Addr>,
    pub tun_name: Option<String>,
}

/// Load the raw configuration from a TOML file.
pub fn load(path: &Path) -> VpnResult<FileConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| VpnError::Config(format!("failed to read {}: {}", path.display(), e)))?;
    toml::from_str(&content)
        .map_err(|e| VpnError::Config(format!("failed to parse {}: {}", path.display(), e)))
}

impl FileConfig {
    /// Validate the file contents for the selected role.
    pub fn into_options(self, is_server: bool) -> VpnResult<VpnOptions> {
        if self.server.trim().is_empty() {
            return Err(VpnError::Config("'server' must not be empty".into()));
        }

        let local_addr: Ipv4Net = self.address.parse().map_err(|_| {
            VpnError::Config(format!(
                "invalid 'address' {} (expected CIDR like 10.0.0.1/24)",
                self.address
            ))
        })?;

        let whitelist = self
            .whitelist
            .iter()
            .map(|s| {
                s.parse::<Ipv4Net>()
                    .map_err(|_| VpnError::Config(format!("invalid whitelist entry: {}", s)))
            })
            .collect::<VpnResult<Vec<_>>>()?;

        let blacklist = self
            .blacklist
            .iter()
            .map(|s| virtual_ip(s))
            .collect::<VpnResult<Vec<_>>>()?;

        let users = if is_server {
            if self.users.is_empty() {
                return Err(VpnError::Config(
                    "server role requires at least one [[users]] entry".into(),
                ));
            }
            let mut seen = std::collections::HashSet::new();
            let mut users = Vec::with_capacity(self.users.len());
            for entry in self.users {
                if !seen.insert(entry.username.clone()) {
                    return Err(VpnError::Config(format!(
                        "duplicate user: {}",
                        entry.username
                    )));
                }
                users.push(UserCredential {
                    ip: virtual_ip(&entry.ipaddress)?,
                    name: entry.username,
                    password: entry.password,
                });
            }
            users
        } else {
            let name = self
                .user
                .ok_or_else(|| VpnError::Config("client role requires 'user'".into()))?;
            let password = self
                .pass
                .ok_or_else(|| VpnError::Config("client role requires 'pass'".into()))?;
            vec![UserCredential {
                name,
                password,
                ip: local_addr.addr(),
            }]
        };

        Ok(VpnOptions {
            mtu: self.mtu,
            server_addr: self.server,
            local_addr,
            host_header: self.host_header,
            default_gateway: self.default_gateway,
            is_server,
            users,
            whitelist,
            blacklist,
            tun_name: self.tun_name,
        })
    }
}
