use anyhow::{Context, Result};
use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};

use crate::error::DriverError;
use crate::types::{IpamData, Options};

/// Default control plane endpoint
pub const DEFAULT_CONTROL_PLANE: &str = "http://localhost:6732";
/// Parent interface option (`-o parent=eth1`)
pub const PARENT_OPT: &str = "parent";
/// Macvlan mode option (`-o macvlan_mode=vepa`)
pub const MODE_OPT: &str = "macvlan_mode";
/// Key under which the control plane nests user supplied options
pub const GENERIC_DATA: &str = "com.docker.network.generic";
/// Maximum interface name length (IFNAMSIZ without the terminator)
pub const MAX_IFNAME_LEN: usize = 15;

const DUMMY_PREFIX: &str = "dm-";
const SHORT_ID_LEN: usize = 12;

/// Configuration of the driver process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Directory holding persisted endpoint records
    pub state_dir: PathBuf,
    /// Unix socket the protocol server listens on
    pub socket_path: PathBuf,
    /// Control plane the driver registers with at startup
    pub control_plane_endpoint: String,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/var/lib/macni"),
            socket_path: PathBuf::from("/run/docker/plugins/macni.sock"),
            control_plane_endpoint: DEFAULT_CONTROL_PLANE.to_string(),
        }
    }
}

impl DriverConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: DriverConfig = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        if config.control_plane_endpoint.is_empty() {
            anyhow::bail!("control_plane_endpoint must not be empty");
        }

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)
            .with_context(|| format!("Failed to write config to {}", path.display()))?;
        Ok(())
    }
}

/// One IPv4 pool attached to a network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Subnet {
    pub pool: Ipv4Network,
    pub gateway: Option<Ipv4Addr>,
}

/// One IPv6 pool attached to a network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv6Subnet {
    pub pool: Ipv6Network,
    pub gateway: Option<Ipv6Addr>,
}

/// Validated configuration of a macvlan network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    pub id: String,
    /// Parent link the sub-interfaces hang off
    pub parent: String,
    /// Mode as requested, validated by the driver
    pub requested_mode: String,
    /// No parent was given, the network lives on a dummy link
    pub internal: bool,
    pub ipv4_subnets: Vec<Ipv4Subnet>,
    pub ipv6_subnets: Vec<Ipv6Subnet>,
}

impl NetworkConfig {
    /// Parse driver options into a network configuration
    pub fn parse(id: &str, options: &Options) -> Result<Self, DriverError> {
        let generic = match options.get(GENERIC_DATA) {
            None => None,
            Some(Value::Object(map)) => Some(map),
            Some(_) => {
                return Err(DriverError::invalid_option(
                    GENERIC_DATA,
                    "expected a map of driver options",
                ))
            }
        };
        let lookup = |key: &str| -> Result<String, DriverError> {
            let value = match generic {
                Some(map) => map.get(key),
                None => options.get(key),
            };
            match value {
                None | Some(Value::Null) => Ok(String::new()),
                Some(Value::String(s)) => Ok(s.trim().to_string()),
                Some(other) => Err(DriverError::invalid_option(
                    key,
                    format!("expected a string, got {}", other),
                )),
            }
        };

        let mut parent = lookup(PARENT_OPT)?;
        let requested_mode = lookup(MODE_OPT)?;

        let internal = parent.is_empty();
        if internal {
            parent = dummy_name(id);
        } else {
            validate_parent(&parent)?;
        }

        Ok(Self {
            id: id.to_string(),
            parent,
            requested_mode,
            internal,
            ipv4_subnets: Vec::new(),
            ipv6_subnets: Vec::new(),
        })
    }

    /// Attach the IPAM pools to this configuration
    pub fn process_ipam(&mut self, ipv4: &[IpamData], ipv6: &[IpamData]) -> Result<(), DriverError> {
        for data in ipv4 {
            let pool: Ipv4Network = data
                .pool
                .parse()
                .map_err(|e| DriverError::ipam(&self.id, format!("pool {}: {}", data.pool, e)))?;
            let gateway = match parse_gateway(&self.id, &data.gateway)? {
                None => None,
                Some(IpAddr::V4(gw)) if pool.contains(gw) => Some(gw),
                Some(gw) => {
                    return Err(DriverError::ipam(
                        &self.id,
                        format!("gateway {} is not part of pool {}", gw, pool),
                    ))
                }
            };
            self.ipv4_subnets.push(Ipv4Subnet { pool, gateway });
        }

        for data in ipv6 {
            let pool: Ipv6Network = data
                .pool
                .parse()
                .map_err(|e| DriverError::ipam(&self.id, format!("pool {}: {}", data.pool, e)))?;
            let gateway = match parse_gateway(&self.id, &data.gateway)? {
                None => None,
                Some(IpAddr::V6(gw)) if pool.contains(gw) => Some(gw),
                Some(gw) => {
                    return Err(DriverError::ipam(
                        &self.id,
                        format!("gateway {} is not part of pool {}", gw, pool),
                    ))
                }
            };
            self.ipv6_subnets.push(Ipv6Subnet { pool, gateway });
        }

        Ok(())
    }

    /// Master link and VLAN id when the parent is a VLAN sub-interface
    pub fn vlan(&self) -> Option<(&str, u16)> {
        if self.internal {
            return None;
        }
        split_vlan(&self.parent).ok().flatten()
    }
}

/// Shortened identifier used in messages and link names
pub fn truncate_id(id: &str) -> &str {
    match id.char_indices().nth(SHORT_ID_LEN) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

/// Name of the dummy parent link of an internal network
pub fn dummy_name(id: &str) -> String {
    format!("{}{}", DUMMY_PREFIX, truncate_id(id))
}

fn parse_gateway(network: &str, gateway: &str) -> Result<Option<IpAddr>, DriverError> {
    if gateway.is_empty() {
        return Ok(None);
    }
    let addr = match gateway.parse::<IpNetwork>() {
        Ok(net) => net.ip(),
        Err(_) => gateway
            .parse::<IpAddr>()
            .map_err(|e| DriverError::ipam(network, format!("gateway {}: {}", gateway, e)))?,
    };
    Ok(Some(addr))
}

fn validate_parent(parent: &str) -> Result<(), DriverError> {
    if parent.len() > MAX_IFNAME_LEN {
        return Err(DriverError::invalid_option(
            PARENT_OPT,
            format!("interface name {} is longer than {} bytes", parent, MAX_IFNAME_LEN),
        ));
    }
    if parent.chars().any(|c| c == '/' || c == ':' || c.is_whitespace()) {
        return Err(DriverError::invalid_option(
            PARENT_OPT,
            format!("interface name {} contains invalid characters", parent),
        ));
    }
    split_vlan(parent)?;
    Ok(())
}

fn split_vlan(parent: &str) -> Result<Option<(&str, u16)>, DriverError> {
    let Some((master, vlan)) = parent.rsplit_once('.') else {
        return Ok(None);
    };
    if master.is_empty() {
        return Err(DriverError::invalid_option(
            PARENT_OPT,
            format!("VLAN parent {} has no master interface", parent),
        ));
    }
    match vlan.parse::<u16>() {
        Ok(id) if (1..=4094).contains(&id) => Ok(Some((master, id))),
        _ => Err(DriverError::invalid_option(
            PARENT_OPT,
            format!("Invalid VLAN ID {} (must be between 1 and 4094)", vlan),
        )),
    }
}
