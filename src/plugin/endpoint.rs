use ipnetwork::{Ipv4Network, Ipv6Network};
use mac_address::MacAddress;
use std::net::Ipv4Addr;

use crate::error::{DriverError, Result};
use crate::store::EndpointRecord;

/// Prefix of the host side interface name
pub const HOST_IFACE_PREFIX: &str = "veth";
/// Number of endpoint id characters in the host side interface name
pub const HOST_IFACE_ID_LEN: usize = 7;

/// A container's attachment to a macvlan network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub id: String,
    pub network_id: String,
    pub mac: MacAddress,
    /// IPv4 address with prefix length
    pub addr: Ipv4Network,
    pub addr_v6: Option<Ipv6Network>,
    /// Host side sub-interface name
    pub src_name: String,
}

impl Endpoint {
    pub fn new(
        id: &str,
        network_id: &str,
        mac: MacAddress,
        addr: Ipv4Network,
        addr_v6: Option<Ipv6Network>,
    ) -> Self {
        Self {
            id: id.to_string(),
            network_id: network_id.to_string(),
            mac,
            addr,
            addr_v6,
            src_name: host_iface_name(id),
        }
    }

    /// Same addresses and MAC, so a create of `other` is a retry of this one
    pub fn same_attachment(&self, other: &Endpoint) -> bool {
        self.addr == other.addr && self.addr_v6 == other.addr_v6 && self.mac == other.mac
    }

    /// Record persisted for this endpoint
    pub fn to_record(&self) -> EndpointRecord {
        EndpointRecord {
            id: self.id.clone(),
            network_id: self.network_id.clone(),
            mac: format_mac(&self.mac),
            address: self.addr.to_string(),
            address_v6: self.addr_v6.map(|a| a.to_string()),
            src_name: self.src_name.clone(),
        }
    }

    /// Rebuild an endpoint from a persisted record
    pub fn from_record(record: &EndpointRecord) -> Result<Self> {
        let invalid = |address: &str, reason: String| DriverError::InvalidAddress {
            address: address.to_string(),
            reason,
        };

        let mac = record
            .mac
            .parse::<MacAddress>()
            .map_err(|e| invalid(&record.mac, e.to_string()))?;
        let addr = record
            .address
            .parse::<Ipv4Network>()
            .map_err(|e| invalid(&record.address, e.to_string()))?;
        let addr_v6 = match &record.address_v6 {
            Some(a) => Some(
                a.parse::<Ipv6Network>()
                    .map_err(|e| invalid(a, e.to_string()))?,
            ),
            None => None,
        };

        Ok(Self {
            id: record.id.clone(),
            network_id: record.network_id.clone(),
            mac,
            addr,
            addr_v6,
            src_name: record.src_name.clone(),
        })
    }
}

/// Derive a locally administered MAC address from an IPv4 address.
///
/// The same address always yields the same MAC, so a retried create
/// converges on the MAC handed out the first time.
pub fn generate_mac(ip: Ipv4Addr) -> MacAddress {
    let [a, b, c, d] = ip.octets();
    MacAddress::new([0x02, 0x42, a, b, c, d])
}

/// Lower case, colon separated MAC
pub fn format_mac(mac: &MacAddress) -> String {
    mac.to_string().to_lowercase()
}

fn host_iface_name(endpoint_id: &str) -> String {
    let short: String = endpoint_id.chars().take(HOST_IFACE_ID_LEN).collect();
    format!("{}{}", HOST_IFACE_PREFIX, short)
}
