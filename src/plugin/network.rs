use ipnetwork::IpNetwork;
use itertools::Itertools;
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::config::NetworkConfig;
use crate::error::DriverError;

use super::endpoint::Endpoint;

/// Macvlan operating mode, fixed at network creation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum MacvlanMode {
    #[default]
    Bridge,
    Private,
    Vepa,
    Passthru,
}

impl MacvlanMode {
    pub const ALL: [MacvlanMode; 4] = [Self::Bridge, Self::Private, Self::Vepa, Self::Passthru];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bridge => "bridge",
            Self::Private => "private",
            Self::Vepa => "vepa",
            Self::Passthru => "passthru",
        }
    }
}

impl fmt::Display for MacvlanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MacvlanMode {
    type Err = DriverError;

    /// An empty mode selects the default
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(Self::default());
        }
        Self::ALL
            .into_iter()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| DriverError::InvalidMode(s.to_string()))
    }
}

/// Comma separated list of accepted modes, for help texts
pub fn supported_modes() -> String {
    MacvlanMode::ALL.iter().join(", ")
}

/// Outcome of inserting an endpoint into a network
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Insert {
    Added,
    /// The id is taken; holds the endpoint registered under it
    Taken(Endpoint),
    /// The network has been freed
    Closed,
}

#[derive(Debug, Default)]
struct EndpointTable {
    closed: bool,
    entries: HashMap<String, Endpoint>,
}

/// A logical layer 2 network bound to one parent interface
#[derive(Debug)]
pub struct Network {
    config: NetworkConfig,
    mode: MacvlanMode,
    endpoints: Mutex<EndpointTable>,
}

impl Network {
    pub fn new(config: NetworkConfig, mode: MacvlanMode) -> Self {
        Self {
            config,
            mode,
            endpoints: Mutex::new(EndpointTable::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn parent(&self) -> &str {
        &self.config.parent
    }

    pub fn mode(&self) -> MacvlanMode {
        self.mode
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Subnet of this network that contains `ip`
    pub fn subnet_for_ip(&self, ip: IpAddr) -> Option<IpNetwork> {
        match ip {
            IpAddr::V4(v4) => self
                .config
                .ipv4_subnets
                .iter()
                .find(|s| s.pool.contains(v4))
                .map(|s| IpNetwork::V4(s.pool)),
            IpAddr::V6(v6) => self
                .config
                .ipv6_subnets
                .iter()
                .find(|s| s.pool.contains(v6))
                .map(|s| IpNetwork::V6(s.pool)),
        }
    }

    /// Gateways of the subnets holding the endpoint's addresses
    pub fn gateways_for(&self, ep: &Endpoint) -> (Option<IpAddr>, Option<IpAddr>) {
        let v4 = self
            .config
            .ipv4_subnets
            .iter()
            .find(|s| s.pool.contains(ep.addr.ip()))
            .and_then(|s| s.gateway)
            .map(IpAddr::V4);
        let v6 = ep.addr_v6.and_then(|addr| {
            self.config
                .ipv6_subnets
                .iter()
                .find(|s| s.pool.contains(addr.ip()))
                .and_then(|s| s.gateway)
                .map(IpAddr::V6)
        });
        (v4, v6)
    }

    /// Insert an endpoint unless its id is taken or the network is closed
    pub fn add_endpoint(&self, ep: Endpoint) -> Insert {
        let mut table = self.lock_endpoints();
        if table.closed {
            return Insert::Closed;
        }
        if let Some(existing) = table.entries.get(&ep.id) {
            return Insert::Taken(existing.clone());
        }
        table.entries.insert(ep.id.clone(), ep);
        Insert::Added
    }

    pub fn endpoint(&self, id: &str) -> Option<Endpoint> {
        self.lock_endpoints().entries.get(id).cloned()
    }

    pub fn has_endpoint(&self, id: &str) -> bool {
        self.lock_endpoints().entries.contains_key(id)
    }

    pub fn delete_endpoint(&self, id: &str) -> Option<Endpoint> {
        self.lock_endpoints().entries.remove(id)
    }

    /// Refuse further endpoints and return the ones still attached,
    /// ordered by id
    pub fn close(&self) -> Vec<Endpoint> {
        let mut table = self.lock_endpoints();
        table.closed = true;
        table
            .entries
            .values()
            .cloned()
            .sorted_by(|a, b| a.id.cmp(&b.id))
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.lock_endpoints().closed
    }

    pub fn endpoint_ids(&self) -> Vec<String> {
        self.lock_endpoints().entries.keys().cloned().sorted().collect()
    }

    pub fn endpoint_count(&self) -> usize {
        self.lock_endpoints().entries.len()
    }

    fn lock_endpoints(&self) -> MutexGuard<'_, EndpointTable> {
        self.endpoints.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
