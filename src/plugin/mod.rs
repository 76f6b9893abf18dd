//! The macvlan driver: network and endpoint lifecycle.
//!
//! Locking: the network table sits behind one `RwLock`. Allocation holds
//! the write lock across the parent-interface scan and the insert. Each
//! network guards its endpoint table with its own mutex, which is only
//! taken after the table lock has been released. Store and link calls
//! never run while an endpoint table is locked.

pub mod endpoint;
pub mod network;

use ipnetwork::{Ipv4Network, Ipv6Network};
use mac_address::MacAddress;
use serde_json::Value;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

use crate::config::{truncate_id, DriverConfig, NetworkConfig};
use crate::error::{DriverError, Result};
use crate::integrations::ControlPlaneClient;
use crate::link::{IpLink, LinkOps, MacvlanLink};
use crate::store::{FileStore, Store};
use crate::types::{
    AllocateNetworkRequest, AllocateNetworkResponse, CapabilitiesResponse, CreateEndpointRequest,
    CreateEndpointResponse, DeleteEndpointRequest, DiscoveryNotification, EndpointInterface,
    FreeNetworkRequest, InfoRequest, InfoResponse, InterfaceName, JoinRequest, JoinResponse,
    LeaveRequest, Options, ProgramExternalConnectivityRequest, RevokeExternalConnectivityRequest,
    CONTAINER_IFACE_PREFIX, GLOBAL_SCOPE,
};

pub use endpoint::{format_mac, generate_mac, Endpoint};
pub use network::{Insert, MacvlanMode, Network};

/// Pool that stands for "no address space"
pub const ANY_ADDRESS_POOL: &str = "0.0.0.0/0";
/// Endpoint option carrying requested port mappings
pub const PORT_MAP_OPT: &str = "com.docker.network.portmap";
/// Endpoint option carrying requested exposed ports
pub const EXPOSED_PORTS_OPT: &str = "com.docker.network.endpoint.exposedports";

const LOOPBACK: &str = "lo";

/// Outcome of one best-effort cleanup step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cleanup {
    Done,
    /// Nothing to clean up
    Skipped,
    Failed(String),
}

/// Result of releasing an endpoint. The in-memory record is always gone;
/// `link` and `store` say what happened to the host link and the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteReport {
    pub endpoint: String,
    pub link: Cleanup,
    pub store: Cleanup,
}

impl DeleteReport {
    /// No secondary step failed
    pub fn is_clean(&self) -> bool {
        !matches!(self.link, Cleanup::Failed(_)) && !matches!(self.store, Cleanup::Failed(_))
    }
}

/// Result of freeing a network
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FreeReport {
    /// The network was known
    pub found: bool,
    /// Endpoints that were still attached and got released
    pub released: Vec<DeleteReport>,
}

/// The macvlan network driver
pub struct Driver {
    networks: RwLock<HashMap<String, Arc<Network>>>,
    /// Endpoints loaded from the store, waiting for their network
    recovered: Mutex<HashMap<String, Vec<Endpoint>>>,
    store: Arc<dyn Store>,
    links: Arc<dyn LinkOps>,
    client: ControlPlaneClient,
}

impl Driver {
    /// Build the driver from its configuration, with the file store and `ip` links
    pub fn init(config: &DriverConfig) -> Result<Self> {
        let store = Arc::new(FileStore::new(&config.state_dir));
        info!("Keeping endpoint state in {}", store.root().display());
        Self::new(store, Arc::new(IpLink::new()), &config.control_plane_endpoint)
    }

    /// Set up the store and the control plane client.
    ///
    /// This is the only place either is initialised; a failure of either
    /// leaves no driver behind.
    pub fn new(
        store: Arc<dyn Store>,
        links: Arc<dyn LinkOps>,
        control_plane_endpoint: &str,
    ) -> Result<Self> {
        let records = store.init_store().map_err(|e| {
            debug!("Failure during init macvlan local store: {}", e);
            DriverError::StoreInit(e)
        })?;

        let client = ControlPlaneClient::connect(control_plane_endpoint).map_err(|e| {
            debug!("Could not connect to control plane: {}", e);
            e
        })?;

        let mut recovered: HashMap<String, Vec<Endpoint>> = HashMap::new();
        for record in &records {
            match Endpoint::from_record(record) {
                Ok(ep) => recovered.entry(ep.network_id.clone()).or_default().push(ep),
                Err(e) => warn!("Ignoring stored endpoint {}: {}", record.id, e),
            }
        }
        if !recovered.is_empty() {
            info!(
                "Recovered {} endpoints across {} networks",
                recovered.values().map(Vec::len).sum::<usize>(),
                recovered.len()
            );
        }

        Ok(Self {
            networks: RwLock::new(HashMap::new()),
            recovered: Mutex::new(recovered),
            store,
            links,
            client,
        })
    }

    pub fn control_plane(&self) -> &ControlPlaneClient {
        &self.client
    }

    /// Look up a network
    pub fn network(&self, id: &str) -> Option<Arc<Network>> {
        self.read_networks().get(id).cloned()
    }

    /// Ids of all networks, unordered
    pub fn network_ids(&self) -> Vec<String> {
        self.read_networks().keys().cloned().collect()
    }

    pub fn network_count(&self) -> usize {
        self.read_networks().len()
    }

    /// Scope advertised to the control plane
    pub fn get_capabilities(&self) -> CapabilitiesResponse {
        debug!("GetCapabilities macvlan");
        CapabilitiesResponse {
            scope: GLOBAL_SCOPE.to_string(),
            connectivity_scope: String::new(),
        }
    }

    /// Validate and register a network
    pub fn allocate_network(&self, req: &AllocateNetworkRequest) -> Result<AllocateNetworkResponse> {
        let id = req.network_id.as_str();
        debug!("AllocateNetwork macvlan with networkID={}, opts={:?}", id, req.options);
        if id.is_empty() {
            return Err(DriverError::InvalidNetworkId);
        }

        match req.ipv4_data.first() {
            None => return Err(DriverError::EmptyIpv4Pool),
            Some(first) if is_any_address(&first.pool) => return Err(DriverError::EmptyIpv4Pool),
            Some(_) => {}
        }

        let mut config = NetworkConfig::parse(id, &req.options)?;
        config.process_ipam(&req.ipv4_data, &req.ipv6_data)?;

        let mode: MacvlanMode = config.requested_mode.parse()?;

        if config.parent == LOOPBACK {
            return Err(DriverError::LoopbackParent);
        }

        let dropped = {
            let mut networks = self.write_networks();
            if networks.contains_key(id) {
                return Err(DriverError::NetworkExists(truncate_id(id).to_string()));
            }
            if let Some(existing) = networks.values().find(|n| n.parent() == config.parent) {
                return Err(DriverError::ParentInUse {
                    network: truncate_id(existing.id()).to_string(),
                    parent: config.parent.clone(),
                });
            }

            let network = Network::new(config, mode);
            let dropped = self.adopt_recovered(&network);
            info!(
                "Allocated macvlan network {} on parent {} in {} mode",
                truncate_id(id),
                network.parent(),
                network.mode()
            );
            networks.insert(id.to_string(), Arc::new(network));
            dropped
        };

        for ep in dropped {
            if let Err(e) = self.store.delete(&ep.to_record()) {
                warn!("Failed to remove dropped endpoint {} from store: {}", truncate_id(&ep.id), e);
            }
        }

        Ok(AllocateNetworkResponse {
            options: req.options.clone(),
        })
    }

    /// Drop a network. Unknown ids are not an error; endpoints still
    /// attached are released the same way `delete_endpoint` does it.
    pub fn free_network(&self, req: &FreeNetworkRequest) -> Result<FreeReport> {
        let id = req.network_id.as_str();
        debug!("FreeNetwork macvlan with networkID={}", id);
        if id.is_empty() {
            return Err(DriverError::InvalidNetworkId);
        }

        let removed = self.write_networks().remove(id);
        let Some(network) = removed else {
            warn!("macvlan network with id {} not found", id);
            return Ok(FreeReport {
                found: false,
                released: self.forget_recovered(id),
            });
        };

        let mut released = Vec::new();
        for ep in network.close() {
            warn!(
                "Releasing endpoint {} still attached to freed network {}",
                truncate_id(&ep.id),
                truncate_id(id)
            );
            released.push(self.release_endpoint(&ep));
            network.delete_endpoint(&ep.id);
        }

        info!("Freed macvlan network {}", truncate_id(id));
        Ok(FreeReport {
            found: true,
            released,
        })
    }

    /// Validate, persist and register an endpoint
    pub fn create_endpoint(&self, req: &CreateEndpointRequest) -> Result<CreateEndpointResponse> {
        debug!(
            "CreateEndpoint macvlan with networkID={}, endpointID={}",
            req.network_id, req.endpoint_id
        );
        if req.network_id.is_empty() {
            return Err(DriverError::InvalidNetworkId);
        }
        if req.endpoint_id.is_empty() {
            return Err(DriverError::InvalidEndpointId);
        }
        let intf = req.interface.as_ref().ok_or(DriverError::InvalidInterface)?;

        let network = self
            .network(&req.network_id)
            .ok_or_else(|| DriverError::NetworkNotFound(req.network_id.clone()))?;

        let addr = parse_ipv4(&intf.address)?;
        if network.subnet_for_ip(IpAddr::V4(addr.ip())).is_none() {
            return Err(DriverError::NoMatchingSubnet {
                address: IpAddr::V4(addr.ip()),
                network: req.network_id.clone(),
            });
        }

        let addr_v6 = parse_ipv6(&intf.address_ipv6)?;
        if let Some(v6) = addr_v6 {
            if network.subnet_for_ip(IpAddr::V6(v6.ip())).is_none() {
                return Err(DriverError::NoMatchingSubnet {
                    address: IpAddr::V6(v6.ip()),
                    network: req.network_id.clone(),
                });
            }
        }

        let mac = if intf.mac_address.is_empty() {
            generate_mac(addr.ip())
        } else {
            intf.mac_address
                .parse::<MacAddress>()
                .map_err(|e| DriverError::InvalidAddress {
                    address: intf.mac_address.clone(),
                    reason: e.to_string(),
                })?
        };

        warn_unsupported_ports(&req.options);

        let ep = Endpoint::new(&req.endpoint_id, &req.network_id, mac, addr, addr_v6);
        if let Some(existing) = network.endpoint(&ep.id) {
            return retried_endpoint(&existing, &ep);
        }

        let record = ep.to_record();
        self.store
            .save(&record)
            .map_err(|source| DriverError::StoreSave {
                endpoint: truncate_id(&ep.id).to_string(),
                source,
            })?;

        match network.add_endpoint(ep.clone()) {
            Insert::Added => {}
            Insert::Taken(winner) => {
                if !winner.same_attachment(&ep) {
                    // lost a race with a different create of the same id
                    self.restore_record(&network, &winner);
                }
                return retried_endpoint(&winner, &ep);
            }
            Insert::Closed => {
                debug!("Network {} was freed during endpoint creation", truncate_id(&req.network_id));
                if let Err(e) = self.store.delete(&record) {
                    warn!("Failed to remove macvlan endpoint {} from store: {}", truncate_id(&ep.id), e);
                }
                return Err(DriverError::NetworkNotFound(req.network_id.clone()));
            }
        }

        info!(
            "Created macvlan endpoint {} in network {} with mac {}",
            truncate_id(&ep.id),
            truncate_id(&ep.network_id),
            format_mac(&ep.mac)
        );
        Ok(endpoint_response(&ep))
    }

    /// Remove an endpoint. Link and store cleanup are best effort; the
    /// in-memory record is removed regardless.
    pub fn delete_endpoint(&self, req: &DeleteEndpointRequest) -> Result<DeleteReport> {
        debug!(
            "DeleteEndpoint macvlan with networkID={}, endpointID={}",
            req.network_id, req.endpoint_id
        );
        let (network, ep) = self.lookup_endpoint(&req.network_id, &req.endpoint_id)?;

        let report = self.release_endpoint(&ep);
        network.delete_endpoint(&ep.id);

        Ok(report)
    }

    /// Operational details of an endpoint
    pub fn endpoint_info(&self, req: &InfoRequest) -> Result<InfoResponse> {
        let (_, ep) = self.lookup_endpoint(&req.network_id, &req.endpoint_id)?;

        let mut value = HashMap::new();
        value.insert("id".to_string(), ep.id.clone());
        value.insert("mac".to_string(), format_mac(&ep.mac));
        value.insert("address".to_string(), ep.addr.to_string());
        if let Some(v6) = ep.addr_v6 {
            value.insert("address_ipv6".to_string(), v6.to_string());
        }
        value.insert("src_name".to_string(), ep.src_name.clone());

        Ok(InfoResponse { value })
    }

    /// Create the endpoint's sub-interface on the host and hand it to the caller
    pub fn join(&self, req: &JoinRequest) -> Result<JoinResponse> {
        debug!(
            "Join macvlan with networkID={}, endpointID={}, sandbox={}",
            req.network_id, req.endpoint_id, req.sandbox_key
        );
        let (network, ep) = self.lookup_endpoint(&req.network_id, &req.endpoint_id)?;

        let link = MacvlanLink {
            name: ep.src_name.clone(),
            parent: network.parent().to_string(),
            mode: network.mode(),
            mac: ep.mac,
            vlan: network
                .config()
                .vlan()
                .map(|(master, vlan)| (master.to_string(), vlan)),
            internal: network.config().internal,
        };
        self.links.create_macvlan(&link)?;

        let (gateway, gateway_ipv6) = network.gateways_for(&ep);
        Ok(JoinResponse {
            interface_name: InterfaceName {
                src_name: ep.src_name.clone(),
                dst_prefix: CONTAINER_IFACE_PREFIX.to_string(),
            },
            gateway: gateway.map(|g| g.to_string()).unwrap_or_default(),
            gateway_ipv6: gateway_ipv6.map(|g| g.to_string()).unwrap_or_default(),
            disable_gateway_service: network.config().internal,
        })
    }

    /// The sub-interface leaves with the sandbox; it is removed on endpoint deletion
    pub fn leave(&self, req: &LeaveRequest) -> Result<()> {
        debug!(
            "Leave macvlan with networkID={}, endpointID={}",
            req.network_id, req.endpoint_id
        );
        self.lookup_endpoint(&req.network_id, &req.endpoint_id)?;
        Ok(())
    }

    pub fn discover_new(&self, _notification: &DiscoveryNotification) -> Result<()> {
        debug!("DiscoverNew macvlan");
        Ok(())
    }

    pub fn discover_delete(&self, _notification: &DiscoveryNotification) -> Result<()> {
        debug!("DiscoverDelete macvlan");
        Ok(())
    }

    pub fn program_external_connectivity(
        &self,
        _req: &ProgramExternalConnectivityRequest,
    ) -> Result<()> {
        debug!("ProgramExternalConnectivity macvlan");
        Ok(())
    }

    pub fn revoke_external_connectivity(
        &self,
        _req: &RevokeExternalConnectivityRequest,
    ) -> Result<()> {
        debug!("RevokeExternalConnectivity macvlan");
        Ok(())
    }

    fn lookup_endpoint(&self, network_id: &str, endpoint_id: &str) -> Result<(Arc<Network>, Endpoint)> {
        if network_id.is_empty() {
            return Err(DriverError::InvalidNetworkId);
        }
        if endpoint_id.is_empty() {
            return Err(DriverError::InvalidEndpointId);
        }
        let network = self
            .network(network_id)
            .ok_or_else(|| DriverError::NetworkNotFound(network_id.to_string()))?;
        let ep = network
            .endpoint(endpoint_id)
            .ok_or_else(|| DriverError::EndpointNotFound(endpoint_id.to_string()))?;
        Ok((network, ep))
    }

    /// Best-effort removal of the host link and the stored record
    fn release_endpoint(&self, ep: &Endpoint) -> DeleteReport {
        let link = match self.links.lookup_interface(&ep.src_name) {
            Ok(Some(handle)) => match self.links.delete_interface(&handle) {
                Ok(()) => Cleanup::Done,
                Err(e) => {
                    warn!("Failed to delete link {} of endpoint {}: {}", ep.src_name, truncate_id(&ep.id), e);
                    Cleanup::Failed(e.to_string())
                }
            },
            Ok(None) => Cleanup::Skipped,
            Err(e) => {
                debug!("Link {} lookup failed, skipping removal: {}", ep.src_name, e);
                Cleanup::Skipped
            }
        };

        let store = match self.store.delete(&ep.to_record()) {
            Ok(()) => Cleanup::Done,
            Err(e) => {
                warn!("Failed to remove macvlan endpoint {} from store: {}", truncate_id(&ep.id), e);
                Cleanup::Failed(e.to_string())
            }
        };

        DeleteReport {
            endpoint: ep.id.clone(),
            link,
            store,
        }
    }

    /// Put back the record of the endpoint that owns an id
    fn restore_record(&self, network: &Network, owner: &Endpoint) {
        let record = owner.to_record();
        if let Err(e) = self.store.save(&record) {
            warn!("Failed to restore record of endpoint {}: {}", truncate_id(&owner.id), e);
            return;
        }
        // a free that ran meanwhile has already released the owner
        if network.is_closed() {
            if let Err(e) = self.store.delete(&record) {
                warn!("Failed to remove macvlan endpoint {} from store: {}", truncate_id(&owner.id), e);
            }
        }
    }

    /// Attach endpoints recovered from the store to a new network,
    /// returning the ones whose addresses no longer fit it
    fn adopt_recovered(&self, network: &Network) -> Vec<Endpoint> {
        let Some(endpoints) = self.lock_recovered().remove(network.id()) else {
            return Vec::new();
        };

        let mut dropped = Vec::new();
        for ep in endpoints {
            let v4_ok = network.subnet_for_ip(IpAddr::V4(ep.addr.ip())).is_some();
            let v6_ok = ep
                .addr_v6
                .map_or(true, |v6| network.subnet_for_ip(IpAddr::V6(v6.ip())).is_some());
            if !(v4_ok && v6_ok) {
                warn!(
                    "Dropping recovered endpoint {}: address {} is outside network {}",
                    truncate_id(&ep.id),
                    ep.addr,
                    truncate_id(network.id())
                );
                dropped.push(ep);
                continue;
            }
            debug!("Restoring endpoint {} into network {}", truncate_id(&ep.id), truncate_id(network.id()));
            network.add_endpoint(ep);
        }
        dropped
    }

    /// Release recovered endpoints of a network that is not allocated
    fn forget_recovered(&self, network_id: &str) -> Vec<DeleteReport> {
        let endpoints = self.lock_recovered().remove(network_id).unwrap_or_default();
        endpoints
            .iter()
            .map(|ep| {
                warn!(
                    "Releasing recovered endpoint {} of freed network {}",
                    truncate_id(&ep.id),
                    truncate_id(network_id)
                );
                self.release_endpoint(ep)
            })
            .collect()
    }

    fn read_networks(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<Network>>> {
        self.networks.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_networks(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<Network>>> {
        self.networks.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_recovered(&self) -> MutexGuard<'_, HashMap<String, Vec<Endpoint>>> {
        self.recovered.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Answer a create whose id is already registered: a retry with the same
/// addresses and MAC succeeds, anything else is a conflict
fn retried_endpoint(existing: &Endpoint, requested: &Endpoint) -> Result<CreateEndpointResponse> {
    if !existing.same_attachment(requested) {
        return Err(DriverError::EndpointExists {
            network: requested.network_id.clone(),
            endpoint: requested.id.clone(),
        });
    }
    debug!("Endpoint {} already exists with the requested addresses", truncate_id(&existing.id));
    Ok(endpoint_response(existing))
}

fn endpoint_response(ep: &Endpoint) -> CreateEndpointResponse {
    CreateEndpointResponse {
        interface: Some(EndpointInterface {
            address: String::new(),
            address_ipv6: String::new(),
            mac_address: format_mac(&ep.mac),
        }),
    }
}

fn is_any_address(pool: &str) -> bool {
    pool == ANY_ADDRESS_POOL
        || pool
            .parse::<Ipv4Network>()
            .map(|net| net.prefix() == 0 && net.ip().is_unspecified())
            .unwrap_or(false)
}

fn parse_ipv4(address: &str) -> Result<Ipv4Network> {
    if address.is_empty() {
        return Err(DriverError::MissingAddress);
    }
    address
        .parse::<Ipv4Network>()
        .map_err(|e| DriverError::InvalidAddress {
            address: address.to_string(),
            reason: e.to_string(),
        })
}

fn parse_ipv6(address: &str) -> Result<Option<Ipv6Network>> {
    if address.is_empty() {
        return Ok(None);
    }
    address
        .parse::<Ipv6Network>()
        .map(Some)
        .map_err(|e| DriverError::InvalidAddress {
            address: address.to_string(),
            reason: e.to_string(),
        })
}

/// Port publishing is not supported; requests for it are logged and ignored
fn warn_unsupported_ports(options: &Options) {
    let requested = |key: &str| matches!(options.get(key), Some(Value::Array(v)) if !v.is_empty());
    if requested(PORT_MAP_OPT) {
        warn!("macvlan driver does not support port mappings");
    }
    if requested(EXPOSED_PORTS_OPT) {
        warn!("macvlan driver does not support port exposures");
    }
}
