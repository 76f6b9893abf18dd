//! Error types for driver operations

use std::net::IpAddr;

use thiserror::Error;

/// Result alias used across the driver
pub type Result<T> = std::result::Result<T, DriverError>;

/// Coarse classification of a [`DriverError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input, nothing was changed
    Validation,
    /// The request collides with existing state
    Conflict,
    /// The referenced network or endpoint is unknown
    NotFound,
    /// An external collaborator failed
    Collaborator,
    /// Driver construction failed
    Init,
}

/// Main error type for driver operations
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("invalid network id for macvlan network")]
    InvalidNetworkId,

    #[error("invalid endpoint id for macvlan endpoint")]
    InvalidEndpointId,

    #[error("invalid interface passed while creating macvlan endpoint")]
    InvalidInterface,

    #[error("ipv4 pool is empty")]
    EmptyIpv4Pool,

    #[error("invalid network option {option}: {reason}")]
    InvalidOption { option: String, reason: String },

    #[error("ipam data for network {network} could not be processed: {reason}")]
    Ipam { network: String, reason: String },

    #[error("requested macvlan mode '{0}' is not valid, 'bridge' mode is the macvlan driver default")]
    InvalidMode(String),

    #[error("loopback interface is not a valid macvlan parent link")]
    LoopbackParent,

    #[error("network {network} is already using parent interface {parent}")]
    ParentInUse { network: String, parent: String },

    #[error("network {0} already exists")]
    NetworkExists(String),

    #[error("endpoint {endpoint} already exists in network {network}")]
    EndpointExists { network: String, endpoint: String },

    #[error("macvlan network with id {0} not found")]
    NetworkNotFound(String),

    #[error("endpoint id {0} not found")]
    EndpointNotFound(String),

    #[error("create endpoint was not passed interface IP address")]
    MissingAddress,

    #[error("invalid interface address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("no matching subnet for IP {address} in network {network}")]
    NoMatchingSubnet { address: IpAddr, network: String },

    #[error("failed to save macvlan endpoint {endpoint} to store: {source}")]
    StoreSave {
        endpoint: String,
        #[source]
        source: StoreError,
    },

    #[error("link operation failed: {0}")]
    Link(#[from] LinkError),

    #[error("failure during init of macvlan store: {0}")]
    StoreInit(#[source] StoreError),

    #[error("could not connect to control plane at {endpoint}: {reason}")]
    ControlPlane { endpoint: String, reason: String },
}

impl DriverError {
    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidNetworkId
            | Self::InvalidEndpointId
            | Self::InvalidInterface
            | Self::EmptyIpv4Pool
            | Self::InvalidOption { .. }
            | Self::Ipam { .. }
            | Self::InvalidMode(_)
            | Self::LoopbackParent
            | Self::MissingAddress
            | Self::InvalidAddress { .. }
            | Self::NoMatchingSubnet { .. } => ErrorKind::Validation,
            Self::ParentInUse { .. } | Self::NetworkExists(_) | Self::EndpointExists { .. } => {
                ErrorKind::Conflict
            }
            Self::NetworkNotFound(_) | Self::EndpointNotFound(_) => ErrorKind::NotFound,
            Self::StoreSave { .. } | Self::Link(_) => ErrorKind::Collaborator,
            Self::StoreInit(_) | Self::ControlPlane { .. } => ErrorKind::Init,
        }
    }

    pub(crate) fn invalid_option(option: &str, reason: impl Into<String>) -> Self {
        Self::InvalidOption {
            option: option.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn ipam(network: &str, reason: impl Into<String>) -> Self {
        Self::Ipam {
            network: network.to_string(),
            reason: reason.into(),
        }
    }
}

/// Errors raised by a [`crate::store::Store`] backend
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Errors raised by a [`crate::link::LinkOps`] implementation
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Command execution failed: {command}: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("Network interface operation failed on {interface}: {reason}")]
    Interface { interface: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
