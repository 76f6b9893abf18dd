use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error};

use crate::plugin::Driver;
use crate::types::{
    ActivateResponse, AllocateNetworkRequest, CreateEndpointRequest, CreateNetworkRequest,
    DeleteEndpointRequest, DeleteNetworkRequest, DiscoveryNotification, ErrorResponse,
    FreeNetworkRequest, InfoRequest, JoinRequest, LeaveRequest, ProgramExternalConnectivityRequest,
    Request, RevokeExternalConnectivityRequest,
};

pub const ACTIVATE: &str = "Plugin.Activate";
pub const GET_CAPABILITIES: &str = "NetworkDriver.GetCapabilities";
pub const ALLOCATE_NETWORK: &str = "NetworkDriver.AllocateNetwork";
pub const FREE_NETWORK: &str = "NetworkDriver.FreeNetwork";
pub const CREATE_NETWORK: &str = "NetworkDriver.CreateNetwork";
pub const DELETE_NETWORK: &str = "NetworkDriver.DeleteNetwork";
pub const CREATE_ENDPOINT: &str = "NetworkDriver.CreateEndpoint";
pub const DELETE_ENDPOINT: &str = "NetworkDriver.DeleteEndpoint";
pub const ENDPOINT_INFO: &str = "NetworkDriver.EndpointOperInfo";
pub const JOIN: &str = "NetworkDriver.Join";
pub const LEAVE: &str = "NetworkDriver.Leave";
pub const DISCOVER_NEW: &str = "NetworkDriver.DiscoverNew";
pub const DISCOVER_DELETE: &str = "NetworkDriver.DiscoverDelete";
pub const PROGRAM_EXTERNAL_CONNECTIVITY: &str = "NetworkDriver.ProgramExternalConnectivity";
pub const REVOKE_EXTERNAL_CONNECTIVITY: &str = "NetworkDriver.RevokeExternalConnectivity";

/// Interface implemented by this plugin
pub const NETWORK_DRIVER: &str = "NetworkDriver";

fn parse<T: DeserializeOwned>(method: &str, body: &Value) -> Result<T> {
    serde_json::from_value(body.clone())
        .with_context(|| format!("Failed to parse {} request", method))
}

fn reply<T: Serialize>(response: &T) -> Result<Value> {
    serde_json::to_value(response).context("Failed to encode response")
}

fn empty() -> Value {
    Value::Object(Default::default())
}

/// Route one named operation to the driver
pub fn dispatch(driver: &Driver, method: &str, body: &Value) -> Result<Value> {
    debug!("Dispatching {}", method);

    match method {
        ACTIVATE => reply(&ActivateResponse {
            implements: vec![NETWORK_DRIVER.to_string()],
        }),
        GET_CAPABILITIES => reply(&driver.get_capabilities()),
        ALLOCATE_NETWORK => {
            let req: AllocateNetworkRequest = parse(method, body)?;
            reply(&driver.allocate_network(&req)?)
        }
        FREE_NETWORK => {
            let req: FreeNetworkRequest = parse(method, body)?;
            driver.free_network(&req)?;
            Ok(empty())
        }
        // Networks are materialised through Allocate/Free in global scope
        CREATE_NETWORK => {
            let req: CreateNetworkRequest = parse(method, body)?;
            debug!("CreateNetwork macvlan with networkID={}", req.network_id);
            Ok(empty())
        }
        DELETE_NETWORK => {
            let req: DeleteNetworkRequest = parse(method, body)?;
            debug!("DeleteNetwork macvlan with networkID={}", req.network_id);
            Ok(empty())
        }
        CREATE_ENDPOINT => {
            let req: CreateEndpointRequest = parse(method, body)?;
            reply(&driver.create_endpoint(&req)?)
        }
        DELETE_ENDPOINT => {
            let req: DeleteEndpointRequest = parse(method, body)?;
            driver.delete_endpoint(&req)?;
            Ok(empty())
        }
        ENDPOINT_INFO => {
            let req: InfoRequest = parse(method, body)?;
            reply(&driver.endpoint_info(&req)?)
        }
        JOIN => {
            let req: JoinRequest = parse(method, body)?;
            reply(&driver.join(&req)?)
        }
        LEAVE => {
            let req: LeaveRequest = parse(method, body)?;
            driver.leave(&req)?;
            Ok(empty())
        }
        DISCOVER_NEW => {
            let req: DiscoveryNotification = parse(method, body)?;
            driver.discover_new(&req)?;
            Ok(empty())
        }
        DISCOVER_DELETE => {
            let req: DiscoveryNotification = parse(method, body)?;
            driver.discover_delete(&req)?;
            Ok(empty())
        }
        PROGRAM_EXTERNAL_CONNECTIVITY => {
            let req: ProgramExternalConnectivityRequest = parse(method, body)?;
            driver.program_external_connectivity(&req)?;
            Ok(empty())
        }
        REVOKE_EXTERNAL_CONNECTIVITY => {
            let req: RevokeExternalConnectivityRequest = parse(method, body)?;
            driver.revoke_external_connectivity(&req)?;
            Ok(empty())
        }
        _ => anyhow::bail!("Unknown driver method: {}", method),
    }
}

/// Answer a request, turning failures into the protocol's error shape
pub fn handle(driver: &Driver, request: &Request) -> Value {
    match dispatch(driver, &request.method, &request.body) {
        Ok(value) => value,
        Err(err) => {
            error!("{} failed: {:#}", request.method, err);
            error_response(&format!("{:#}", err))
        }
    }
}

/// Protocol error body
pub fn error_response(message: &str) -> Value {
    serde_json::to_value(ErrorResponse {
        err: message.to_string(),
    })
    .unwrap_or_else(|_| Value::String(message.to_string()))
}
