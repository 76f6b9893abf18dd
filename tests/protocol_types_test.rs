// File: tests/protocol_types_test.rs

mod doubles;

use doubles::*;
use serde_json::{json, Value};

use macni::commands::{self, dispatch, handle};
use macni::types::{
    AllocateNetworkRequest, CapabilitiesResponse, CreateEndpointRequest, JoinResponse, InterfaceName,
    Request,
};

#[test]
fn test_allocate_request_wire_names() -> Result<(), Box<dyn std::error::Error>> {
    let body = json!({
        "NetworkID": "net1",
        "Options": {"com.docker.network.generic": {"parent": "eth1", "macvlan_mode": "vepa"}},
        "IPv4Data": [{
            "AddressSpace": "GlobalDefault",
            "Pool": "10.0.0.0/24",
            "Gateway": "10.0.0.1/24",
            "AuxAddresses": {}
        }],
        "IPv6Data": []
    });

    let req: AllocateNetworkRequest = serde_json::from_value(body)?;
    assert_eq!(req.network_id, "net1");
    assert_eq!(req.ipv4_data.len(), 1);
    assert_eq!(req.ipv4_data[0].pool, "10.0.0.0/24");
    assert_eq!(req.ipv4_data[0].gateway, "10.0.0.1/24");
    assert!(req.ipv6_data.is_empty());

    Ok(())
}

#[test]
fn test_create_endpoint_request_without_interface() -> Result<(), Box<dyn std::error::Error>> {
    let req: CreateEndpointRequest = serde_json::from_value(json!({
        "NetworkID": "net1",
        "EndpointID": "ep1"
    }))?;
    assert!(req.interface.is_none());
    assert!(req.options.is_empty());

    Ok(())
}

#[test]
fn test_response_serialization() -> Result<(), Box<dyn std::error::Error>> {
    let caps = CapabilitiesResponse {
        scope: "global".to_string(),
        connectivity_scope: String::new(),
    };
    assert_eq!(serde_json::to_value(&caps)?, json!({"Scope": "global"}));

    let join = JoinResponse {
        interface_name: InterfaceName {
            src_name: "vethabcdef0".to_string(),
            dst_prefix: "eth".to_string(),
        },
        ..Default::default()
    };
    let value = serde_json::to_value(&join)?;
    assert_eq!(value["InterfaceName"]["SrcName"], "vethabcdef0");
    assert_eq!(value["InterfaceName"]["DstPrefix"], "eth");

    Ok(())
}

#[test]
fn test_activate_and_capabilities() -> Result<(), Box<dyn std::error::Error>> {
    let (driver, _, _) = driver();

    let activated = dispatch(&driver, commands::ACTIVATE, &Value::Null)?;
    assert_eq!(activated, json!({"Implements": ["NetworkDriver"]}));

    let caps = dispatch(&driver, commands::GET_CAPABILITIES, &Value::Null)?;
    assert_eq!(caps["Scope"], "global");

    Ok(())
}

#[test]
fn test_network_lifecycle_over_dispatch() -> Result<(), Box<dyn std::error::Error>> {
    let (driver, _, _) = driver();

    let allocated = dispatch(
        &driver,
        commands::ALLOCATE_NETWORK,
        &json!({
            "NetworkID": "net1",
            "Options": {"parent": "eth1"},
            "IPv4Data": [{"Pool": "10.0.0.0/24"}]
        }),
    )?;
    assert_eq!(allocated, json!({"Options": {"parent": "eth1"}}));

    let created = dispatch(
        &driver,
        commands::CREATE_ENDPOINT,
        &json!({
            "NetworkID": "net1",
            "EndpointID": "ep1",
            "Interface": {"Address": "10.0.0.5/24"}
        }),
    )?;
    assert_eq!(created["Interface"]["MacAddress"], "02:42:0a:00:00:05");

    let info = dispatch(
        &driver,
        commands::ENDPOINT_INFO,
        &json!({"NetworkID": "net1", "EndpointID": "ep1"}),
    )?;
    assert_eq!(info["Value"]["address"], "10.0.0.5/24");

    let deleted = dispatch(
        &driver,
        commands::DELETE_ENDPOINT,
        &json!({"NetworkID": "net1", "EndpointID": "ep1"}),
    )?;
    assert_eq!(deleted, json!({}));

    let freed = dispatch(&driver, commands::FREE_NETWORK, &json!({"NetworkID": "net1"}))?;
    assert_eq!(freed, json!({}));
    assert_eq!(driver.network_count(), 0);

    Ok(())
}

#[test]
fn test_noop_methods_answer_empty() -> Result<(), Box<dyn std::error::Error>> {
    let (driver, _, _) = driver();

    for method in [commands::CREATE_NETWORK, commands::DELETE_NETWORK] {
        assert_eq!(dispatch(&driver, method, &json!({"NetworkID": "net1"}))?, json!({}));
    }
    for method in [commands::DISCOVER_NEW, commands::DISCOVER_DELETE] {
        let body = json!({"DiscoveryType": 1, "DiscoveryData": {"Address": "10.1.1.1"}});
        assert_eq!(dispatch(&driver, method, &body)?, json!({}));
    }
    for method in [
        commands::PROGRAM_EXTERNAL_CONNECTIVITY,
        commands::REVOKE_EXTERNAL_CONNECTIVITY,
    ] {
        let body = json!({"NetworkID": "net1", "EndpointID": "ep1"});
        assert_eq!(dispatch(&driver, method, &body)?, json!({}));
    }

    Ok(())
}

#[test]
fn test_errors_become_err_bodies() -> Result<(), Box<dyn std::error::Error>> {
    let (driver, _, _) = driver();

    let unknown = handle(&driver, &Request {
        method: "NetworkDriver.Bogus".to_string(),
        body: Value::Null,
    });
    let err = unknown["Err"].as_str().unwrap_or_default();
    assert!(err.contains("Unknown driver method"), "unexpected: {}", unknown);

    let rejected = handle(
        &driver,
        &Request::new(
            commands::ALLOCATE_NETWORK,
            &json!({"NetworkID": "net1", "Options": {"parent": "lo"}, "IPv4Data": [{"Pool": "10.0.0.0/24"}]}),
        )?,
    );
    assert!(rejected["Err"].is_string());
    assert_eq!(driver.network_count(), 0);

    let malformed = handle(&driver, &Request {
        method: commands::CREATE_ENDPOINT.to_string(),
        body: json!({"NetworkID": 7}),
    });
    assert!(malformed["Err"].as_str().unwrap_or_default().contains("CreateEndpoint"));

    Ok(())
}

#[test]
fn test_free_of_unknown_network_is_success() {
    let (driver, _, _) = driver();
    let response = handle(&driver, &Request {
        method: commands::FREE_NETWORK.to_string(),
        body: json!({"NetworkID": "never-allocated"}),
    });
    assert_eq!(response, json!({}));
}
