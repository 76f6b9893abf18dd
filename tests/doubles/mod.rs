// File: tests/doubles/mod.rs

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};

use macni::error::{LinkError, StoreError};
use macni::link::{LinkHandle, LinkOps, MacvlanLink};
use macni::types::{
    AllocateNetworkRequest, CreateEndpointRequest, DeleteEndpointRequest, EndpointInterface,
    FreeNetworkRequest, IpamData, Options,
};
use macni::{Driver, EndpointRecord, Store};

pub const CONTROL_PLANE: &str = "http://localhost:6732";

/// Holds one `save` until the test lets it go
pub struct SaveGate {
    armed: AtomicBool,
    entered: Barrier,
    release: Barrier,
}

impl Default for SaveGate {
    fn default() -> Self {
        Self {
            armed: AtomicBool::new(false),
            entered: Barrier::new(2),
            release: Barrier::new(2),
        }
    }
}

impl SaveGate {
    /// Make the next `save` block until `open` is called
    pub fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    /// Wait until the gated `save` has been entered
    pub fn wait_entered(&self) {
        self.entered.wait();
    }

    pub fn open(&self) {
        self.release.wait();
    }

    fn pass(&self) {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.entered.wait();
            self.release.wait();
        }
    }
}

/// In-memory store that can be told to fail
#[derive(Default)]
pub struct RecordingStore {
    pub gate: SaveGate,
    pub records: Mutex<HashMap<String, EndpointRecord>>,
    pub seeded: Mutex<Vec<EndpointRecord>>,
    pub fail_init: AtomicBool,
    pub fail_save: AtomicBool,
    pub fail_delete: AtomicBool,
    pub init_calls: AtomicUsize,
    pub delete_calls: AtomicUsize,
}

impl RecordingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_records(records: Vec<EndpointRecord>) -> Arc<Self> {
        let store = Self::default();
        {
            let mut stored = store.records.lock().unwrap();
            for record in &records {
                stored.insert(record.id.clone(), record.clone());
            }
        }
        *store.seeded.lock().unwrap() = records;
        Arc::new(store)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.lock().unwrap().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }
}

impl Store for RecordingStore {
    fn init_store(&self) -> Result<Vec<EndpointRecord>, StoreError> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_init.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("store unavailable".to_string()));
        }
        Ok(self.seeded.lock().unwrap().clone())
    }

    fn save(&self, record: &EndpointRecord) -> Result<(), StoreError> {
        self.gate.pass();
        if self.fail_save.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("write rejected".to_string()));
        }
        self.records
            .lock()
            .unwrap()
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    fn delete(&self, record: &EndpointRecord) -> Result<(), StoreError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("delete rejected".to_string()));
        }
        self.records.lock().unwrap().remove(&record.id);
        Ok(())
    }
}

/// Host links simulated as a set of names
#[derive(Default)]
pub struct FakeLinks {
    pub existing: Mutex<HashSet<String>>,
    pub created: Mutex<Vec<MacvlanLink>>,
    pub deleted: Mutex<Vec<String>>,
    pub fail_lookup: AtomicBool,
    pub fail_delete: AtomicBool,
    pub fail_create: AtomicBool,
}

impl FakeLinks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn exists(&self, name: &str) -> bool {
        self.existing.lock().unwrap().contains(name)
    }
}

impl LinkOps for FakeLinks {
    fn lookup_interface(&self, name: &str) -> Result<Option<LinkHandle>, LinkError> {
        if self.fail_lookup.load(Ordering::SeqCst) {
            return Err(LinkError::Interface {
                interface: name.to_string(),
                reason: "netlink unavailable".to_string(),
            });
        }
        Ok(self.exists(name).then(|| LinkHandle {
            name: name.to_string(),
            index: 42,
        }))
    }

    fn delete_interface(&self, link: &LinkHandle) -> Result<(), LinkError> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(LinkError::CommandFailed {
                command: format!("ip link delete dev {}", link.name),
                stderr: "Operation not permitted".to_string(),
            });
        }
        self.existing.lock().unwrap().remove(&link.name);
        self.deleted.lock().unwrap().push(link.name.clone());
        Ok(())
    }

    fn create_macvlan(&self, link: &MacvlanLink) -> Result<(), LinkError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(LinkError::CommandFailed {
                command: format!("ip link add {}", link.name),
                stderr: "RTNETLINK answers: File exists".to_string(),
            });
        }
        self.existing.lock().unwrap().insert(link.name.clone());
        self.created.lock().unwrap().push(link.clone());
        Ok(())
    }
}

pub fn driver() -> (Driver, Arc<RecordingStore>, Arc<FakeLinks>) {
    let store = RecordingStore::new();
    let links = FakeLinks::new();
    let driver = Driver::new(store.clone(), links.clone(), CONTROL_PLANE).unwrap();
    (driver, store, links)
}

pub fn allocate_request(id: &str, parent: &str, pools: &[&str]) -> AllocateNetworkRequest {
    let mut options = Options::new();
    options.insert("parent".to_string(), parent.into());
    AllocateNetworkRequest {
        network_id: id.to_string(),
        options,
        ipv4_data: pools.iter().map(|p| IpamData::pool(p)).collect(),
        ipv6_data: Vec::new(),
    }
}

pub fn free_request(id: &str) -> FreeNetworkRequest {
    FreeNetworkRequest {
        network_id: id.to_string(),
    }
}

pub fn create_request(network: &str, endpoint: &str, address: &str) -> CreateEndpointRequest {
    CreateEndpointRequest {
        network_id: network.to_string(),
        endpoint_id: endpoint.to_string(),
        interface: Some(EndpointInterface {
            address: address.to_string(),
            ..Default::default()
        }),
        options: Options::new(),
    }
}

pub fn delete_request(network: &str, endpoint: &str) -> DeleteEndpointRequest {
    DeleteEndpointRequest {
        network_id: network.to_string(),
        endpoint_id: endpoint.to_string(),
    }
}
