// File: tests/concurrency_test.rs

mod doubles;

use doubles::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use macni::{DriverError, ErrorKind};

const THREADS: usize = 16;

#[test]
fn test_parallel_allocation_on_one_parent() {
    let (driver, _, _) = driver();
    let winners = AtomicUsize::new(0);
    let conflicts = AtomicUsize::new(0);

    thread::scope(|s| {
        for i in 0..THREADS {
            let driver = &driver;
            let winners = &winners;
            let conflicts = &conflicts;
            s.spawn(move || {
                let req = allocate_request(&format!("net{}", i), "eth1", &["10.0.0.0/24"]);
                match driver.allocate_network(&req) {
                    Ok(_) => {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(e) => {
                        assert_eq!(e.kind(), ErrorKind::Conflict, "{}", e);
                        conflicts.fetch_add(1, Ordering::SeqCst);
                    }
                }
            });
        }
    });

    assert_eq!(winners.load(Ordering::SeqCst), 1);
    assert_eq!(conflicts.load(Ordering::SeqCst), THREADS - 1);
    assert_eq!(driver.network_count(), 1);
}

#[test]
fn test_parallel_allocation_on_distinct_parents() {
    let (driver, _, _) = driver();

    thread::scope(|s| {
        for i in 0..THREADS {
            let driver = &driver;
            s.spawn(move || {
                let req = allocate_request(&format!("net{}", i), &format!("eth{}", i), &["10.0.0.0/24"]);
                driver.allocate_network(&req).unwrap();
            });
        }
    });

    assert_eq!(driver.network_count(), THREADS);
}

#[test]
fn test_parallel_endpoint_creation_across_networks() {
    let (driver, store, _) = driver();
    for n in 0..4 {
        let pool = format!("10.{}.0.0/24", n);
        driver
            .allocate_network(&allocate_request(&format!("net{}", n), &format!("eth{}", n), &[&pool]))
            .unwrap();
    }

    thread::scope(|s| {
        for n in 0..4 {
            for e in 0..THREADS {
                let driver = &driver;
                s.spawn(move || {
                    let req = create_request(
                        &format!("net{}", n),
                        &format!("ep{}-{}", n, e),
                        &format!("10.{}.0.{}/24", n, e + 2),
                    );
                    let resp = driver.create_endpoint(&req).unwrap();
                    let mac = resp.interface.unwrap().mac_address;
                    assert_eq!(mac, format!("02:42:0a:{:02x}:00:{:02x}", n, e + 2));
                });
            }
        }
    });

    for n in 0..4 {
        assert_eq!(driver.network(&format!("net{}", n)).unwrap().endpoint_count(), THREADS);
    }
    assert_eq!(store.len(), 4 * THREADS);
}

#[test]
fn test_parallel_duplicate_endpoint_has_one_winner() {
    let (driver, store, _) = driver();
    driver
        .allocate_network(&allocate_request("net1", "eth1", &["10.0.0.0/24"]))
        .unwrap();
    let created = AtomicUsize::new(0);

    thread::scope(|s| {
        for i in 0..THREADS {
            let driver = &driver;
            let created = &created;
            s.spawn(move || {
                let req = create_request("net1", "ep1", &format!("10.0.0.{}/24", i + 2));
                match driver.create_endpoint(&req) {
                    Ok(_) => {
                        created.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(e) => assert!(matches!(e, DriverError::EndpointExists { .. }), "{}", e),
                }
            });
        }
    });

    assert_eq!(created.load(Ordering::SeqCst), 1);
    let network = driver.network("net1").unwrap();
    assert_eq!(network.endpoint_count(), 1);
    let ep = network.endpoint("ep1").unwrap();
    assert_eq!(store.records.lock().unwrap()["ep1"], ep.to_record());
}

#[test]
fn test_free_while_creating_endpoints() {
    let (driver, store, _) = driver();
    driver
        .allocate_network(&allocate_request("net1", "eth1", &["10.0.0.0/24"]))
        .unwrap();

    thread::scope(|s| {
        for e in 0..THREADS {
            let driver = &driver;
            s.spawn(move || {
                let req = create_request("net1", &format!("ep{}", e), &format!("10.0.0.{}/24", e + 2));
                match driver.create_endpoint(&req) {
                    Ok(_) => {}
                    Err(err) => assert!(matches!(err, DriverError::NetworkNotFound(_)), "{}", err),
                }
            });
        }
        s.spawn(|| {
            driver.free_network(&free_request("net1")).unwrap();
        });
    });

    assert!(driver.network("net1").is_none());
    assert_eq!(store.len(), 0);
    driver
        .allocate_network(&allocate_request("net2", "eth1", &["10.0.0.0/24"]))
        .unwrap();
}

#[test]
fn test_create_interrupted_by_free_leaves_no_record() {
    let (driver, store, _) = driver();
    driver
        .allocate_network(&allocate_request("net1", "eth1", &["10.0.0.0/24"]))
        .unwrap();
    store.gate.arm();

    thread::scope(|s| {
        let creating = s.spawn(|| driver.create_endpoint(&create_request("net1", "ep1", "10.0.0.5/24")));

        // the record is being written while the network goes away
        store.gate.wait_entered();
        let report = driver.free_network(&free_request("net1")).unwrap();
        assert!(report.found);
        assert!(report.released.is_empty());
        store.gate.open();

        let err = creating.join().unwrap().unwrap_err();
        assert!(matches!(err, DriverError::NetworkNotFound(_)), "{}", err);
    });

    assert!(!store.contains("ep1"));
    assert_eq!(store.len(), 0);
    assert!(driver.network("net1").is_none());
}

#[test]
fn test_parallel_identical_creates_converge() {
    let (driver, store, _) = driver();
    driver
        .allocate_network(&allocate_request("net1", "eth1", &["10.0.0.0/24"]))
        .unwrap();

    thread::scope(|s| {
        for _ in 0..THREADS {
            let driver = &driver;
            s.spawn(move || {
                let resp = driver
                    .create_endpoint(&create_request("net1", "ep1", "10.0.0.5/24"))
                    .unwrap();
                assert_eq!(resp.interface.unwrap().mac_address, "02:42:0a:00:00:05");
            });
        }
    });

    let network = driver.network("net1").unwrap();
    assert_eq!(network.endpoint_count(), 1);
    assert_eq!(
        store.records.lock().unwrap()["ep1"],
        network.endpoint("ep1").unwrap().to_record()
    );
}
