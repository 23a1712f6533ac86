//! Port Reservation Lifecycle Integration Tests
//!
//! Tests the full reservation lifecycle against the running OS:
//! - Reserve / already-taken / release / re-reserve
//! - Batch reservations and their limits
//! - Reclaim of dropped handles
//! - Exclusivity under concurrent reservation
//!
//! Uses the real ephemeral range and bind probing; release verification is
//! covered in release_verification_tests.rs.

use ckp_ports::{NoopNetStat, PortConfig, PortError, PortManager, PortRange};
use std::collections::HashSet;
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Helper: manager for the running OS without port table queries
fn system_manager() -> PortManager {
    PortManager::builder()
        .config(PortConfig::default())
        .netstat(Arc::new(NoopNetStat))
        .build()
}

/// Helper: poll until `condition` holds or `timeout` elapses
fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut condition: F) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    condition()
}

#[test]
fn test_reserve_twice_yields_taken() {
    let manager = system_manager();
    let ephemeral = manager.ephemeral_range();

    // Sample the whole reservable space
    let candidates: Vec<u16> = (1024..=65535u16)
        .step_by(997)
        .filter(|p| !ephemeral.contains(*p))
        .collect();
    assert!(!candidates.is_empty());

    for port in candidates {
        let first = manager.reserve(port).unwrap();
        assert!(first.is_some(), "first reserve of {} should succeed", port);

        let second = manager.reserve(port).unwrap();
        assert!(second.is_none(), "second reserve of {} should be taken", port);

        first.unwrap().close().unwrap();
    }
    assert_eq!(manager.reserved_count(), 0);
}

#[test]
fn test_invalid_ports_always_fail() {
    let manager = system_manager();
    let ephemeral = manager.ephemeral_range();

    let mut invalid: Vec<i64> = vec![0, -1, -1024, 65536, 65537, i64::from(i32::MAX), 1, 22, 1023];
    invalid.push(ephemeral.start as i64);
    invalid.push(ephemeral.end as i64);
    invalid.push(((ephemeral.start as u32 + ephemeral.end as u32) / 2) as i64);

    for port in invalid {
        match manager.reserve(port) {
            Err(PortError::InvalidPort(_)) => {}
            other => panic!("reserve({}) should be InvalidPort, got {:?}", port, other),
        }
        assert!(!manager.is_reservable_port(port));
    }
}

#[test]
fn test_close_then_reserve_again() {
    let manager = system_manager();
    let handle = manager.reserve_port().unwrap();
    let port = handle.port();

    assert_eq!(manager.get_handle(port), Some(handle.clone()));

    handle.close().unwrap();
    assert!(manager.get_handle(port).is_none());

    let again = manager.reserve(port).unwrap();
    assert!(again.is_some());
}

#[test]
fn test_double_close_has_no_effect() {
    let manager = system_manager();
    let handle = manager.reserve_port().unwrap();

    handle.close().unwrap();
    assert!(handle.is_closed());
    handle.close().unwrap();
    assert!(handle.is_closed());
    assert_eq!(manager.reserved_count(), 0);
}

#[test]
fn test_reserve_ports_returns_distinct_ports() {
    let manager = system_manager();
    let ephemeral = manager.ephemeral_range();
    let mut seen: HashSet<u16> = HashSet::new();
    let mut all = Vec::new();

    for n in [1, 2, 4, 8] {
        let handles = manager.reserve_ports(n).unwrap();
        assert_eq!(handles.len(), n as usize);

        let ports: HashSet<u16> = handles.iter().map(|h| h.port()).collect();
        assert_eq!(ports.len(), n as usize, "ports in one batch must be distinct");

        for port in &ports {
            assert!(*port >= 1024);
            assert!(!ephemeral.contains(*port), "{} is ephemeral", port);
            assert!(seen.insert(*port), "{} was already reserved", port);
        }
        all.extend(handles);
    }

    assert_eq!(manager.reserved_count(), 15);
}

#[test]
fn test_reserve_ports_invalid_counts() {
    let manager = system_manager();

    for count in [0i64, -1, 65536] {
        match manager.reserve_ports(count) {
            Err(PortError::InvalidCount(_)) => {}
            other => panic!("reserve_ports({}) should be InvalidCount, got {:?}", count, other),
        }
    }
    assert_eq!(manager.reserved_count(), 0);
}

#[test]
fn test_abandoned_handle_is_reclaimed() {
    let manager = system_manager();
    let port = {
        let handle = manager.reserve_port().unwrap();
        handle.port()
        // Dropped without close
    };

    let reclaimed = wait_until(Duration::from_secs(10), || manager.get_handle(port).is_none());
    assert!(reclaimed, "port {} was never reclaimed", port);

    let again = manager.reserve(port).unwrap();
    assert!(again.is_some(), "port {} should be reservable again", port);
}

#[test]
fn test_concurrent_reserve_port_is_exclusive() {
    const THREADS: usize = 16;
    const PER_THREAD: usize = 25;

    let manager = system_manager();

    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let manager = manager.clone();
            thread::spawn(move || {
                (0..PER_THREAD)
                    .map(|_| manager.reserve_port().unwrap())
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let handles: Vec<_> = workers
        .into_iter()
        .flat_map(|w| w.join().unwrap())
        .collect();

    let ports: HashSet<u16> = handles.iter().map(|h| h.port()).collect();
    assert_eq!(handles.len(), THREADS * PER_THREAD);
    assert_eq!(ports.len(), THREADS * PER_THREAD, "a port was handed out twice");
    assert_eq!(manager.reserved_count(), THREADS * PER_THREAD);
}

#[test]
fn test_concurrent_reserve_of_same_port_has_one_winner() {
    let manager = system_manager();
    let port = manager.reserve_port().unwrap();
    let target = port.port();
    port.close().unwrap();

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let manager = manager.clone();
            thread::spawn(move || manager.reserve(target).unwrap())
        })
        .collect();

    let winners: Vec<_> = workers
        .into_iter()
        .filter_map(|w| w.join().unwrap())
        .collect();
    assert_eq!(winners.len(), 1);
}

#[test]
fn test_reserve_port_skips_ports_bound_elsewhere() {
    // Everything but 65535 is "ephemeral", so 65535 is the only candidate
    let manager = PortManager::builder()
        .config(PortConfig::default())
        .ephemeral_range(PortRange::new(1024, 65534))
        .netstat(Arc::new(NoopNetStat))
        .build();

    let listener = match TcpListener::bind(("0.0.0.0", 65535)) {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("skipping: cannot bind 65535 ({})", e);
            return;
        }
    };

    match manager.reserve_port() {
        Err(PortError::PortsExhausted(_)) => {}
        other => panic!("bound port must be skipped, got {:?}", other),
    }
    assert_eq!(manager.reserved_count(), 0);

    drop(listener);
    let handle = manager.reserve_port().unwrap();
    assert_eq!(handle.port(), 65535);
}

#[test]
fn test_global_manager_is_shared() {
    let first = PortManager::global();
    let second = PortManager::global();

    let handle = first.reserve_port().unwrap();
    assert_eq!(second.get_handle(handle.port()), Some(handle.clone()));
    handle.close().unwrap();
}
