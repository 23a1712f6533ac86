//! Port Reservation Contract Tests
//!
//! These tests verify INVARIANTS that MUST NEVER BREAK regardless of implementation.
//! They document WHY the reservation rules are what they are.
//!
//! **Problem**: "Simplifying" the reservation path quietly hands one port to two kernels
//! **Solution**: Contract tests that fail with clear explanation of what's being sacrificed

use ckp_ports::{
    BusyPort, CloseOptions, ConnectionState, NetStat, NoopNetStat, PortConfig, PortError,
    PortManager, PortRange,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

const EPHEMERAL: PortRange = PortRange {
    start: 32768,
    end: 60999,
};

fn contract_manager(netstat: Arc<dyn NetStat>) -> PortManager {
    PortManager::builder()
        .config(PortConfig {
            probe_bind: false,
            ..PortConfig::default()
        })
        .ephemeral_range(EPHEMERAL)
        .netstat(netstat)
        .build()
}

/// WHY: Ports below 1024 are privileged and belong to system services
/// REASON: Kernels run unprivileged; binding there fails or hijacks a service
/// BREAKS: Kernel startup on every non-root host
/// SACRIFICES: If this fails, you're handing out ports nobody can bind
#[test]
fn system_ports_are_never_reservable() {
    let manager = contract_manager(Arc::new(NoopNetStat));

    for port in 1..1024i64 {
        assert!(!manager.is_reservable_port(port), "port {} is a system port", port);
        assert!(matches!(manager.reserve(port), Err(PortError::InvalidPort(_))));
    }

    // If this test fails, ask yourself:
    // "Did I widen the range to get more ports?"
    // "Do I understand the OS will refuse the bind anyway?"
}

/// WHY: The OS assigns ephemeral ports to outgoing connections on its own
/// REASON: A reserved ephemeral port can be taken by any connect() at any time
/// BREAKS: Exclusivity - the reservation is worthless
/// SACRIFICES: If this fails, you're racing the kernel's own allocator
#[test]
fn ephemeral_range_is_never_reservable() {
    let manager = contract_manager(Arc::new(NoopNetStat));

    for port in [EPHEMERAL.start, EPHEMERAL.start + 1, 45000, EPHEMERAL.end] {
        assert!(!manager.is_reservable_port(port));
    }

    let handles = manager.reserve_ports(500).unwrap();
    for handle in &handles {
        assert!(
            !EPHEMERAL.contains(handle.port()),
            "reserve_port handed out ephemeral port {}",
            handle.port()
        );
    }
}

/// WHY: One port, one holder, inside this process
/// REASON: Concurrent kernels and test workers all reserve from one manager
/// BREAKS: Two kernels bind the same port, one dies with EADDRINUSE
/// SACRIFICES: If this fails, you've broken the only guarantee this crate makes
#[test]
fn reservations_are_exclusive_under_concurrency() {
    let manager = contract_manager(Arc::new(NoopNetStat));

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let manager = manager.clone();
            thread::spawn(move || {
                let mut mine = Vec::new();
                for port in 20000..20100u16 {
                    if let Some(handle) = manager.reserve(port).unwrap() {
                        mine.push(handle);
                    }
                }
                mine.extend(manager.reserve_ports(20).unwrap());
                mine
            })
        })
        .collect();

    let handles: Vec<_> = workers.into_iter().flat_map(|w| w.join().unwrap()).collect();
    let ports: HashSet<u16> = handles.iter().map(|h| h.port()).collect();

    assert_eq!(ports.len(), handles.len(), "a port was handed out twice");
    // Every port in 20000-20099 was won exactly once
    assert_eq!((20000..20100u16).filter(|p| ports.contains(p)).count(), 100);
}

/// Reports every queried port as still listening
struct AlwaysListening;

impl NetStat for AlwaysListening {
    fn list_busy_ports(&self) -> ckp_ports::Result<Vec<BusyPort>> {
        Ok(Vec::new())
    }

    fn list_busy_ports_on(&self, port: u16) -> ckp_ports::Result<Vec<BusyPort>> {
        Ok(vec![BusyPort {
            pid: 1,
            command: None,
            protocol: "TCP".to_string(),
            local_address: "*".to_string(),
            local_port: port,
            remote: None,
            state: Some(ConnectionState::Listen),
        }])
    }
}

/// WHY: Release verification is advisory
/// REASON: The socket owner is the one at fault, not the caller of close()
/// BREAKS: Shutdown paths that close() in a loop and stop at the first error
/// SACRIFICES: If this fails, a leaked socket also leaks the reservation
#[test]
fn verification_never_blocks_or_undoes_release() {
    let manager = contract_manager(Arc::new(AlwaysListening));

    let handle = manager.reserve(21000).unwrap().unwrap();
    assert!(handle.close().is_ok());
    assert!(manager.get_handle(21000).is_none());
    assert!(manager.reserve(21000).unwrap().is_some());
}

/// WHY: A handle nobody closes must not pin its port forever
/// REASON: Panicking tests and early returns drop handles without close()
/// BREAKS: Long test runs slowly exhaust the reservable space
/// SACRIFICES: If this fails, every forgotten close() is a permanent leak
#[test]
fn dropping_every_clone_releases_the_port() {
    let manager = contract_manager(Arc::new(NoopNetStat));

    let handle = manager.reserve(21001).unwrap().unwrap();
    let clone = handle.clone();
    drop(handle);
    assert!(manager.get_handle(21001).is_some(), "a live clone still holds the port");

    drop(clone);
    assert!(manager.get_handle(21001).is_none());
    assert!(manager.reserve(21001).unwrap().is_some());
}

/// Reserves another port from a separate thread while verification runs
struct ReservesDuringVerification {
    manager: OnceLock<PortManager>,
    reserved: AtomicBool,
}

impl NetStat for ReservesDuringVerification {
    fn list_busy_ports(&self) -> ckp_ports::Result<Vec<BusyPort>> {
        Ok(Vec::new())
    }

    fn list_busy_ports_on(&self, _port: u16) -> ckp_ports::Result<Vec<BusyPort>> {
        if let Some(manager) = self.manager.get() {
            let manager = manager.clone();
            let (tx, rx) = mpsc::channel();
            thread::spawn(move || {
                let handle = manager.reserve(21003).unwrap();
                let _ = tx.send(handle.is_some());
            });
            let ok = rx.recv_timeout(Duration::from_secs(5)).unwrap_or(false);
            self.reserved.store(ok, Ordering::SeqCst);
        }
        Ok(Vec::new())
    }
}

/// WHY: Verification shells out to lsof, which can take seconds
/// REASON: The reservation lock is shared by every kernel in the process
/// BREAKS: One close() stalls every reserve() behind an lsof call
/// SACRIFICES: If this fails, release latency becomes everyone's latency
#[test]
fn verification_runs_without_the_reservation_lock() {
    let netstat = Arc::new(ReservesDuringVerification {
        manager: OnceLock::new(),
        reserved: AtomicBool::new(false),
    });
    let manager = contract_manager(netstat.clone());
    let _ = netstat.manager.set(manager.clone());

    let handle = manager.reserve(21002).unwrap().unwrap();
    handle.close_with(CloseOptions::default()).unwrap();

    assert!(
        netstat.reserved.load(Ordering::SeqCst),
        "reserve() blocked while release verification was running"
    );
}
