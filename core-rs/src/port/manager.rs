/**
 * manager.rs
 * Process-wide TCP port reservations
 *
 * Each reserved port has:
 * - One bit in the reservation bitmap
 * - One weak registry entry pointing at its live PortRef
 *
 * Both change together under a single lock, so two callers can never be
 * handed the same port. The lock is never held while shelling out for
 * release verification.
 *
 * Reservable space:
 * - 1024-65535
 * - minus the OS ephemeral range (the kernel allocates there on its own)
 *
 * A reservation only covers this process. Another process on the host may
 * still bind the port; release verification exists to catch callers that
 * keep a socket open after releasing.
 */

use crate::config::PortConfig;
use crate::errors::{PortError, Result};
use crate::port::bitmap::PortBitmap;
use crate::port::ephemeral::{system_range, EphemeralRangeProvider, FixedEphemeralRange};
use crate::port::handle::{CloseOptions, HandleInner, PortRef};
use crate::port::netstat::{system_netstat, BusyPort, NetStat};
use crate::port::range::{PortRange, MAX_PORT, MIN_RESERVABLE_PORT};
use once_cell::sync::OnceCell;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, TcpListener};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, error, info};

static GLOBAL_PORT_MANAGER: OnceCell<PortManager> = OnceCell::new();

struct State {
    bitmap: PortBitmap,
    registry: HashMap<u16, Weak<HandleInner>>,
}

/// State shared between the manager and every PortRef it created
pub(crate) struct Shared {
    state: Mutex<State>,
    ephemeral: PortRange,
    netstat: Arc<dyn NetStat>,
    config: PortConfig,
    next_id: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Clear the bit and registry entry for `port`, if `owner` still holds it
    pub(crate) fn release(&self, port: u16, owner: *const HandleInner) -> bool {
        let mut state = self.lock();
        let owned = state
            .registry
            .get(&port)
            .is_some_and(|weak| std::ptr::eq(weak.as_ptr(), owner));
        if !owned {
            return false;
        }
        state.registry.remove(&port);
        state.bitmap.clear(port);
        true
    }

    /// Live handle currently registered for `port`
    pub(crate) fn current_handle(&self, port: u16) -> Option<PortRef> {
        let state = self.lock();
        state.registry.get(&port).and_then(Weak::upgrade).map(PortRef)
    }

    pub(crate) fn release_check_disabled(&self) -> bool {
        self.config.release_check_disabled()
    }

    /// Check the OS port table after a release. Advisory only: logs, never fails.
    pub(crate) fn verify_release(&self, port: u16) {
        let records = match self.netstat.list_busy_ports_on(port) {
            Ok(records) => records,
            Err(e) => {
                debug!(port, error = %e, "Release verification inconclusive");
                return;
            }
        };

        if records.is_empty() {
            if self.netstat.is_conclusive() {
                debug!(port, "Port table reports no sockets on released port");
            } else {
                debug!(port, "Release verification unavailable on this platform");
            }
            return;
        }

        let mut listening = false;
        for record in records.iter().filter(|r| r.is_listening()) {
            listening = true;
            log_still_listening(port, record);
        }
        if !listening {
            debug!(port, sockets = records.len(), "Port released, remaining sockets are not listening");
        }
    }
}

fn log_still_listening(port: u16, record: &BusyPort) {
    let state = record
        .state
        .as_ref()
        .map(|s| s.to_string())
        .unwrap_or_default();
    error!(
        port,
        pid = record.pid,
        command = record.command.as_deref().unwrap_or("?"),
        state = %state,
        "Port {} is still in {} state after its reservation was released; \
         the socket bound to it was closed too late or leaked",
        port,
        state
    );
}

/// Port Manager - hands out exclusive TCP ports within this process
#[derive(Clone)]
pub struct PortManager {
    shared: Arc<Shared>,
}

/// Builder for `PortManager` with injectable platform capabilities
#[derive(Default)]
pub struct PortManagerBuilder {
    config: Option<PortConfig>,
    ephemeral: Option<Box<dyn EphemeralRangeProvider>>,
    netstat: Option<Arc<dyn NetStat>>,
}

impl PortManagerBuilder {
    pub fn config(mut self, config: PortConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn ephemeral_provider<E: EphemeralRangeProvider + 'static>(mut self, provider: E) -> Self {
        self.ephemeral = Some(Box::new(provider));
        self
    }

    pub fn ephemeral_range(self, range: PortRange) -> Self {
        self.ephemeral_provider(FixedEphemeralRange(range))
    }

    pub fn netstat(mut self, netstat: Arc<dyn NetStat>) -> Self {
        self.netstat = Some(netstat);
        self
    }

    pub fn build(self) -> PortManager {
        let config = self.config.unwrap_or_else(PortConfig::from_env);

        // Explicit provider > configured range > OS detection
        let ephemeral = match (self.ephemeral, config.ephemeral_range) {
            (Some(provider), _) => provider.range(),
            (None, Some(range)) => range,
            (None, None) => system_range(),
        };
        let netstat = self
            .netstat
            .unwrap_or_else(|| system_netstat(config.lsof_path.as_deref()));

        info!(
            ephemeral = %ephemeral,
            release_check = !config.release_check_disabled(),
            "Port manager ready"
        );

        PortManager {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    bitmap: PortBitmap::new(),
                    registry: HashMap::new(),
                }),
                ephemeral,
                netstat,
                config,
                next_id: AtomicU64::new(1),
            }),
        }
    }
}

impl PortManager {
    /// Create a PortManager for the running OS, configured from the environment
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn with_config(config: PortConfig) -> Self {
        Self::builder().config(config).build()
    }

    pub fn builder() -> PortManagerBuilder {
        PortManagerBuilder::default()
    }

    /// Process-wide instance, created on first use
    pub fn global() -> &'static PortManager {
        GLOBAL_PORT_MANAGER.get_or_init(PortManager::new)
    }

    /// OS ephemeral range excluded from reservation
    pub fn ephemeral_range(&self) -> PortRange {
        self.shared.ephemeral
    }

    pub fn config(&self) -> &PortConfig {
        &self.shared.config
    }

    /// Port usage query used for release verification
    pub fn netstat(&self) -> &dyn NetStat {
        self.shared.netstat.as_ref()
    }

    /// Test if port may be reserved at all (range rules only, no side effects)
    pub fn is_reservable_port(&self, port: impl Into<i64>) -> bool {
        self.validate(port.into()).is_ok()
    }

    fn validate(&self, port: i64) -> Result<u16> {
        if port < 1 || port > MAX_PORT as i64 {
            return Err(PortError::InvalidPort(format!(
                "port {} is outside 1-{}",
                port, MAX_PORT
            )));
        }
        let port = port as u16;
        if port < MIN_RESERVABLE_PORT {
            return Err(PortError::InvalidPort(format!(
                "port {} is a system port (below {})",
                port, MIN_RESERVABLE_PORT
            )));
        }
        if self.shared.ephemeral.contains(port) {
            return Err(PortError::InvalidPort(format!(
                "port {} is inside the ephemeral range {}",
                port, self.shared.ephemeral
            )));
        }
        Ok(port)
    }

    fn is_candidate(&self, port: u16) -> bool {
        port >= MIN_RESERVABLE_PORT && !self.shared.ephemeral.contains(port)
    }

    /// Claim bit and registry entry. Caller holds the lock.
    fn claim(&self, state: &mut State, port: u16) -> Option<PortRef> {
        if !state.bitmap.test_and_set(port) {
            return None;
        }
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = PortRef::new(id, port, Arc::clone(&self.shared));
        state.registry.insert(port, Arc::downgrade(&handle.0));
        Some(handle)
    }

    /// Reserve one specific port
    ///
    /// # Returns
    /// `Ok(None)` if this process already holds the port
    ///
    /// # Errors
    /// `PortError::InvalidPort` if the port is 0, negative, above 65535,
    /// a system port, or inside the ephemeral range
    pub fn reserve(&self, port: impl Into<i64>) -> Result<Option<PortRef>> {
        let port = self.validate(port.into())?;
        let handle = {
            let mut state = self.shared.lock();
            self.claim(&mut state, port)
        };
        match &handle {
            Some(h) => debug!(port, id = h.id(), "Reserved port"),
            None => debug!(port, "Port already reserved"),
        }
        Ok(handle)
    }

    /// Reserve any free port
    ///
    /// Scans from a random position so separate processes on one host tend
    /// not to pick the same ports. With `probeBind`, ports some other process
    /// is bound to are skipped.
    ///
    /// # Errors
    /// `PortError::PortsExhausted` if no reservable port is left
    pub fn reserve_port(&self) -> Result<PortRef> {
        let mut start = rand::thread_rng().gen_range(MIN_RESERVABLE_PORT..=MAX_PORT);
        let mut busy: HashSet<u16> = HashSet::new();

        loop {
            let handle = {
                let mut state = self.shared.lock();
                state
                    .bitmap
                    .find_clear_from(start, |p| self.is_candidate(p) && !busy.contains(&p))
                    .and_then(|port| self.claim(&mut state, port))
            };

            let handle = handle.ok_or_else(|| {
                PortError::PortsExhausted(format!(
                    "no free port in 1024-65535 outside the ephemeral range {} ({} in use by other processes)",
                    self.shared.ephemeral,
                    busy.len()
                ))
            })?;

            let port = handle.port();
            if !self.shared.config.probe_bind || is_bindable(port) {
                debug!(port, id = handle.id(), "Reserved free port");
                return Ok(handle);
            }

            debug!(port, "Port is bound by another process, skipping");
            busy.insert(port);
            // Nothing registered a callback yet
            let _ = handle.close_with(CloseOptions::skip_release_check());
            start = port.wrapping_add(1);
        }
    }

    /// Reserve `count` free ports, not necessarily contiguous
    ///
    /// All or nothing: if one reservation fails, the ports already claimed
    /// by this call are released before the error is returned.
    pub fn reserve_ports(&self, count: impl Into<i64>) -> Result<Vec<PortRef>> {
        let count = count.into();
        if count < 1 || count > MAX_PORT as i64 {
            return Err(PortError::InvalidCount(format!(
                "cannot reserve {} ports, count must be within 1-{}",
                count, MAX_PORT
            )));
        }

        let mut handles = Vec::with_capacity(count as usize);
        for _ in 0..count {
            match self.reserve_port() {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    debug!(claimed = handles.len(), error = %e, "Rolling back partial batch");
                    for handle in handles {
                        let _ = handle.close_with(CloseOptions::skip_release_check());
                    }
                    return Err(e);
                }
            }
        }
        Ok(handles)
    }

    /// Live handle for a port
    ///
    /// # Returns
    /// None if the port is not reserved (including right after close)
    pub fn get_handle(&self, port: impl Into<i64>) -> Option<PortRef> {
        let port = u16::try_from(port.into()).ok()?;
        self.shared.current_handle(port)
    }

    /// Release a handle; same as `handle.close_with(options)`
    pub fn close(&self, handle: &PortRef, options: CloseOptions) -> Result<()> {
        handle.close_with(options)
    }

    /// Ports currently reserved, ascending
    pub fn reserved_ports(&self) -> Vec<u16> {
        self.shared.lock().bitmap.iter_set().collect()
    }

    pub fn reserved_count(&self) -> usize {
        self.shared.lock().bitmap.count()
    }

    /// Number of ports this manager could ever hand out
    pub fn reservable_capacity(&self) -> usize {
        let user_space = PortRange::new(MIN_RESERVABLE_PORT, MAX_PORT);
        let ephemeral = self.shared.ephemeral;
        let overlap_start = ephemeral.start.max(user_space.start);
        let overlap_end = ephemeral.end.min(user_space.end);
        user_space.len() - PortRange::new(overlap_start, overlap_end).len()
    }
}

impl Default for PortManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Test if nothing else on the host is bound to the port
pub fn is_bindable(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).is_ok()
}
