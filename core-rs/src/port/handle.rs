/**
 * handle.rs
 * Caller-held token for one reserved port
 *
 * Lifecycle:
 * - Created only by PortManager, inside a successful reservation
 * - Open -> Closed on the first close() (later calls are no-ops)
 * - Open -> Reclaimed when the last clone is dropped without close()
 *
 * Clones share one reservation. The manager only keeps a weak reference,
 * so dropping every clone always gives the port back.
 */

use crate::errors::{PortError, Result};
use crate::port::manager::Shared;
use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// Callback run when a reservation is released.
///
/// Receives the port and the handle currently registered for it, if the
/// port was already reserved again by the time the callback runs.
pub type CloseCallback = Box<dyn FnOnce(u16, Option<PortRef>) -> anyhow::Result<()> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseState {
    Open,
    /// Released by an explicit close()
    Closed,
    /// Released because every clone was dropped
    Reclaimed,
}

/// Options for `PortRef::close_with`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseOptions {
    pub verify_release: bool,
}

impl Default for CloseOptions {
    fn default() -> Self {
        CloseOptions {
            verify_release: true,
        }
    }
}

impl CloseOptions {
    /// Skip the post-release port table check, for callers that knowingly
    /// release before shutting down a socket bound to the port
    pub fn skip_release_check() -> Self {
        CloseOptions {
            verify_release: false,
        }
    }
}

struct HandleState {
    close_state: CloseState,
    callbacks: Vec<CloseCallback>,
}

pub(crate) struct HandleInner {
    id: u64,
    port: u16,
    manager: Arc<Shared>,
    state: Mutex<HandleState>,
}

impl HandleInner {
    fn state(&self) -> MutexGuard<'_, HandleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Reserved port
#[derive(Clone)]
pub struct PortRef(pub(crate) Arc<HandleInner>);

impl PortRef {
    pub(crate) fn new(id: u64, port: u16, manager: Arc<Shared>) -> Self {
        PortRef(Arc::new(HandleInner {
            id,
            port,
            manager,
            state: Mutex::new(HandleState {
                close_state: CloseState::Open,
                callbacks: Vec::new(),
            }),
        }))
    }

    /// The reserved port, also valid after close
    pub fn port(&self) -> u16 {
        self.0.port
    }

    /// Creation identity, unique per manager
    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn is_closed(&self) -> bool {
        self.close_state() != CloseState::Open
    }

    pub fn close_state(&self) -> CloseState {
        self.0.state().close_state
    }

    /// Register a callback for release.
    ///
    /// Callbacks run last-registered-first, after the port is free in the
    /// manager and before release verification. On an already closed
    /// handle the callback runs immediately.
    pub fn on_close<F>(&self, callback: F)
    where
        F: FnOnce(u16, Option<PortRef>) -> anyhow::Result<()> + Send + 'static,
    {
        let mut state = self.0.state();
        if state.close_state == CloseState::Open {
            state.callbacks.push(Box::new(callback));
            return;
        }
        drop(state);

        let callback: CloseCallback = Box::new(callback);
        for failure in run_callbacks(&self.0.manager, self.0.port, vec![callback]) {
            warn!(port = self.0.port, error = %failure, "on-close callback failed");
        }
    }

    /// Release the port with release verification
    pub fn close(&self) -> Result<()> {
        self.close_with(CloseOptions::default())
    }

    /// Release the port.
    ///
    /// Idempotent. Every callback runs even if some fail; failures are
    /// returned together as `PortError::CallbackFailed`, after the port has
    /// already been released.
    pub fn close_with(&self, options: CloseOptions) -> Result<()> {
        let callbacks = {
            let mut state = self.0.state();
            if state.close_state != CloseState::Open {
                return Ok(());
            }
            state.close_state = CloseState::Closed;
            mem::take(&mut state.callbacks)
        };

        let port = self.0.port;
        let manager = &self.0.manager;
        manager.release(port, Arc::as_ptr(&self.0));
        debug!(port, id = self.0.id, "Released port");

        let failures = run_callbacks(manager, port, callbacks);

        if options.verify_release && !manager.release_check_disabled() {
            manager.verify_release(port);
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(PortError::CallbackFailed { port, failures })
        }
    }
}

/// Run every callback, newest first. A panicking callback counts as a failure.
fn run_callbacks(manager: &Shared, port: u16, callbacks: Vec<CloseCallback>) -> Vec<String> {
    let mut failures = Vec::new();
    for callback in callbacks.into_iter().rev() {
        let current = manager.current_handle(port);
        match panic::catch_unwind(AssertUnwindSafe(|| callback(port, current))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => failures.push(format!("{:#}", e)),
            Err(payload) => failures.push(format!("panicked: {}", panic_message(&*payload))),
        }
    }
    failures
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if state.close_state != CloseState::Open {
            return;
        }
        state.close_state = CloseState::Reclaimed;
        let callbacks = mem::take(&mut state.callbacks);

        warn!(
            port = self.port,
            id = self.id,
            "Port reservation dropped without close, reclaiming"
        );
        self.manager.release(self.port, self as *const HandleInner);

        for failure in run_callbacks(&self.manager, self.port, callbacks) {
            warn!(port = self.port, error = %failure, "on-close callback failed during reclaim");
        }
    }
}

impl PartialEq for PortRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for PortRef {}

impl Hash for PortRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.0).hash(state);
    }
}

impl fmt::Debug for PortRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortRef")
            .field("port", &self.0.port)
            .field("id", &self.0.id)
            .field("state", &self.close_state())
            .finish()
    }
}

impl fmt::Display for PortRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.port)
    }
}
