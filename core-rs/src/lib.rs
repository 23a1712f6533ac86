//! # CKP Ports - exclusive TCP ports for concurrent kernels
//!
//! Hands out TCP port numbers to concurrent kernels and test workers in one
//! process so that no two callers ever get the same port, and checks the OS
//! port table on release to catch sockets that outlive their reservation.
//!
//! ## Components
//!
//! - `EphemeralRangeProvider`: the range the OS kernel assigns on its own,
//!   never reservable
//! - `NetStat`: live OS port table (`lsof -F` on Unix, no-op elsewhere)
//! - `PortManager`: reservation bitmap + registry of live handles
//! - `PortRef`: caller-held reservation, released on `close()` or on drop
//!
//! ## Usage
//!
//! ```no_run
//! use ckp_ports::PortManager;
//! use std::net::TcpListener;
//!
//! let manager = PortManager::new();
//! let port = manager.reserve_port()?;
//!
//! let listener = TcpListener::bind(("127.0.0.1", port.port()))?;
//! // ... serve ...
//! drop(listener);
//!
//! // Logs an error if something still listens on the port
//! port.close()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod errors;
pub mod exec;
pub mod port;

pub use config::{PortConfig, DISABLE_RELEASE_CHECK_ENV};
pub use errors::{PortError, Result};
pub use port::{
    BusyPort, CloseOptions, CloseState, ConnectionState, EphemeralRangeProvider, LsofNetStat,
    NetStat, NoopNetStat, PortManager, PortRange, PortRef,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
