/**
 * port module
 * Exclusive TCP port reservations for concurrent kernels and test workers
 */

pub mod bitmap;
pub mod ephemeral;
pub mod handle;
pub mod manager;
pub mod netstat;
pub mod range;

pub use ephemeral::{EphemeralRangeProvider, FixedEphemeralRange, SystemEphemeralRange};
pub use handle::{CloseCallback, CloseOptions, CloseState, PortRef};
pub use manager::{is_bindable, PortManager, PortManagerBuilder};
pub use netstat::{BusyPort, ConnectionState, LsofNetStat, NetStat, NoopNetStat};
pub use range::PortRange;
