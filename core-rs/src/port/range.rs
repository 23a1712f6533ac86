/**
 * range.rs
 * Inclusive port ranges
 *
 * Port space layout:
 * - 0: sentinel ("any port" to the OS), never reservable
 * - 1-1023: system ports, never reservable
 * - 1024-65535: user space, minus the OS ephemeral range
 */

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lowest port number this crate will ever hand out
pub const MIN_RESERVABLE_PORT: u16 = 1024;

/// Highest valid TCP port
pub const MAX_PORT: u16 = u16::MAX;

/// Number of distinct port numbers, including the 0 sentinel
pub const PORT_SPACE_SIZE: usize = 1 << 16;

/// Inclusive port range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Self {
        PortRange { start, end }
    }

    /// Check if port is within this range
    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }

    /// Number of ports covered (0 for an inverted range)
    pub fn len(&self) -> usize {
        if self.end < self.start {
            0
        } else {
            (self.end - self.start) as usize + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}
