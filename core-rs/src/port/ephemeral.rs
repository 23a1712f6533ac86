//! OS ephemeral port range detection
//!
//! The kernel hands out ports from this range to client sockets on its own,
//! so none of them can be reserved.
//!
//! - Linux: `/proc/sys/net/ipv4/ip_local_port_range`
//! - macOS / BSD: `sysctl -n net.inet.ip.portrange.first|last`
//! - Windows: `netsh int ipv4 show dynamicport tcp`
//!
//! A range starting below 1024 is clamped to 1024. Anything missing, inverted
//! or entirely below 1024 falls back to the IANA range 49152-65535.

use crate::port::range::{PortRange, MIN_RESERVABLE_PORT};
use once_cell::sync::OnceCell;
use tracing::{debug, warn};

/// IANA-recommended dynamic/private range
pub const DEFAULT_EPHEMERAL_RANGE: PortRange = PortRange {
    start: 49152,
    end: 65535,
};

/// Source of the OS ephemeral range
pub trait EphemeralRangeProvider: Send + Sync {
    /// Inclusive range the kernel may assign on its own. Never fails.
    fn range(&self) -> PortRange;
}

/// Fixed range, from configuration or tests
#[derive(Debug, Clone, Copy)]
pub struct FixedEphemeralRange(pub PortRange);

impl EphemeralRangeProvider for FixedEphemeralRange {
    fn range(&self) -> PortRange {
        self.0
    }
}

/// Asks the running OS, once per provider
#[derive(Debug, Default)]
pub struct SystemEphemeralRange {
    cached: OnceCell<PortRange>,
}

impl SystemEphemeralRange {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EphemeralRangeProvider for SystemEphemeralRange {
    fn range(&self) -> PortRange {
        *self.cached.get_or_init(|| {
            let range = validated(platform::detect());
            debug!(range = %range, "ephemeral port range");
            range
        })
    }
}

/// Process-wide detected range, computed on first use
pub fn system_range() -> PortRange {
    static SYSTEM: OnceCell<SystemEphemeralRange> = OnceCell::new();
    SYSTEM.get_or_init(SystemEphemeralRange::new).range()
}

fn validated(detected: Option<PortRange>) -> PortRange {
    match detected {
        Some(range) if range.start <= range.end && range.end >= MIN_RESERVABLE_PORT => {
            if range.start >= MIN_RESERVABLE_PORT {
                return range;
            }
            // Ports below 1024 are never reservable anyway, keep the rest excluded
            let clamped = PortRange::new(MIN_RESERVABLE_PORT, range.end);
            debug!(detected = %range, used = %clamped, "Clamped ephemeral port range");
            clamped
        }
        Some(range) => {
            warn!(
                detected = %range,
                fallback = %DEFAULT_EPHEMERAL_RANGE,
                "Ignoring implausible ephemeral port range"
            );
            DEFAULT_EPHEMERAL_RANGE
        }
        None => {
            warn!(
                fallback = %DEFAULT_EPHEMERAL_RANGE,
                "Could not determine ephemeral port range, using default"
            );
            DEFAULT_EPHEMERAL_RANGE
        }
    }
}

/// Parse the Linux procfs format: "32768\t60999\n"
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_proc_range(contents: &str) -> Option<PortRange> {
    let mut parts = contents.split_whitespace();
    let start: u16 = parts.next()?.parse().ok()?;
    let end: u16 = parts.next()?.parse().ok()?;
    Some(PortRange::new(start, end))
}

/// Parse `netsh int ipv4 show dynamicport tcp` output
#[cfg_attr(not(windows), allow(dead_code))]
fn parse_netsh_range(output: &str) -> Option<PortRange> {
    let start_re = regex::Regex::new(r"(?im)^\s*Start Port\s*:\s*(\d+)").ok()?;
    let count_re = regex::Regex::new(r"(?im)^\s*Number of Ports\s*:\s*(\d+)").ok()?;

    let start: u32 = start_re.captures(output)?.get(1)?.as_str().parse().ok()?;
    let count: u32 = count_re.captures(output)?.get(1)?.as_str().parse().ok()?;
    if count == 0 {
        return None;
    }
    let end = start.checked_add(count - 1)?;
    Some(PortRange::new(
        u16::try_from(start).ok()?,
        u16::try_from(end).ok()?,
    ))
}

#[cfg(target_os = "linux")]
mod platform {
    use super::*;
    use std::fs;

    const PROC_PATH: &str = "/proc/sys/net/ipv4/ip_local_port_range";

    pub fn detect() -> Option<PortRange> {
        match fs::read_to_string(PROC_PATH) {
            Ok(contents) => parse_proc_range(&contents),
            Err(e) => {
                debug!(path = PROC_PATH, error = %e, "Cannot read ephemeral port range");
                None
            }
        }
    }
}

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd"
))]
mod platform {
    use super::*;
    use crate::exec::run_command;

    pub fn detect() -> Option<PortRange> {
        let start = sysctl_u16("net.inet.ip.portrange.first")?;
        let end = sysctl_u16("net.inet.ip.portrange.last")?;
        Some(PortRange::new(start, end))
    }

    fn sysctl_u16(key: &str) -> Option<u16> {
        let output = match run_command("sysctl", ["-n", key]) {
            Ok(output) => output,
            Err(e) => {
                debug!(key, error = %e, "sysctl unavailable");
                return None;
            }
        };
        if !output.success() {
            return None;
        }
        output.stdout.first()?.trim().parse().ok()
    }
}

#[cfg(windows)]
mod platform {
    use super::*;
    use crate::exec::run_command;

    pub fn detect() -> Option<PortRange> {
        let output = match run_command("netsh", ["int", "ipv4", "show", "dynamicport", "tcp"]) {
            Ok(output) => output,
            Err(e) => {
                debug!(error = %e, "netsh unavailable");
                return None;
            }
        };
        if !output.success() {
            return None;
        }
        parse_netsh_range(&output.stdout.join("\n"))
    }
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    windows
)))]
mod platform {
    use super::*;

    pub fn detect() -> Option<PortRange> {
        None
    }
}
