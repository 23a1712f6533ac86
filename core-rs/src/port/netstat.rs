/**
 * netstat.rs
 * Live OS port table queries
 *
 * Used to verify that a released port is really closed, and to diagnose
 * conflicts. Never used to decide whether a port can be reserved.
 *
 * Unix: `lsof -F` field output (one field per line, first char is the
 * field marker), which is stable across locales unlike the column tables
 * of netstat/ss:
 *
 *   p1234          process set, pid (always first)
 *   cjava          command name
 *   f12            file set (one socket)
 *   PTCP           protocol
 *   n*:8080        local[->remote] endpoint
 *   TST=LISTEN     TCP state
 *
 * Other platforms: no-op, every query is "unverifiable".
 */

use crate::errors::{PortError, Result};
use crate::exec::run_command;
use serde::{Serialize, Serializer};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

/// TCP connection state as reported by the OS
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Listen,
    Established,
    SynSent,
    SynReceived,
    FinWait1,
    FinWait2,
    TimeWait,
    CloseWait,
    LastAck,
    Closing,
    Closed,
    Other(String),
}

impl ConnectionState {
    pub fn is_listening(&self) -> bool {
        matches!(self, ConnectionState::Listen)
    }
}

impl FromStr for ConnectionState {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_uppercase().as_str() {
            "LISTEN" => ConnectionState::Listen,
            "ESTABLISHED" => ConnectionState::Established,
            "SYN_SENT" => ConnectionState::SynSent,
            "SYN_RECV" | "SYN_RCVD" | "SYN_RECEIVED" => ConnectionState::SynReceived,
            "FIN_WAIT1" | "FIN_WAIT_1" => ConnectionState::FinWait1,
            "FIN_WAIT2" | "FIN_WAIT_2" => ConnectionState::FinWait2,
            "TIME_WAIT" => ConnectionState::TimeWait,
            "CLOSE_WAIT" => ConnectionState::CloseWait,
            "LAST_ACK" => ConnectionState::LastAck,
            "CLOSING" => ConnectionState::Closing,
            "CLOSED" => ConnectionState::Closed,
            other => ConnectionState::Other(other.to_string()),
        })
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Listen => "LISTEN",
            ConnectionState::Established => "ESTABLISHED",
            ConnectionState::SynSent => "SYN_SENT",
            ConnectionState::SynReceived => "SYN_RECV",
            ConnectionState::FinWait1 => "FIN_WAIT1",
            ConnectionState::FinWait2 => "FIN_WAIT2",
            ConnectionState::TimeWait => "TIME_WAIT",
            ConnectionState::CloseWait => "CLOSE_WAIT",
            ConnectionState::LastAck => "LAST_ACK",
            ConnectionState::Closing => "CLOSING",
            ConnectionState::Closed => "CLOSED",
            ConnectionState::Other(other) => other.as_str(),
        };
        f.write_str(s)
    }
}

impl Serialize for ConnectionState {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// One socket from the OS port table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BusyPort {
    pub pid: u32,
    pub command: Option<String>,
    pub protocol: String,
    pub local_address: String,
    pub local_port: u16,
    pub remote: Option<String>,
    pub state: Option<ConnectionState>,
}

impl BusyPort {
    pub fn is_listening(&self) -> bool {
        self.state.as_ref().is_some_and(ConnectionState::is_listening)
    }
}

/// Port usage query
pub trait NetStat: Send + Sync {
    /// Every busy TCP socket on the host
    fn list_busy_ports(&self) -> Result<Vec<BusyPort>>;

    /// Busy TCP sockets whose local endpoint is `port`
    fn list_busy_ports_on(&self, port: u16) -> Result<Vec<BusyPort>>;

    /// False if an empty answer says nothing about the OS state
    fn is_conclusive(&self) -> bool {
        true
    }
}

/// Query for platforms without a reliable port table
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNetStat;

impl NetStat for NoopNetStat {
    fn list_busy_ports(&self) -> Result<Vec<BusyPort>> {
        Ok(Vec::new())
    }

    fn list_busy_ports_on(&self, _port: u16) -> Result<Vec<BusyPort>> {
        Ok(Vec::new())
    }

    fn is_conclusive(&self) -> bool {
        false
    }
}

/// `lsof`-backed port table query
#[derive(Debug, Clone)]
pub struct LsofNetStat {
    program: PathBuf,
}

impl Default for LsofNetStat {
    fn default() -> Self {
        Self::new()
    }
}

impl LsofNetStat {
    pub fn new() -> Self {
        Self::with_program("lsof")
    }

    pub fn with_program<P: AsRef<Path>>(program: P) -> Self {
        LsofNetStat {
            program: program.as_ref().to_path_buf(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn query(&self, selector: &str) -> Result<Vec<BusyPort>> {
        // -n/-P: no DNS or service-name lookups, -w: no warnings
        let args = ["-n", "-P", "-w", selector, "-F", "pcfPnT", "-Ts"];
        let output = run_command(&self.program, args)?;

        if !output.success() {
            // lsof exits 1 without output when nothing matched
            if output.exit_code == Some(1)
                && output.stdout.iter().all(|l| l.trim().is_empty())
                && output.stderr.iter().all(|l| l.trim().is_empty())
            {
                return Ok(Vec::new());
            }
            return Err(PortError::ToolFailed(format!(
                "{} {} exited with {}: {}",
                self.program.display(),
                selector,
                output
                    .exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                output.stderr.join(" | ")
            )));
        }

        let records = parse_lsof_fields(output.stdout.iter().map(String::as_str))?;
        debug!(selector, records = records.len(), "lsof query");
        Ok(records)
    }
}

impl NetStat for LsofNetStat {
    fn list_busy_ports(&self) -> Result<Vec<BusyPort>> {
        self.query("-iTCP")
    }

    fn list_busy_ports_on(&self, port: u16) -> Result<Vec<BusyPort>> {
        let records = self.query(&format!("-iTCP:{}", port))?;
        // -iTCP:port also matches remote endpoints
        Ok(records.into_iter().filter(|r| r.local_port == port).collect())
    }
}

/// Port usage query for the running platform
pub fn system_netstat(lsof_path: Option<&Path>) -> std::sync::Arc<dyn NetStat> {
    #[cfg(unix)]
    {
        let lsof = match lsof_path {
            Some(path) => LsofNetStat::with_program(path),
            None => LsofNetStat::new(),
        };
        std::sync::Arc::new(lsof)
    }

    #[cfg(not(unix))]
    {
        let _ = lsof_path;
        std::sync::Arc::new(NoopNetStat)
    }
}

#[derive(Default)]
struct FileRecord {
    protocol: Option<String>,
    name: Option<String>,
    state: Option<ConnectionState>,
}

/// Parse `lsof -F pcfPnT` output.
///
/// The whole answer is rejected if a field shows up out of order or cannot
/// be parsed; a partial table is never returned.
pub fn parse_lsof_fields<'a, I>(lines: I) -> Result<Vec<BusyPort>>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut records = Vec::new();
    let mut process: Option<(u32, Option<String>)> = None;
    let mut file: Option<FileRecord> = None;

    for (lineno, line) in lines.into_iter().enumerate() {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        let mut chars = line.chars();
        let marker = chars.next().unwrap_or_default();
        let value = chars.as_str();
        let malformed = |what: &str| {
            PortError::MalformedOutput(format!("line {}: {} ({:?})", lineno + 1, what, line))
        };

        match marker {
            'p' => {
                if let (Some(done), Some(proc_info)) = (file.take(), process.as_ref()) {
                    push_record(&mut records, proc_info, done).map_err(|e| malformed(e.as_str()))?;
                }
                let pid = value
                    .parse::<u32>()
                    .map_err(|_| malformed("process id is not a number"))?;
                process = Some((pid, None));
            }
            'c' => match process.as_mut() {
                Some((_, command)) if file.is_none() => *command = Some(value.to_string()),
                _ => return Err(malformed("command outside of a process set")),
            },
            'f' => {
                let proc_info = process
                    .as_ref()
                    .ok_or_else(|| malformed("file set before any process set"))?;
                if let Some(done) = file.take() {
                    push_record(&mut records, proc_info, done).map_err(|e| malformed(e.as_str()))?;
                }
                file = Some(FileRecord::default());
            }
            'P' | 'n' | 'T' => {
                let current = file
                    .as_mut()
                    .ok_or_else(|| malformed("file field outside of a file set"))?;
                match marker {
                    'P' => current.protocol = Some(value.to_string()),
                    'n' => current.name = Some(value.to_string()),
                    _ => {
                        if let Some(state) = value.strip_prefix("ST=") {
                            current.state = state.parse().ok();
                        }
                    }
                }
            }
            _ => return Err(malformed("unexpected field marker")),
        }
    }

    if let (Some(done), Some(proc_info)) = (file.take(), process.as_ref()) {
        push_record(&mut records, proc_info, done).map_err(PortError::MalformedOutput)?;
    }

    Ok(records)
}

fn push_record(
    records: &mut Vec<BusyPort>,
    (pid, command): &(u32, Option<String>),
    file: FileRecord,
) -> std::result::Result<(), String> {
    let name = file.name.ok_or_else(|| "file set without a name field".to_string())?;
    let (local, remote) = match name.split_once("->") {
        Some((local, remote)) => (local, Some(remote.to_string())),
        None => (name.as_str(), None),
    };
    let (address, port) = local
        .rsplit_once(':')
        .ok_or_else(|| format!("endpoint without a port: {}", local))?;

    // Unbound sockets report "*:*"
    if port == "*" {
        return Ok(());
    }
    let local_port = port
        .parse::<u16>()
        .map_err(|_| format!("invalid port in endpoint: {}", local))?;

    records.push(BusyPort {
        pid: *pid,
        command: command.clone(),
        protocol: file.protocol.unwrap_or_else(|| "TCP".to_string()),
        local_address: address.to_string(),
        local_port,
        remote,
        state: file.state,
    });
    Ok(())
}
