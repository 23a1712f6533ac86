//! External command execution
//!
//! Runs a platform tool to completion and hands back its output as lines.
//! Used by the ephemeral range lookup and the port-usage query.

use crate::errors::{PortError, Result};
use std::ffi::OsStr;
use std::io::ErrorKind;
use std::process::Command;

/// Captured result of a finished command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, None if terminated by a signal
    pub exit_code: Option<i32>,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// All captured lines, stdout first
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.stdout
            .iter()
            .chain(self.stderr.iter())
            .map(String::as_str)
    }
}

/// Run `program` with `args`, blocking until it exits.
///
/// Output is always decoded as UTF-8, replacing invalid sequences; there is
/// no encoding parameter. The tools run here (`lsof -F`, `sysctl -n`,
/// `netsh`) print ASCII digits and field markers, so a locale codepage never
/// changes the parsed result. A program that
/// is not on the search path yields `PortError::ToolNotFound`; a non-zero
/// exit is NOT an error here, callers decide what it means.
pub fn run_command<P, I, S>(program: P, args: I) -> Result<CommandOutput>
where
    P: AsRef<OsStr>,
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let program = program.as_ref();
    let output = Command::new(program).args(args).output().map_err(|e| {
        if e.kind() == ErrorKind::NotFound {
            PortError::ToolNotFound(format!("{} is not on the search path", program.to_string_lossy()))
        } else {
            PortError::Io(e)
        }
    })?;

    Ok(CommandOutput {
        exit_code: output.status.code(),
        stdout: split_lines(&output.stdout),
        stderr: split_lines(&output.stderr),
    })
}

fn split_lines(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(|line| line.trim_end_matches('\r').to_string())
        .collect()
}
