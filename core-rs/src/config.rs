//! Port reservation configuration
//!
//! Loaded from an optional YAML file (`.ckports.yaml` style, camelCase keys)
//! and layered with environment overrides.
//!
//! ```yaml
//! disableReleaseCheck: "true"
//! probeBind: false
//! ephemeralRange:
//!   start: 32768
//!   end: 60999
//! lsofPath: /usr/sbin/lsof
//! ```

use crate::errors::Result;
use crate::port::PortRange;
use serde::{Deserialize, Deserializer, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable that disables release verification for the whole
/// environment (e.g. CI images without a port-listing tool)
pub const DISABLE_RELEASE_CHECK_ENV: &str = "CKP_DISABLE_PORT_RELEASE_CHECK";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PortConfig {
    /// Skip release verification for this run
    #[serde(deserialize_with = "deserialize_flag")]
    pub disable_release_check: bool,

    /// Set from `CKP_DISABLE_PORT_RELEASE_CHECK`, never read from the file
    #[serde(skip)]
    pub env_disable_release_check: bool,

    /// Probe that a claimed port is bindable before handing it out
    pub probe_bind: bool,

    /// Override for the detected OS ephemeral range
    pub ephemeral_range: Option<PortRange>,

    /// Explicit location of the `lsof` binary
    pub lsof_path: Option<PathBuf>,
}

impl Default for PortConfig {
    fn default() -> Self {
        PortConfig {
            disable_release_check: false,
            env_disable_release_check: false,
            probe_bind: true,
            ephemeral_range: None,
            lsof_path: None,
        }
    }
}

impl PortConfig {
    /// Default configuration with environment overrides applied
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Load configuration from a YAML file, then apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        Ok(Self::from_yaml_str(&content)?.with_env_overrides())
    }

    /// Parse configuration from YAML without consulting the environment
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn with_env_overrides(mut self) -> Self {
        self.env_disable_release_check = std::env::var(DISABLE_RELEASE_CHECK_ENV)
            .map(|value| parse_flag(&value))
            .unwrap_or(false);
        self
    }

    /// Whether release verification is disabled by either override
    pub fn release_check_disabled(&self) -> bool {
        self.disable_release_check || self.env_disable_release_check
    }
}

/// Boolean-like string: `true`, `1`, `yes`, `on` (any case) are true,
/// everything else is false.
pub fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

fn deserialize_flag<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_yaml::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_yaml::Value::Bool(b) => b,
        serde_yaml::Value::String(s) => parse_flag(&s),
        serde_yaml::Value::Number(n) => n.as_i64() == Some(1),
        _ => false,
    })
}
