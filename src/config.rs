//! Bootstrap file: forwarders to register at startup
//!
//! ```yaml
//! defaults:
//!   dial_timeout_secs: 3
//!   fail_fast: false
//! forwarders:
//!   - name: mysql
//!     local: "3307"
//!     remote: 127.0.0.1:3306
//!   - name: redis
//!     local: 0.0.0.0:6380
//!     remote: cache.internal:6379
//!     enabled: false
//! ```
//!
//! The file is only read. Changes made through the control API are not
//! written back.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BootstrapConfig {
    /// Registry-wide settings, overridden by explicit CLI flags
    #[serde(default)]
    pub defaults: BootstrapDefaults,

    #[serde(default)]
    pub forwarders: Vec<ForwarderEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BootstrapDefaults {
    pub dial_timeout_secs: Option<u64>,
    pub fail_fast: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwarderEntry {
    pub name: String,
    pub local: String,
    pub remote: String,

    /// Whether to register this forwarder (default: true)
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl BootstrapConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: BootstrapConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for entry in &self.forwarders {
            if entry.name.trim().is_empty() {
                anyhow::bail!("Forwarder name cannot be empty");
            }
            if !seen.insert(entry.name.as_str()) {
                anyhow::bail!("Duplicate forwarder name: {}", entry.name);
            }
        }

        if self.defaults.dial_timeout_secs == Some(0) {
            anyhow::bail!("dial_timeout_secs must be greater than 0");
        }

        Ok(())
    }

    pub fn enabled_forwarders(&self) -> impl Iterator<Item = &ForwarderEntry> {
        self.forwarders.iter().filter(|f| f.enabled)
    }
}
