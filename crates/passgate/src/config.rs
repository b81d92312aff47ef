//! Startup configuration for the gate.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::policy::Whitelist;
use crate::record::RecordFormat;
use crate::target::MonitoredTarget;

/// Resource limits for inspecting a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateLimits {
    /// Largest payload that will be buffered for inspection. Larger writes to
    /// the monitored file are denied.
    pub max_payload_bytes: usize,
}

impl Default for GateLimits {
    fn default() -> Self {
        Self {
            max_payload_bytes: 1024 * 1024, // 1 MB
        }
    }
}

/// Everything the gate needs, fixed at installation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// The file whose writes are policed
    pub target: MonitoredTarget,
    /// Identities allowed to appear as the leading field of a record
    pub whitelist: Vec<String>,
    /// Emit an event for allowed writes as well as denied ones
    pub report_allowed: bool,
    /// Record delimiters
    pub format: RecordFormat,
    /// Payload inspection limits
    pub limits: GateLimits,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            target: MonitoredTarget::default(),
            whitelist: vec!["operator".to_string()],
            report_allowed: true,
            format: RecordFormat::default(),
            limits: GateLimits::default(),
        }
    }
}

impl GateConfig {
    /// Parse a config from JSON. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read and parse a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Check the config is enforceable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.target.validate()?;

        let RecordFormat {
            line_delimiter,
            field_separator,
        } = self.format;
        if line_delimiter == field_separator {
            return Err(ConfigError::AmbiguousFormat);
        }

        if self.whitelist.is_empty() {
            return Err(ConfigError::EmptyWhitelist);
        }
        for identity in &self.whitelist {
            let reason = if identity.is_empty() {
                Some("identity is empty")
            } else if identity.as_bytes().contains(&field_separator) {
                Some("identity contains the field separator")
            } else if identity.as_bytes().contains(&line_delimiter) {
                Some("identity contains the line delimiter")
            } else {
                None
            };
            if let Some(reason) = reason {
                return Err(ConfigError::InvalidIdentity {
                    identity: identity.clone(),
                    reason,
                });
            }
        }
        Ok(())
    }

    /// Build the whitelist policy from this config.
    pub fn whitelist(&self) -> Whitelist {
        Whitelist::new(&self.whitelist)
    }
}
