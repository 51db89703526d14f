//! Configuration
//!
//! TOML file with `[capture]`, `[flow]` and `[output]` sections, all
//! optional; CLI flags override the file. Column selection lives here
//! because the output schema is a dataset convention, not engine logic.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::flow::record::{validate_columns, DEFAULT_COLUMNS};
use crate::flow::FlowConfig;

/// Default config file locations, tried in order
const CONFIG_PATHS: &[&str] = &["flowtap.toml", "/etc/flowtap/flowtap.toml"];

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub capture: CaptureConfig,

    #[serde(default)]
    pub flow: FlowConfig,

    #[serde(default)]
    pub output: OutputConfig,
}

/// Packet source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Interface for live capture
    pub interface: Option<String>,
    /// Pcap file to replay instead of capturing live
    pub read_file: Option<PathBuf>,
    /// BPF filter expression applied at the source
    pub filter: Option<String>,
    /// Snapshot length
    pub snaplen: i32,
    /// Promiscuous mode for live capture
    pub promiscuous: bool,
    /// Read timeout (ms); bounds how long a stop signal can go unnoticed
    pub timeout_ms: i32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interface: None,
            read_file: None,
            filter: None,
            snaplen: 65_535,
            promiscuous: true,
            timeout_ms: 200,
        }
    }
}

/// Record output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Output file; stdout when unset
    pub path: Option<PathBuf>,
    /// Column names, in output order; the full registry when unset
    pub columns: Option<Vec<String>>,
    /// Bounded record channel capacity
    pub channel_capacity: usize,
    /// Status log interval (seconds)
    pub status_interval_secs: u64,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            path: None,
            columns: None,
            channel_capacity: 4096,
            status_interval_secs: 10,
        }
    }
}

impl OutputConfig {
    /// Effective column list
    pub fn resolved_columns(&self) -> Vec<String> {
        match &self.columns {
            Some(cols) => cols.clone(),
            None => DEFAULT_COLUMNS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Load from an explicit path, or the first default location, or defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        for candidate in CONFIG_PATHS {
            if Path::new(candidate).exists() {
                return Self::load(candidate);
            }
        }
        Ok(Self::default())
    }

    /// Reject configurations that cannot run
    pub fn validate(&self) -> Result<()> {
        if let Some(cols) = &self.output.columns {
            if cols.is_empty() {
                bail!("output.columns must not be empty");
            }
            if let Err(unknown) = validate_columns(cols) {
                bail!("unknown output column: {:?}", unknown);
            }
        }
        if self.capture.snaplen <= 0 {
            bail!("capture.snaplen must be positive");
        }
        if self.output.channel_capacity == 0 {
            bail!("output.channel_capacity must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_validates() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.output.resolved_columns().len(), DEFAULT_COLUMNS.len());
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [capture]
            interface = "eth0"
            filter = "tcp or udp"

            [flow]
            idle_timeout_secs = 60
            "#,
        )
        .unwrap();

        assert_eq!(config.capture.interface.as_deref(), Some("eth0"));
        assert_eq!(config.flow.idle_timeout_secs, 60);
        // Untouched sections keep their defaults
        assert_eq!(config.output.channel_capacity, 4096);
        assert_eq!(config.capture.snaplen, 65_535);
    }

    #[test]
    fn test_unknown_column_rejected() {
        let config: Config = toml::from_str(
            r#"
            [output]
            columns = ["Flow ID", "Label"]
            "#,
        )
        .unwrap();

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_column_subset_accepted() {
        let config: Config = toml::from_str(
            r#"
            [output]
            columns = ["Flow ID", "Tot Fwd Pkts", "Tot Bwd Pkts"]
            "#,
        )
        .unwrap();

        assert!(config.validate().is_ok());
        assert_eq!(config.output.resolved_columns().len(), 3);
    }
}
