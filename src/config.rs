//! dsmbuf configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::comm::Rank;
use crate::constants::defaults;
use crate::layout::{LayoutKind, LayoutSpec, MixedExtent};

/// Top-level configuration shared by every rank of a job
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DsmConfig {
    #[serde(default)]
    pub node: NodeConfig,

    #[serde(default)]
    pub buffer: BufferConfig,

    #[serde(default)]
    pub network: NetworkConfig,
}

/// Per-process settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// Buffer layout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    #[serde(default = "default_layout")]
    pub layout: LayoutKind,

    /// Per-server segment size in MiB
    #[serde(default = "default_buffer_size_mb")]
    pub local_buffer_size_mb: u64,

    /// Exact per-server length in bytes, overriding `local_buffer_size_mb`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length_bytes: Option<u64>,

    /// Page size for block layouts
    #[serde(default = "default_block_length")]
    pub block_length: u64,

    /// Shuffle seed for the block-random layout
    #[serde(default)]
    pub seed: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_server: Option<Rank>,

    /// Last server rank, inclusive
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_server: Option<Rank>,

    /// Extent table for the mixed layout, in address order
    #[serde(default)]
    pub mixed: Vec<MixedExtent>,
}

fn default_layout() -> LayoutKind {
    LayoutKind::Uniform
}

fn default_buffer_size_mb() -> u64 {
    defaults::DEFAULT_BUFFER_SIZE_MB
}

fn default_block_length() -> u64 {
    defaults::DEFAULT_BLOCK_LENGTH
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            layout: default_layout(),
            local_buffer_size_mb: default_buffer_size_mb(),
            length_bytes: None,
            block_length: default_block_length(),
            seed: 0,
            start_server: None,
            end_server: None,
            mixed: Vec::new(),
        }
    }
}

impl BufferConfig {
    /// Per-server length in bytes, saturating when the size in MiB
    /// overflows (`DsmConfig::validate` rejects that)
    pub fn length(&self) -> u64 {
        self.checked_length().unwrap_or(u64::MAX)
    }

    fn checked_length(&self) -> Option<u64> {
        match self.length_bytes {
            Some(bytes) => Some(bytes),
            None => self.local_buffer_size_mb.checked_mul(1024 * 1024),
        }
    }

    pub fn layout_spec(&self) -> LayoutSpec {
        let spec = match self.layout {
            LayoutKind::Uniform => LayoutSpec::uniform(self.length()),
            LayoutKind::BlockCyclic => LayoutSpec::block_cyclic(self.length(), self.block_length),
            LayoutKind::BlockRandom => {
                LayoutSpec::block_random(self.length(), self.block_length, self.seed)
            }
            LayoutKind::Mixed => LayoutSpec::mixed(self.mixed.clone()),
        };
        LayoutSpec {
            start_server: self.start_server,
            end_server: self.end_server,
            ..spec
        }
    }
}

/// Network and rendezvous configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// File a listening server group publishes its addresses to
    #[serde(default = "default_rendezvous_file")]
    pub rendezvous_file: PathBuf,

    /// Host listeners bind to
    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    /// How long clients poll for a published server group
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_connect_retry")]
    pub connect_retry_ms: u64,

    /// Client processes a server group admits at once
    #[serde(default = "default_num_connections")]
    pub num_connections: usize,

    /// Whether detaching clients stop the servers
    #[serde(default = "default_shutdown_on_detach")]
    pub shutdown_on_detach: bool,
}

fn default_rendezvous_file() -> PathBuf {
    PathBuf::from("dsm_rendezvous.txt")
}

fn default_bind_host() -> String {
    "127.0.0.1".to_string()
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_connect_retry() -> u64 {
    1000
}

fn default_num_connections() -> usize {
    1
}

fn default_shutdown_on_detach() -> bool {
    true
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            rendezvous_file: default_rendezvous_file(),
            bind_host: default_bind_host(),
            connect_timeout_secs: default_connect_timeout(),
            connect_retry_ms: default_connect_retry(),
            num_connections: default_num_connections(),
            shutdown_on_detach: default_shutdown_on_detach(),
        }
    }
}

impl NetworkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn connect_retry(&self) -> Duration {
        Duration::from_millis(self.connect_retry_ms)
    }
}

impl DsmConfig {
    /// Load configuration from TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path, e)))?;
        let config: DsmConfig = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseError(format!("{}: {}", path, e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file(&self, path: &str) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;
        std::fs::write(path, contents)
            .map_err(|e| ConfigError::WriteError(format!("{}: {}", path, e)))
    }

    /// Reject layouts the address map cannot build and unknown log levels
    pub fn validate(&self) -> Result<(), ConfigError> {
        let buffer = &self.buffer;

        if buffer.layout != LayoutKind::Mixed {
            let length = buffer.checked_length().ok_or_else(|| {
                ConfigError::ValidationError(format!(
                    "Buffer size of {} MiB overflows a byte count",
                    buffer.local_buffer_size_mb
                ))
            })?;
            if length == 0 {
                return Err(ConfigError::ValidationError(
                    "Buffer length must be non-zero".to_string(),
                ));
            }
            // segment offsets travel in 32-bit header fields
            if length > i32::MAX as u64 {
                return Err(ConfigError::ValidationError(format!(
                    "Per-server length {} exceeds {} bytes",
                    length,
                    i32::MAX
                )));
            }
        }

        if matches!(buffer.layout, LayoutKind::BlockCyclic | LayoutKind::BlockRandom)
            && (buffer.block_length == 0 || buffer.block_length > buffer.length())
        {
            return Err(ConfigError::ValidationError(format!(
                "Block length {} must be between 1 and the per-server length {}",
                buffer.block_length,
                buffer.length()
            )));
        }

        if let (Some(start), Some(end)) = (buffer.start_server, buffer.end_server) {
            if start > end {
                return Err(ConfigError::ValidationError(format!(
                    "start_server {} is after end_server {}",
                    start, end
                )));
            }
        }

        if buffer.layout == LayoutKind::Mixed {
            if buffer.mixed.is_empty() {
                return Err(ConfigError::ValidationError(
                    "Mixed layout needs at least one extent".to_string(),
                ));
            }
            if buffer.mixed.iter().any(|e| e.length == 0) {
                return Err(ConfigError::ValidationError(
                    "Mixed layout extents must be non-empty".to_string(),
                ));
            }
        }

        if self.network.num_connections == 0 {
            return Err(ConfigError::ValidationError(
                "num_connections must be at least 1".to_string(),
            ));
        }

        if self.network.bind_host.is_empty() {
            return Err(ConfigError::ValidationError(
                "Bind host cannot be empty".to_string(),
            ));
        }

        match self.node.log_level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {}",
                    self.node.log_level
                )));
            }
        }

        Ok(())
    }
}

/// Errors loading, saving or validating a `DsmConfig`
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read configuration {0}")]
    ReadError(String),

    #[error("malformed configuration {0}")]
    ParseError(String),

    #[error("cannot serialize configuration: {0}")]
    SerializeError(String),

    #[error("cannot write configuration {0}")]
    WriteError(String),

    #[error("invalid configuration: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = DsmConfig::default();
        assert_eq!(config.buffer.layout, LayoutKind::Uniform);
        assert_eq!(config.buffer.length(), 128 * 1024 * 1024);
        assert_eq!(config.network.rendezvous_file, PathBuf::from("dsm_rendezvous.txt"));
        assert!(config.network.shutdown_on_detach);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = DsmConfig::default();

        config.buffer.layout = LayoutKind::BlockCyclic;
        config.buffer.length_bytes = Some(512);
        config.buffer.block_length = 1024;
        assert!(config.validate().is_err());
        config.buffer.block_length = 0;
        assert!(config.validate().is_err());
        config.buffer.block_length = 64;
        assert!(config.validate().is_ok());

        config.buffer.length_bytes = Some(4 * 1024 * 1024 * 1024);
        assert!(config.validate().is_err());
        config.buffer.length_bytes = Some(512);

        config.buffer.start_server = Some(2);
        config.buffer.end_server = Some(1);
        assert!(config.validate().is_err());
        config.buffer.start_server = None;

        config.buffer.layout = LayoutKind::Mixed;
        assert!(config.validate().is_err());
        config.buffer.mixed = vec![MixedExtent { rank: 0, length: 0 }];
        assert!(config.validate().is_err());
        config.buffer.mixed = vec![MixedExtent { rank: 0, length: 10 }];
        assert!(config.validate().is_ok());

        config.node.log_level = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_oversized_buffer_mb_is_rejected() {
        let mut config = DsmConfig::default();
        config.buffer.local_buffer_size_mb = u64::MAX / 1024;
        assert_eq!(config.buffer.length(), u64::MAX);
        match config.validate() {
            Err(ConfigError::ValidationError(msg)) => assert!(msg.contains("overflows")),
            other => panic!("expected a validation error, got {:?}", other),
        }

        // an explicit byte length takes precedence
        config.buffer.length_bytes = Some(4096);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_layout_spec_carries_server_range() {
        let mut config = DsmConfig::default();
        config.buffer.layout = LayoutKind::BlockRandom;
        config.buffer.length_bytes = Some(4096);
        config.buffer.block_length = 512;
        config.buffer.seed = 9;
        config.buffer.start_server = Some(1);
        config.buffer.end_server = Some(2);

        let spec = config.buffer.layout_spec();
        assert_eq!(spec.kind, LayoutKind::BlockRandom);
        assert_eq!(spec.length, 4096);
        assert_eq!(spec.block_length, 512);
        assert_eq!(spec.seed, 9);
        assert_eq!((spec.start_server, spec.end_server), (Some(1), Some(2)));
    }

    #[test]
    fn test_config_serialization() {
        let config = DsmConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: DsmConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.buffer.length(), deserialized.buffer.length());
        assert_eq!(config.network.bind_host, deserialized.network.bind_host);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dsm.toml");
        std::fs::write(
            &path,
            "[buffer]\nlayout = \"mixed\"\nmixed = [{ rank = 1, length = 64 }, { rank = 0, length = 32 }]\n",
        )
        .unwrap();

        let config = DsmConfig::from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(config.buffer.mixed.len(), 2);
        assert_eq!(config.network.num_connections, 1);
        assert_eq!(config.node.log_level, "info");

        let out = dir.path().join("out.toml");
        config.to_file(out.to_str().unwrap()).unwrap();
        assert!(DsmConfig::from_file(out.to_str().unwrap()).is_ok());
    }
}
