use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::common::{error::EscrowError, types::FeeRate};
use crate::protocol::messages::{MIN_PROTOCOL_VERSION, PROTOCOL_VERSION};

/// Engine wide settings. Every field falls back to its default when absent from the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory holding persisted trades, archives and backups.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Protocol version announced in outbound messages.
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u32,

    #[serde(default = "default_fee_rate")]
    pub fee_rate_sat_per_vbyte: u64,

    /// Relative lock time in blocks recorded in the contract.
    #[serde(default = "default_lock_time_blocks")]
    pub lock_time_blocks: u32,

    /// Time allowed from take-offer until the deposit tx is published.
    #[serde(default = "default_protocol_timeout_ms")]
    pub protocol_timeout_ms: u64,

    /// Upper bound for a single protocol task.
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,

    #[serde(default = "default_proof_poll_interval_ms")]
    pub proof_poll_interval_ms: u64,

    #[serde(default = "default_proof_max_duration_ms")]
    pub proof_max_duration_ms: u64,

    #[serde(default = "default_proof_service_url")]
    pub proof_service_url: url::Url,

    #[serde(default = "default_request_channel_size")]
    pub request_channel_size: usize,

    #[serde(default = "default_peer_channel_size")]
    pub peer_channel_size: usize,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("escrow-data")
}

fn default_protocol_version() -> u32 {
    PROTOCOL_VERSION
}

fn default_fee_rate() -> u64 {
    10
}

fn default_lock_time_blocks() -> u32 {
    4320
}

fn default_protocol_timeout_ms() -> u64 {
    180_000
}

fn default_task_timeout_ms() -> u64 {
    60_000
}

fn default_proof_poll_interval_ms() -> u64 {
    90_000
}

fn default_proof_max_duration_ms() -> u64 {
    12 * 60 * 60 * 1000
}

fn default_proof_service_url() -> url::Url {
    url::Url::parse("http://127.0.0.1:8081/api/proof").unwrap() // literal always parses
}

fn default_request_channel_size() -> usize {
    10
}

fn default_peer_channel_size() -> usize {
    20
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            protocol_version: default_protocol_version(),
            fee_rate_sat_per_vbyte: default_fee_rate(),
            lock_time_blocks: default_lock_time_blocks(),
            protocol_timeout_ms: default_protocol_timeout_ms(),
            task_timeout_ms: default_task_timeout_ms(),
            proof_poll_interval_ms: default_proof_poll_interval_ms(),
            proof_max_duration_ms: default_proof_max_duration_ms(),
            proof_service_url: default_proof_service_url(),
            request_channel_size: default_request_channel_size(),
            peer_channel_size: default_peer_channel_size(),
        }
    }
}

impl EngineConfig {
    pub fn with_data_dir(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Loads a JSON config file. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, EscrowError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), EscrowError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), EscrowError> {
        if self.request_channel_size == 0 || self.peer_channel_size == 0 {
            return Err(EscrowError::Simple(
                "Channel sizes must be non-zero".to_string(),
            ));
        }
        if !(MIN_PROTOCOL_VERSION..=PROTOCOL_VERSION).contains(&self.protocol_version) {
            return Err(EscrowError::Simple(format!(
                "Protocol version {} not supported",
                self.protocol_version
            )));
        }
        if self.proof_poll_interval_ms == 0 {
            return Err(EscrowError::Simple(
                "Proof poll interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn fee_rate(&self) -> FeeRate {
        FeeRate(self.fee_rate_sat_per_vbyte)
    }

    pub fn protocol_timeout(&self) -> Duration {
        Duration::from_millis(self.protocol_timeout_ms)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn proof_poll_interval(&self) -> Duration {
        Duration::from_millis(self.proof_poll_interval_ms)
    }

    pub fn proof_max_duration(&self) -> Duration {
        Duration::from_millis(self.proof_max_duration_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load(dir.path().join("engine.json")).unwrap();
        assert_eq!(config.protocol_version, PROTOCOL_VERSION);
        assert_eq!(config.protocol_timeout(), Duration::from_secs(180));
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{ "task_timeout_ms": 500, "fee_rate_sat_per_vbyte": 3 }"#)
            .unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.task_timeout(), Duration::from_millis(500));
        assert_eq!(config.fee_rate(), FeeRate(3));
        assert_eq!(config.peer_channel_size, default_peer_channel_size());
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("engine.json");
        let mut config = EngineConfig::with_data_dir(dir.path());
        config.lock_time_blocks = 144;
        config.save(&path).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded.lock_time_blocks, 144);
        assert_eq!(loaded.data_dir, dir.path());
    }

    #[test]
    fn zero_channel_size_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{ "peer_channel_size": 0 }"#).unwrap();
        assert!(EngineConfig::load(&path).is_err());
    }

    #[test]
    fn unsupported_protocol_version_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::with_data_dir(dir.path());
        config.protocol_version = MIN_PROTOCOL_VERSION;
        assert!(config.validate().is_ok());

        config.protocol_version = MIN_PROTOCOL_VERSION - 1;
        assert!(config.validate().is_err());
        config.protocol_version = PROTOCOL_VERSION + 1;
        assert!(config.validate().is_err());
    }
}
