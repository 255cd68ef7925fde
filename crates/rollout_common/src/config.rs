//! Configuration management for the rollout tool.
//!
//! Loads settings from /etc/trident-rollout/config.toml or uses defaults.
//! Every field has a serde default, so a partial file is valid.

use crate::error::{Result, RolloutError};
use crate::outcome::{LogMarkers, OutcomeClassifier, DEFAULT_REBOOT_EXIT_CODE};
use crate::retry::RetryPolicy;
use crate::transform::PackagingFormat;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Config file path
pub const CONFIG_PATH: &str = "/etc/trident-rollout/config.toml";

/// Engine configuration path on the host
pub const HOST_CONFIG_PATH: &str = "/etc/trident/config.yaml";

// ============================================================================
// [ssh]
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshConfig {
    #[serde(default = "default_ssh_user")]
    pub user: String,

    /// Private key passed to ssh with `-i`
    #[serde(default)]
    pub identity_file: Option<PathBuf>,

    #[serde(default = "default_ssh_port")]
    pub port: u16,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Keep-alive probe interval; the session is declared dead after
    /// `keepalive_count_max` unanswered probes
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,

    #[serde(default = "default_keepalive_count_max")]
    pub keepalive_count_max: u32,

    /// Lab hosts are reimaged constantly, so host keys are not pinned by default
    #[serde(default)]
    pub strict_host_key_checking: bool,
}

fn default_ssh_user() -> String {
    "testing-user".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_keepalive_interval() -> u64 {
    15
}

fn default_keepalive_count_max() -> u32 {
    3
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: default_ssh_user(),
            identity_file: None,
            port: default_ssh_port(),
            connect_timeout_secs: default_connect_timeout(),
            keepalive_interval_secs: default_keepalive_interval(),
            keepalive_count_max: default_keepalive_count_max(),
            strict_host_key_checking: false,
        }
    }
}

// ============================================================================
// [retry]
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total engine invocations, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Wait after a reboot before reconnecting
    #[serde(default = "default_settle_delay")]
    pub settle_delay_secs: u64,

    /// Wall-clock budget for one whole orchestration
    #[serde(default = "default_overall_budget")]
    pub overall_budget_secs: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_interval() -> u64 {
    60
}

fn default_settle_delay() -> u64 {
    60
}

fn default_overall_budget() -> u64 {
    3600
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            interval_secs: default_interval(),
            settle_delay_secs: default_settle_delay(),
            overall_budget_secs: default_overall_budget(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            interval: Duration::from_secs(self.interval_secs),
            settle_delay: Duration::from_secs(self.settle_delay_secs),
            overall_budget: Duration::from_secs(self.overall_budget_secs),
        }
    }
}

// ============================================================================
// [engine]
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_binary_path")]
    pub binary_path: String,

    #[serde(default = "default_container_image")]
    pub container_image: String,

    /// Image archive loaded with `docker load` when the image is absent
    #[serde(default = "default_container_archive")]
    pub container_archive: String,

    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    #[serde(default = "default_rebuild_raid_timeout")]
    pub rebuild_raid_timeout_secs: u64,

    #[serde(default = "default_reboot_exit_code")]
    pub reboot_exit_code: i32,

    /// Log level passed to `trident run -v`
    #[serde(default = "default_verbosity")]
    pub verbosity: String,

    #[serde(default = "default_host_config_path")]
    pub host_config_path: String,
}

fn default_binary_path() -> String {
    "/usr/bin/trident".to_string()
}

fn default_container_image() -> String {
    "trident/trident:latest".to_string()
}

fn default_container_archive() -> String {
    "/var/lib/trident/trident-container.tar.gz".to_string()
}

fn default_command_timeout() -> u64 {
    240
}

fn default_rebuild_raid_timeout() -> u64 {
    180
}

fn default_reboot_exit_code() -> i32 {
    DEFAULT_REBOOT_EXIT_CODE
}

fn default_verbosity() -> String {
    "trace".to_string()
}

fn default_host_config_path() -> String {
    HOST_CONFIG_PATH.to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary_path: default_binary_path(),
            container_image: default_container_image(),
            container_archive: default_container_archive(),
            command_timeout_secs: default_command_timeout(),
            rebuild_raid_timeout_secs: default_rebuild_raid_timeout(),
            reboot_exit_code: default_reboot_exit_code(),
            verbosity: default_verbosity(),
            host_config_path: default_host_config_path(),
        }
    }
}

impl EngineConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn rebuild_raid_timeout(&self) -> Duration {
        Duration::from_secs(self.rebuild_raid_timeout_secs)
    }
}

// ============================================================================
// [staging]
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingConfig {
    /// World-writable directory the new configuration is uploaded to first
    #[serde(default = "default_staging_dir")]
    pub dir: String,

    #[serde(default)]
    pub packaging: PackagingFormat,
}

fn default_staging_dir() -> String {
    "/tmp/staging".to_string()
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            dir: default_staging_dir(),
            packaging: PackagingFormat::default(),
        }
    }
}

// ============================================================================
// Root config
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutConfig {
    #[serde(default)]
    pub ssh: SshConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub markers: LogMarkers,

    #[serde(default)]
    pub staging: StagingConfig,
}

impl RolloutConfig {
    /// Load config from `path`, or the default location. A missing file
    /// yields defaults; an unreadable or malformed one is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new(CONFIG_PATH));
        if !path.exists() {
            warn!("Config {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load_from_path(path)
    }

    fn load_from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: RolloutConfig = toml::from_str(&content)
            .map_err(|e| RolloutError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(RolloutError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.engine.command_timeout_secs == 0 {
            return Err(RolloutError::Config(
                "engine.command_timeout_secs must be positive".to_string(),
            ));
        }
        for (name, marker) in [
            ("reboot", &self.markers.reboot),
            ("staged", &self.markers.staged),
            ("forced_rerun", &self.markers.forced_rerun),
        ] {
            if marker.trim().is_empty() {
                return Err(RolloutError::Config(format!("markers.{} must not be empty", name)));
            }
        }
        Ok(())
    }

    pub fn classifier(&self) -> OutcomeClassifier {
        OutcomeClassifier::new(self.markers.clone(), self.engine.reboot_exit_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = RolloutConfig::default();
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.policy().interval, Duration::from_secs(60));
        assert_eq!(config.engine.command_timeout(), Duration::from_secs(240));
        assert_eq!(config.engine.reboot_exit_code, -1);
        assert_eq!(config.staging.packaging, PackagingFormat::RawZst);
        assert_eq!(config.markers, LogMarkers::default());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[retry]\nmax_attempts = 3\n\n[staging]\npackaging = \"cosi\"\n\n[ssh]\nuser = \"azureuser\""
        )
        .unwrap();

        let config = RolloutConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.interval_secs, 60);
        assert_eq!(config.staging.packaging, PackagingFormat::Cosi);
        assert_eq!(config.staging.dir, "/tmp/staging");
        assert_eq!(config.ssh.user, "azureuser");
        assert_eq!(config.ssh.port, 22);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = RolloutConfig::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config, RolloutConfig::default());
    }

    #[test]
    fn test_malformed_file_is_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[retry\nmax_attempts = ").unwrap();
        let err = RolloutConfig::load(Some(file.path())).unwrap_err();
        assert!(matches!(err, RolloutError::Config(_)));
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[retry]\nmax_attempts = 0").unwrap();
        assert!(RolloutConfig::load(Some(file.path())).is_err());
    }
}
