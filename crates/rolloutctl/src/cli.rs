//! CLI - Command-line argument parsing
//!
//! Defines the CLI structure using clap.
//! Keeps argument parsing separate from execution logic.

use clap::{Args, Parser, Subcommand};
use rollout_common::config::HOST_CONFIG_PATH;
use rollout_common::{AllowedOperation, PackagingFormat, RuntimeEnv};
use std::path::PathBuf;

/// Trident A/B update driver
#[derive(Parser, Debug)]
#[command(name = "rolloutctl")]
#[command(about = "Drive Trident A/B updates on remote hosts", long_about = None)]
#[command(version)]
#[command(disable_help_subcommand = true)]
pub struct Cli {
    /// Config file (default: /etc/trident-rollout/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Debug logging. RUST_LOG takes precedence.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Stage and/or finalize an A/B update on a host
    AbUpdate(AbUpdateArgs),

    /// Print the host status reported by the engine
    Status {
        #[command(flatten)]
        target: HostArgs,

        #[arg(long, default_value_t = RuntimeEnv::Host)]
        runtime_env: RuntimeEnv,

        /// Output JSON instead of YAML
        #[arg(long)]
        json: bool,
    },

    /// Commit a finalized update
    Commit {
        #[command(flatten)]
        target: HostArgs,

        #[arg(long, default_value_t = RuntimeEnv::Host)]
        runtime_env: RuntimeEnv,
    },

    /// Rebuild RAID arrays after a disk replacement
    RebuildRaid {
        #[command(flatten)]
        target: HostArgs,

        #[arg(long, default_value_t = RuntimeEnv::Host)]
        runtime_env: RuntimeEnv,

        /// Engine config on the host, seeded from the installed one when missing
        #[arg(long)]
        trident_config: String,
    },

    /// Initialize the engine datastore from a Host Status file on the host
    OfflineInitialize {
        #[command(flatten)]
        target: HostArgs,

        #[arg(long, default_value_t = RuntimeEnv::Host)]
        runtime_env: RuntimeEnv,

        /// Host Status file on the host
        #[arg(long)]
        status_path: String,
    },

    /// Bring up the network from the installed configuration
    StartNetwork {
        #[command(flatten)]
        target: HostArgs,

        #[arg(long, default_value_t = RuntimeEnv::Host)]
        runtime_env: RuntimeEnv,
    },

    /// Rewrite a local Host Configuration file for a new version
    StageConfig(StageConfigArgs),

    /// Rewrite the network section of a local Host Configuration file
    EditNetwork(EditNetworkArgs),
}

/// Connection flags shared by every remote command.
#[derive(Args, Debug, Clone)]
pub struct HostArgs {
    /// Host name or IP address
    #[arg(long)]
    pub host: String,

    /// Login user (overrides ssh.user)
    #[arg(short, long)]
    pub user: Option<String>,

    /// Private key file (overrides ssh.identity_file)
    #[arg(short, long = "keys-file-path")]
    pub keys_file_path: Option<PathBuf>,

    #[arg(short, long)]
    pub port: Option<u16>,
}

#[derive(Args, Debug, Clone)]
pub struct AbUpdateArgs {
    #[command(flatten)]
    pub target: HostArgs,

    #[arg(long, default_value_t = RuntimeEnv::Host)]
    pub runtime_env: RuntimeEnv,

    /// Where the new configuration is placed on the host
    #[arg(long, default_value = HOST_CONFIG_PATH)]
    pub trident_config: String,

    /// Version suffix of the new images
    #[arg(long)]
    pub version: Option<String>,

    /// Directory on the host holding the new images
    #[arg(long)]
    pub destination_directory: Option<String>,

    #[arg(long)]
    pub stage_ab_update: bool,

    #[arg(long)]
    pub finalize_ab_update: bool,

    /// Image packaging (overrides staging.packaging)
    #[arg(long)]
    pub packaging: Option<PackagingFormat>,

    /// Add health checks that fail and force a rollback
    #[arg(long, conflicts_with = "clear_forced_rollback")]
    pub forced_rollback: bool,

    /// Remove previously added forced rollback checks
    #[arg(long)]
    pub clear_forced_rollback: bool,

    /// Engine runs allowed, including the first (overrides retry.max_attempts)
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

impl AbUpdateArgs {
    pub fn forced_rollback(&self) -> Option<bool> {
        forced_rollback(self.forced_rollback, self.clear_forced_rollback)
    }
}

#[derive(Args, Debug, Clone)]
pub struct StageConfigArgs {
    /// Host Configuration to read
    pub input: PathBuf,

    /// Where to write the result (default: stdout)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Input is saved `trident get` output; its spec is used
    #[arg(long)]
    pub from_status: bool,

    #[arg(long)]
    pub version: String,

    #[arg(long)]
    pub destination_directory: String,

    #[arg(long, default_value_t = RuntimeEnv::Host)]
    pub runtime_env: RuntimeEnv,

    #[arg(long)]
    pub packaging: Option<PackagingFormat>,

    /// Restrict the engine to these operations
    #[arg(long, value_delimiter = ',')]
    pub allowed_operations: Vec<AllowedOperation>,

    #[arg(long, conflicts_with = "clear_forced_rollback")]
    pub forced_rollback: bool,

    #[arg(long)]
    pub clear_forced_rollback: bool,

    /// Authorize a public key for a user, as USER=KEY
    #[arg(long = "authorize-key", value_parser = parse_key_value)]
    pub authorized_keys: Vec<(String, String)>,
}

impl StageConfigArgs {
    pub fn forced_rollback(&self) -> Option<bool> {
        forced_rollback(self.forced_rollback, self.clear_forced_rollback)
    }
}

#[derive(Args, Debug, Clone)]
pub struct EditNetworkArgs {
    pub input: PathBuf,

    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Management interface name
    #[arg(long)]
    pub interface: String,

    #[arg(long)]
    pub address: String,

    #[arg(long, default_value_t = rollout_common::transform::network::DEFAULT_PREFIX_LEN)]
    pub prefix_len: u8,

    #[arg(long)]
    pub mac_address: Option<String>,

    #[arg(long)]
    pub gateway: Option<String>,

    #[arg(long)]
    pub dhcp: bool,

    /// Remap a disk device, as ID=PATH
    #[arg(long = "disk", value_parser = parse_key_value)]
    pub disks: Vec<(String, String)>,
}

fn forced_rollback(enable: bool, clear: bool) -> Option<bool> {
    match (enable, clear) {
        (true, _) => Some(true),
        (false, true) => Some(false),
        (false, false) => None,
    }
}

/// Parse `KEY=VALUE`. The value may itself contain `=`.
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))?;
    if key.trim().is_empty() || value.trim().is_empty() {
        return Err(format!("expected KEY=VALUE, got '{}'", s));
    }
    Ok((key.trim().to_string(), value.trim().to_string()))
}
