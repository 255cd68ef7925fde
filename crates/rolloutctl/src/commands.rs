//! Command handlers
//!
//! Remote commands build an `Orchestrator` over SSH; `stage-config` and
//! `edit-network` work on local files only.

use crate::cli::{AbUpdateArgs, Cli, Commands, EditNetworkArgs, HostArgs, StageConfigArgs};
use anyhow::{Context, Result};
use rollout_common::transform::{
    add_ssh_key, configure_forced_rollback, restrict_operations, rewrite_network, stage_update,
    NetworkParams,
};
use rollout_common::{
    AbUpdateRequest, HostConfiguration, HostStatus, Orchestrator, RolloutConfig, RolloutReport,
    RuntimeEnv, SshConnector, SshTarget, StageParams,
};
use std::fs;
use std::path::Path;
use tracing::info;

pub async fn run(cli: Cli) -> Result<()> {
    let config =
        RolloutConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Commands::AbUpdate(args) => ab_update(config, &args).await,
        Commands::Status {
            target,
            runtime_env,
            json,
        } => status(config, &target, runtime_env, json).await,
        Commands::Commit {
            target,
            runtime_env,
        } => commit(config, &target, runtime_env).await,
        Commands::RebuildRaid {
            target,
            runtime_env,
            trident_config,
        } => rebuild_raid(config, &target, runtime_env, &trident_config).await,
        Commands::OfflineInitialize {
            target,
            runtime_env,
            status_path,
        } => offline_initialize(config, &target, runtime_env, &status_path).await,
        Commands::StartNetwork {
            target,
            runtime_env,
        } => start_network(config, &target, runtime_env).await,
        Commands::StageConfig(args) => stage_config(&config, &args),
        Commands::EditNetwork(args) => edit_network(&args),
    }
}

/// Apply connection flags on top of the `[ssh]` section.
pub fn apply_host_overrides(config: &mut RolloutConfig, target: &HostArgs) {
    if let Some(user) = &target.user {
        config.ssh.user = user.clone();
    }
    if let Some(path) = &target.keys_file_path {
        config.ssh.identity_file = Some(path.clone());
    }
    if let Some(port) = target.port {
        config.ssh.port = port;
    }
}

fn orchestrator(mut config: RolloutConfig, target: &HostArgs) -> Orchestrator<SshConnector> {
    apply_host_overrides(&mut config, target);
    let connector = SshConnector::new(SshTarget::new(&target.host, &config.ssh));
    Orchestrator::new(connector, config)
}

/// Build the update request from CLI flags and configuration defaults.
pub fn build_request(config: &RolloutConfig, args: &AbUpdateArgs) -> AbUpdateRequest {
    AbUpdateRequest {
        runtime_env: args.runtime_env,
        config_path: args.trident_config.clone(),
        stage: args.stage_ab_update,
        finalize: args.finalize_ab_update,
        version: args.version.clone(),
        destination_dir: args.destination_directory.clone(),
        packaging: args.packaging.unwrap_or(config.staging.packaging),
        forced_rollback: args.forced_rollback(),
    }
}

// ============================================================================
// Remote commands
// ============================================================================

async fn ab_update(mut config: RolloutConfig, args: &AbUpdateArgs) -> Result<()> {
    if let Some(max) = args.max_attempts {
        config.retry.max_attempts = max;
    }
    config.validate()?;

    let request = build_request(&config, args);
    info!(
        host = %args.target.host,
        runtime_env = %request.runtime_env,
        stage = request.stage,
        finalize = request.finalize,
        "Starting A/B update"
    );

    let report = orchestrator(config, &args.target)
        .ab_update(&request)
        .await
        .with_context(|| format!("A/B update on {} failed", args.target.host))?;
    print_report(&report, args.json)
}

async fn status(config: RolloutConfig, target: &HostArgs, runtime_env: RuntimeEnv, json: bool) -> Result<()> {
    let status = orchestrator(config, target)
        .status(runtime_env)
        .await
        .with_context(|| format!("Failed to read host status from {}", target.host))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        print!("{}", status.to_yaml()?);
    }
    Ok(())
}

async fn commit(config: RolloutConfig, target: &HostArgs, runtime_env: RuntimeEnv) -> Result<()> {
    orchestrator(config, target)
        .commit(runtime_env)
        .await
        .with_context(|| format!("Commit on {} failed", target.host))?;
    println!("Committed update on {}", target.host);
    Ok(())
}

async fn rebuild_raid(
    config: RolloutConfig,
    target: &HostArgs,
    runtime_env: RuntimeEnv,
    trident_config: &str,
) -> Result<()> {
    orchestrator(config, target)
        .rebuild_raid(runtime_env, trident_config)
        .await
        .with_context(|| format!("RAID rebuild on {} failed", target.host))?;
    println!("Rebuilt RAID arrays on {}", target.host);
    Ok(())
}

async fn offline_initialize(
    config: RolloutConfig,
    target: &HostArgs,
    runtime_env: RuntimeEnv,
    status_path: &str,
) -> Result<()> {
    orchestrator(config, target)
        .offline_initialize(runtime_env, status_path)
        .await
        .with_context(|| format!("Offline initialization on {} failed", target.host))?;
    println!("Initialized engine datastore on {} from {}", target.host, status_path);
    Ok(())
}

async fn start_network(config: RolloutConfig, target: &HostArgs, runtime_env: RuntimeEnv) -> Result<()> {
    orchestrator(config, target)
        .start_network(runtime_env)
        .await
        .with_context(|| format!("Starting network on {} failed", target.host))?;
    println!("Network started on {}", target.host);
    Ok(())
}

fn print_report(report: &RolloutReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    let volume = |v: Option<rollout_common::AbVolume>| v.map_or("unknown", |v| v.as_str());
    println!("Host:          {}", report.host.as_deref().unwrap_or("unknown"));
    println!("Outcome:       {}", report.outcome);
    println!("Attempts:      {}", report.attempts);
    println!("Finalized:     {}", if report.finalized { "yes" } else { "no" });
    println!(
        "Active volume: {} -> {}",
        volume(report.active_volume_before),
        volume(report.active_volume_after)
    );
    println!(
        "Duration:      {}s",
        (report.finished_at - report.started_at).num_seconds()
    );
    Ok(())
}

// ============================================================================
// Offline commands
// ============================================================================

fn read_config(path: &Path, from_status: bool) -> Result<HostConfiguration> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let hc = if from_status {
        HostStatus::parse(&text)?.spec
    } else {
        HostConfiguration::parse(&text)?
    };
    Ok(hc)
}

fn write_config(path: Option<&Path>, hc: &HostConfiguration) -> Result<()> {
    let yaml = hc.to_yaml()?;
    match path {
        Some(path) => {
            fs::write(path, &yaml).with_context(|| format!("Failed to write {}", path.display()))?;
            info!("Wrote {}", path.display());
        }
        None => print!("{}", yaml),
    }
    Ok(())
}

pub fn stage_config(config: &RolloutConfig, args: &StageConfigArgs) -> Result<()> {
    let current = read_config(&args.input, args.from_status)?;
    let params = StageParams::new(&args.version, &args.destination_directory)
        .with_runtime_env(args.runtime_env)
        .with_packaging(args.packaging.unwrap_or(config.staging.packaging));

    let mut next = stage_update(&current, &params)
        .with_context(|| format!("Failed to stage {}", args.input.display()))?;
    if !args.allowed_operations.is_empty() {
        next = restrict_operations(&next, &args.allowed_operations);
    }
    if let Some(enabled) = args.forced_rollback() {
        next = configure_forced_rollback(&next, enabled);
    }
    for (user, key) in &args.authorized_keys {
        next = add_ssh_key(&next, user, key)?;
    }

    write_config(args.output.as_deref(), &next)
}

pub fn edit_network(args: &EditNetworkArgs) -> Result<()> {
    let current = read_config(&args.input, false)?;

    let mut params = NetworkParams::new(&args.interface, &args.address);
    params.prefix_len = args.prefix_len;
    params.mac_address = args.mac_address.clone();
    params.gateway = args.gateway.clone();
    params.dhcp = args.dhcp;
    params.disk_devices = args.disks.iter().cloned().collect();

    let next = rewrite_network(&current, &params)
        .with_context(|| format!("Failed to rewrite network in {}", args.input.display()))?;
    write_config(args.output.as_deref(), &next)
}
