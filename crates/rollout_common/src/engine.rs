//! Remote engine invoker
//!
//! Builds `trident` command lines for the host binary or the containerized
//! engine and runs them over a channel. Container runs load the engine image
//! when needed and relax SELinux enforcement around the command.

use crate::channel::{shell_quote, ExecOutput, RemoteChannel, Termination};
use crate::config::EngineConfig;
use crate::error::{Result, RolloutError};
use crate::host_config::AllowedOperation;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Timeout for short housekeeping commands (file checks, chmod, getenforce).
pub const UTILITY_TIMEOUT: Duration = Duration::from_secs(60);

const IMAGE_LOAD_TIMEOUT: Duration = Duration::from_secs(600);

/// Host paths the containerized engine needs.
const CONTAINER_MOUNTS: &[(&str, &str)] = &[
    ("/etc/trident", "/etc/trident"),
    ("/var/lib/trident", "/var/lib/trident"),
    ("/", "/host"),
    ("/dev", "/dev"),
    ("/run", "/run"),
    ("/sys", "/sys"),
    ("/var/log", "/var/log"),
];

// ============================================================================
// Runtime environment
// ============================================================================

/// Where the engine runs on the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeEnv {
    #[default]
    Host,
    Container,
}

impl RuntimeEnv {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Container => "container",
        }
    }

    /// Prefix under which the engine sees the host's root filesystem.
    pub fn host_root(&self) -> &'static str {
        match self {
            Self::Host => "/",
            Self::Container => "/host/",
        }
    }
}

impl fmt::Display for RuntimeEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuntimeEnv {
    type Err = RolloutError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "host" => Ok(Self::Host),
            "container" => Ok(Self::Container),
            other => Err(RolloutError::Config(format!(
                "unknown runtime environment '{}' (expected host or container)",
                other
            ))),
        }
    }
}

// ============================================================================
// Engine commands
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineOperation {
    Run,
    Get,
    Commit,
    RebuildRaid,
    OfflineInitialize,
    StartNetwork,
}

impl EngineOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Get => "get",
            Self::Commit => "commit",
            Self::RebuildRaid => "rebuild-raid",
            Self::OfflineInitialize => "offline-initialize",
            Self::StartNetwork => "start-network",
        }
    }
}

/// One engine subcommand with its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineCommand {
    pub operation: EngineOperation,
    /// Positional arguments following the subcommand.
    pub positional: Vec<String>,
    pub verbosity: Option<String>,
    pub config_path: Option<String>,
    pub allowed_operations: Vec<AllowedOperation>,
}

impl EngineCommand {
    pub fn new(operation: EngineOperation) -> Self {
        Self {
            operation,
            positional: Vec::new(),
            verbosity: None,
            config_path: None,
            allowed_operations: Vec::new(),
        }
    }

    pub fn run() -> Self {
        Self::new(EngineOperation::Run)
    }

    pub fn get() -> Self {
        Self::new(EngineOperation::Get)
    }

    pub fn commit() -> Self {
        Self::new(EngineOperation::Commit)
    }

    pub fn rebuild_raid() -> Self {
        Self::new(EngineOperation::RebuildRaid)
    }

    /// Initialize the engine's datastore from a saved Host Status.
    pub fn offline_initialize(status_path: &str) -> Self {
        let mut cmd = Self::new(EngineOperation::OfflineInitialize);
        cmd.positional.push(status_path.to_string());
        cmd
    }

    pub fn start_network() -> Self {
        Self::new(EngineOperation::StartNetwork)
    }

    pub fn with_verbosity(mut self, level: &str) -> Self {
        self.verbosity = Some(level.to_string()).filter(|l| !l.is_empty());
        self
    }

    pub fn with_config(mut self, path: &str) -> Self {
        self.config_path = Some(path.to_string());
        self
    }

    pub fn with_allowed_operations(mut self, ops: &[AllowedOperation]) -> Self {
        self.allowed_operations = ops.to_vec();
        self
    }

    /// Arguments after the program, e.g. `run -v trace -c /etc/trident/config.yaml --allowed-operations stage`.
    pub fn args(&self) -> String {
        let mut parts = vec![self.operation.as_str().to_string()];
        parts.extend(self.positional.iter().map(|arg| shell_quote(arg)));
        if let Some(level) = &self.verbosity {
            parts.push("-v".to_string());
            parts.push(shell_quote(level));
        }
        if let Some(path) = &self.config_path {
            parts.push("-c".to_string());
            parts.push(shell_quote(path));
        }
        if !self.allowed_operations.is_empty() {
            parts.push("--allowed-operations".to_string());
            parts.push(AllowedOperation::join(&self.allowed_operations));
        }
        parts.join(" ")
    }
}

/// `docker run` prefix for the containerized engine.
pub fn container_run_command(image: &str) -> String {
    let mut parts = vec!["docker run --pull=never --rm --privileged".to_string()];
    for (host, container) in CONTAINER_MOUNTS {
        parts.push(format!("-v {}:{}", host, container));
    }
    parts.push("--pid host --ipc host".to_string());
    parts.push(shell_quote(image));
    parts.join(" ")
}

// ============================================================================
// SELinux enforcement
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enforcement {
    Enforcing,
    Permissive,
    Disabled,
}

impl Enforcement {
    fn parse(text: &str) -> Self {
        match text.trim() {
            "Enforcing" => Self::Enforcing,
            "Permissive" => Self::Permissive,
            _ => Self::Disabled,
        }
    }
}

async fn current_enforcement<C: RemoteChannel + ?Sized>(channel: &mut C) -> Result<Enforcement> {
    let out = channel
        .run_checked(
            "command -v getenforce >/dev/null 2>&1 && getenforce || echo Disabled",
            UTILITY_TIMEOUT,
        )
        .await?;
    Ok(Enforcement::parse(&out.stdout))
}

/// Switch an enforcing host to permissive. Returns the mode to restore.
async fn relax_enforcement<C: RemoteChannel + ?Sized>(channel: &mut C) -> Result<Option<Enforcement>> {
    let mode = current_enforcement(channel).await?;
    debug!(host = channel.host(), ?mode, "SELinux mode before engine run");
    if mode != Enforcement::Enforcing {
        return Ok(None);
    }
    channel.run_checked("sudo setenforce 0", UTILITY_TIMEOUT).await?;
    info!(host = channel.host(), "Set SELinux to permissive for the container run");
    Ok(Some(mode))
}

async fn restore_enforcement<C: RemoteChannel + ?Sized>(channel: &mut C, mode: Enforcement) -> Result<()> {
    if mode == Enforcement::Enforcing {
        channel.run_checked("sudo setenforce 1", UTILITY_TIMEOUT).await?;
        info!(host = channel.host(), "Restored SELinux enforcing mode");
    }
    Ok(())
}

// ============================================================================
// Invoker
// ============================================================================

#[derive(Debug, Clone)]
pub struct EngineInvoker {
    config: EngineConfig,
    runtime_env: RuntimeEnv,
}

impl EngineInvoker {
    pub fn new(config: EngineConfig, runtime_env: RuntimeEnv) -> Self {
        Self { config, runtime_env }
    }

    pub fn runtime_env(&self) -> RuntimeEnv {
        self.runtime_env
    }

    pub fn command_timeout(&self) -> Duration {
        self.config.command_timeout()
    }

    pub fn command_line(&self, command: &EngineCommand) -> String {
        let program = match self.runtime_env {
            RuntimeEnv::Host => shell_quote(&self.config.binary_path),
            RuntimeEnv::Container => container_run_command(&self.config.container_image),
        };
        format!("sudo {} {}", program, command.args())
    }

    /// Make sure the engine image is present, loading it from the archive.
    pub async fn prepare_container<C: RemoteChannel + ?Sized>(&self, channel: &mut C) -> Result<()> {
        let archive = &self.config.container_archive;
        let exists = channel
            .execute(&format!("test -f {}", shell_quote(archive)), UTILITY_TIMEOUT)
            .await?;
        if !exists.success() {
            return Err(RolloutError::ContainerImageMissing(archive.clone()));
        }

        let image = &self.config.container_image;
        let listed = channel
            .run_checked(
                &format!("sudo docker images -q {}", shell_quote(image)),
                UTILITY_TIMEOUT,
            )
            .await?;
        if !listed.stdout.trim().is_empty() {
            debug!(host = channel.host(), image = %image, "Engine image already loaded");
            return Ok(());
        }

        info!(host = channel.host(), archive = %archive, "Loading engine image");
        channel
            .run_checked(
                &format!("sudo docker load --input {}", shell_quote(archive)),
                IMAGE_LOAD_TIMEOUT,
            )
            .await?;
        Ok(())
    }

    pub async fn invoke<C: RemoteChannel + ?Sized>(
        &self,
        channel: &mut C,
        command: &EngineCommand,
    ) -> Result<ExecOutput> {
        self.invoke_with_timeout(channel, command, self.command_timeout())
            .await
    }

    pub async fn invoke_with_timeout<C: RemoteChannel + ?Sized>(
        &self,
        channel: &mut C,
        command: &EngineCommand,
        timeout: Duration,
    ) -> Result<ExecOutput> {
        let relaxed = match self.runtime_env {
            RuntimeEnv::Host => None,
            RuntimeEnv::Container => {
                self.prepare_container(channel).await?;
                relax_enforcement(channel).await?
            }
        };

        let line = self.command_line(command);
        info!(host = channel.host(), command = %line, "Invoking engine");
        let result = channel.execute(&line, timeout).await;

        if let Some(mode) = relaxed {
            if let Err(e) = restore_enforcement(channel, mode).await {
                if self.interrupted(&result) {
                    warn!(
                        host = channel.host(),
                        "Could not restore SELinux mode after interrupted run, reboot resets it: {}",
                        e
                    );
                } else {
                    return Err(e);
                }
            }
        }

        let output = result?;
        info!(
            host = channel.host(),
            exit_code = ?output.exit_code(),
            termination = ?output.termination,
            elapsed_ms = output.elapsed.as_millis() as u64,
            "Engine command finished"
        );
        Ok(output)
    }

    /// Whether the run ended in a way that suggests the host went down.
    fn interrupted(&self, result: &Result<ExecOutput>) -> bool {
        match result {
            Err(_) => true,
            Ok(out) => match out.termination {
                Termination::Exited(code) => code == self.config.reboot_exit_code,
                Termination::Disconnected | Termination::TimedOut => true,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Connector, FakeConnectorBuilder};

    #[test]
    fn test_run_args() {
        let cmd = EngineCommand::run()
            .with_verbosity("trace")
            .with_config("/etc/trident/config.yaml")
            .with_allowed_operations(&[AllowedOperation::Stage, AllowedOperation::Finalize]);
        assert_eq!(
            cmd.args(),
            "run -v trace -c /etc/trident/config.yaml --allowed-operations stage,finalize"
        );
        assert_eq!(EngineCommand::get().args(), "get");
        assert_eq!(
            EngineCommand::offline_initialize("/var/lib/trident/host status.yaml")
                .with_verbosity("debug")
                .args(),
            "offline-initialize '/var/lib/trident/host status.yaml' -v debug"
        );
        assert_eq!(EngineCommand::start_network().args(), "start-network");
    }

    #[test]
    fn test_command_line_per_runtime() {
        let host = EngineInvoker::new(EngineConfig::default(), RuntimeEnv::Host);
        assert_eq!(host.command_line(&EngineCommand::get()), "sudo /usr/bin/trident get");

        let container = EngineInvoker::new(EngineConfig::default(), RuntimeEnv::Container);
        let line = container.command_line(&EngineCommand::commit());
        assert!(line.starts_with("sudo docker run --pull=never --rm --privileged"));
        assert!(line.contains("-v /:/host"));
        assert!(line.ends_with("trident/trident:latest commit"));
    }

    #[test]
    fn test_runtime_env_from_str() {
        assert_eq!("Container".parse::<RuntimeEnv>().unwrap(), RuntimeEnv::Container);
        assert_eq!(RuntimeEnv::Container.host_root(), "/host/");
        assert!("vm".parse::<RuntimeEnv>().is_err());
    }

    #[tokio::test]
    async fn test_container_loads_missing_image_and_restores_selinux() {
        let fake = FakeConnectorBuilder::new()
            .respond("docker images -q", ExecOutput::ok(""))
            .respond("getenforce", ExecOutput::ok("Enforcing\n"))
            .respond("trident/trident:latest get", ExecOutput::ok("spec: {}\n"))
            .build();
        let mut channel = fake.connect().await.unwrap();
        let invoker = EngineInvoker::new(EngineConfig::default(), RuntimeEnv::Container);

        let out = invoker.invoke(&mut channel, &EngineCommand::get()).await.unwrap();
        assert!(out.success());

        let executed = fake.executed();
        let position = |needle: &str| executed.iter().position(|c| c.contains(needle)).unwrap();
        assert!(position("test -f") < position("docker load"));
        assert!(position("setenforce 0") < position("latest get"));
        assert!(position("latest get") < position("setenforce 1"));
    }

    #[tokio::test]
    async fn test_container_skips_load_when_image_present() {
        let fake = FakeConnectorBuilder::new()
            .respond("docker images -q", ExecOutput::ok("3f2a1b\n"))
            .respond("getenforce", ExecOutput::ok("Permissive\n"))
            .build();
        let mut channel = fake.connect().await.unwrap();
        let invoker = EngineInvoker::new(EngineConfig::default(), RuntimeEnv::Container);

        invoker.invoke(&mut channel, &EngineCommand::get()).await.unwrap();
        assert_eq!(fake.count_matching("docker load"), 0);
        assert_eq!(fake.count_matching("setenforce"), 0);
    }

    #[tokio::test]
    async fn test_container_archive_missing() {
        let fake = FakeConnectorBuilder::new()
            .respond("test -f", ExecOutput::exited(1, "", ""))
            .build();
        let mut channel = fake.connect().await.unwrap();
        let invoker = EngineInvoker::new(EngineConfig::default(), RuntimeEnv::Container);

        let err = invoker.invoke(&mut channel, &EngineCommand::get()).await.unwrap_err();
        assert!(matches!(err, RolloutError::ContainerImageMissing(_)));
        assert_eq!(fake.count_matching("trident/trident:latest get"), 0);
    }

    #[tokio::test]
    async fn test_restore_failure_after_reboot_is_tolerated() {
        let fake = FakeConnectorBuilder::new()
            .respond("docker images -q", ExecOutput::ok("3f2a1b\n"))
            .respond("getenforce", ExecOutput::ok("Enforcing\n"))
            .transport_error("setenforce 1", "Connection refused")
            .respond("latest run", ExecOutput::disconnected("", "Rebooting system"))
            .build();
        let mut channel = fake.connect().await.unwrap();
        let invoker = EngineInvoker::new(EngineConfig::default(), RuntimeEnv::Container);

        let out = invoker.invoke(&mut channel, &EngineCommand::run()).await.unwrap();
        assert_eq!(out.termination, Termination::Disconnected);
    }

    #[tokio::test]
    async fn test_restore_failure_after_clean_exit_is_error() {
        let fake = FakeConnectorBuilder::new()
            .respond("docker images -q", ExecOutput::ok("3f2a1b\n"))
            .respond("getenforce", ExecOutput::ok("Enforcing\n"))
            .respond("setenforce 1", ExecOutput::exited(1, "", "setenforce: permission denied"))
            .build();
        let mut channel = fake.connect().await.unwrap();
        let invoker = EngineInvoker::new(EngineConfig::default(), RuntimeEnv::Container);

        let err = invoker.invoke(&mut channel, &EngineCommand::get()).await.unwrap_err();
        assert!(matches!(err, RolloutError::HardFailure { .. }));
    }
}
