//! A/B update orchestration
//!
//! Sequence for one rollout:
//! 1. connect and read the Host Status (`trident get`)
//! 2. when staging, rewrite the configuration and upload it
//! 3. `trident run` with the requested allowed operations, classified and
//!    retried by the `RetryController`
//! 4. stage only: re-read the status and check the active volume is unchanged
//! 5. container finalize: wait out the reboot and run the engine again
//!
//! The session is closed on every exit path.

use crate::channel::{shell_quote, Connector, ExecOutput, RemoteChannel};
use crate::config::RolloutConfig;
use crate::engine::{EngineCommand, EngineInvoker, RuntimeEnv, UTILITY_TIMEOUT};
use crate::error::{Result, RolloutError};
use crate::host_config::{AllowedOperation, HostConfiguration};
use crate::host_status::{AbVolume, HostStatus};
use crate::outcome::{Outcome, SuccessCriterion};
use crate::retry::RetryController;
use crate::session::Session;
use crate::transform::{configure_forced_rollback, stage_update, PackagingFormat, StageParams};
use crate::yaml_tags::TagRegistry;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use tracing::{info, warn};

// ============================================================================
// Request and report
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbUpdateRequest {
    pub runtime_env: RuntimeEnv,
    /// Where the new configuration lands on the host, passed to `-c`.
    pub config_path: String,
    pub stage: bool,
    pub finalize: bool,
    /// Required when staging.
    pub version: Option<String>,
    /// Required when staging.
    pub destination_dir: Option<String>,
    pub packaging: PackagingFormat,
    /// `Some(true)` injects the forced rollback checks, `Some(false)` removes them.
    pub forced_rollback: Option<bool>,
}

impl AbUpdateRequest {
    pub fn stage_only(version: &str, destination_dir: &str) -> Self {
        Self {
            runtime_env: RuntimeEnv::Host,
            config_path: crate::config::HOST_CONFIG_PATH.to_string(),
            stage: true,
            finalize: false,
            version: Some(version.to_string()),
            destination_dir: Some(destination_dir.to_string()),
            packaging: PackagingFormat::default(),
            forced_rollback: None,
        }
    }

    pub fn allowed_operations(&self) -> Vec<AllowedOperation> {
        AllowedOperation::requested(self.stage, self.finalize)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.stage && !self.finalize {
            return Err(RolloutError::Config(
                "nothing to do: request staging, finalizing or both".to_string(),
            ));
        }
        if self.config_path.trim().is_empty() {
            return Err(RolloutError::Config("engine config path must not be empty".to_string()));
        }
        if self.stage && (self.version.is_none() || self.destination_dir.is_none()) {
            return Err(RolloutError::Config(
                "staging requires a version and a destination directory".to_string(),
            ));
        }
        Ok(())
    }

    fn stage_params(&self) -> Option<StageParams> {
        if !self.stage {
            return None;
        }
        let version = self.version.as_deref()?;
        let dir = self.destination_dir.as_deref()?;
        Some(
            StageParams::new(version, dir)
                .with_runtime_env(self.runtime_env)
                .with_packaging(self.packaging),
        )
    }
}

/// Summary of a finished rollout.
#[derive(Debug, Clone, Serialize)]
pub struct RolloutReport {
    pub host: Option<String>,
    pub runtime_env: RuntimeEnv,
    pub outcome: Outcome,
    /// Engine runs and reconnects spent, including the first run.
    pub attempts: u32,
    pub finalized: bool,
    pub active_volume_before: Option<AbVolume>,
    pub active_volume_after: Option<AbVolume>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Mode given to a staging directory that did not exist before the upload.
const DEFAULT_STAGING_MODE: &str = "755";

fn parse_mode(stat: &str) -> Option<String> {
    let mode = stat.trim();
    let octal = (3..=4).contains(&mode.len()) && mode.chars().all(|c| ('0'..='7').contains(&c));
    octal.then(|| mode.to_string())
}

fn volume_label(volume: Option<AbVolume>) -> String {
    volume.map_or_else(|| "unknown".to_string(), |v| v.to_string())
}

// ============================================================================
// Orchestrator
// ============================================================================

pub struct Orchestrator<K: Connector> {
    connector: K,
    config: RolloutConfig,
    registry: TagRegistry,
}

impl<K: Connector> Orchestrator<K> {
    pub fn new(connector: K, config: RolloutConfig) -> Self {
        Self {
            connector,
            config,
            registry: TagRegistry::with_defaults(),
        }
    }

    pub fn with_registry(mut self, registry: TagRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn connector(&self) -> &K {
        &self.connector
    }

    pub fn config(&self) -> &RolloutConfig {
        &self.config
    }

    fn invoker(&self, runtime_env: RuntimeEnv) -> EngineInvoker {
        EngineInvoker::new(self.config.engine.clone(), runtime_env)
    }

    /// Run an A/B update as described by `request`.
    pub async fn ab_update(&self, request: &AbUpdateRequest) -> Result<RolloutReport> {
        request.validate()?;
        let mut session = Session::new(&self.connector);
        let result = self.ab_update_in(&mut session, request).await;
        session.close().await;
        match &result {
            Ok(report) => info!(
                outcome = %report.outcome,
                attempts = report.attempts,
                finalized = report.finalized,
                "A/B update finished"
            ),
            Err(e) => warn!(code = e.code(), "A/B update failed: {}", e),
        }
        result
    }

    async fn ab_update_in(
        &self,
        session: &mut Session<'_, K>,
        request: &AbUpdateRequest,
    ) -> Result<RolloutReport> {
        let started_at = Utc::now();
        let invoker = self.invoker(request.runtime_env);
        let controller = RetryController::new(self.config.retry.policy(), self.config.classifier());

        let status = self.fetch_status(session, &invoker).await?;
        let before = status.ab_active_volume;
        info!(
            active_volume = %volume_label(before),
            servicing_state = ?status.servicing_state,
            "Read host status"
        );

        if let Some(params) = request.stage_params() {
            let mut next = stage_update(&status.spec, &params)?;
            if let Some(enabled) = request.forced_rollback {
                next = configure_forced_rollback(&next, enabled);
            }
            self.upload_config(session, &next, &request.config_path).await?;
        }

        let command = EngineCommand::run()
            .with_verbosity(&self.config.engine.verbosity)
            .with_config(&request.config_path)
            .with_allowed_operations(&request.allowed_operations());
        // A clean exit only counts when the engine logged a staged update. A
        // finalizing run that does not reboot has done nothing.
        let classified = controller
            .run_engine(session, &invoker, &command, SuccessCriterion::StagedMarker)
            .await?;

        let mut report = RolloutReport {
            host: session.host().map(str::to_string),
            runtime_env: request.runtime_env,
            outcome: classified.outcome,
            attempts: classified.attempts,
            finalized: false,
            active_volume_before: before,
            active_volume_after: None,
            started_at,
            finished_at: started_at,
        };

        if classified.outcome == Outcome::Success && request.stage && !request.finalize {
            let after = self.fetch_status(session, &invoker).await?.ab_active_volume;
            if after != before {
                return Err(RolloutError::ActiveVolumeFlipped {
                    before: volume_label(before),
                    after: volume_label(after),
                });
            }
            report.active_volume_after = after;
        }

        if request.finalize
            && request.runtime_env == RuntimeEnv::Container
            && classified.outcome == Outcome::RebootInProgress
        {
            session.close().await;
            let finalize = EngineCommand::run().with_verbosity(&self.config.engine.verbosity);
            let done = controller
                .finalize_after_reboot(session, &invoker, &finalize)
                .await?;
            report.outcome = done.outcome;
            report.attempts += done.attempts;
            report.finalized = true;

            match self.fetch_status(session, &invoker).await {
                Ok(status) => report.active_volume_after = status.ab_active_volume,
                Err(e) => warn!("Could not read host status after finalize: {}", e),
            }
        }

        report.finished_at = Utc::now();
        Ok(report)
    }

    async fn fetch_status(
        &self,
        session: &mut Session<'_, K>,
        invoker: &EngineInvoker,
    ) -> Result<HostStatus> {
        let output = invoker
            .invoke(session.channel().await?, &EngineCommand::get())
            .await?
            .require_success()?;
        HostStatus::parse_with(output.stdout.trim(), &self.registry)
    }

    /// Upload through the world-writable staging directory, then move the
    /// file into place as root. The staging directory gets its previous mode
    /// back even when the move fails; a directory created here ends at 755.
    async fn upload_config(
        &self,
        session: &mut Session<'_, K>,
        config: &HostConfiguration,
        target: &str,
    ) -> Result<()> {
        let yaml = config.to_yaml()?;
        let staging = self.config.staging.dir.trim_end_matches('/');
        let staged = format!("{}/hc.yaml", staging);
        let channel = session.channel().await?;

        let mode = Self::dir_mode(channel, staging)
            .await?
            .unwrap_or_else(|| DEFAULT_STAGING_MODE.to_string());
        channel
            .run_checked(&format!("sudo mkdir -p {}", shell_quote(staging)), UTILITY_TIMEOUT)
            .await?;
        channel
            .run_checked(&format!("sudo chmod 777 {}", shell_quote(staging)), UTILITY_TIMEOUT)
            .await?;

        let moved = Self::place_file(channel, &staged, target, yaml.as_bytes()).await;
        let locked = channel
            .run_checked(
                &format!("sudo chmod {} {}", mode, shell_quote(staging)),
                UTILITY_TIMEOUT,
            )
            .await;
        moved?;
        locked?;

        info!(host = channel.host(), path = target, bytes = yaml.len(), "Uploaded host configuration");
        Ok(())
    }

    /// Octal permission bits of `dir`, or `None` when it does not exist yet.
    async fn dir_mode(channel: &mut K::Channel, dir: &str) -> Result<Option<String>> {
        let output = channel
            .execute(&format!("sudo stat -c %a {}", shell_quote(dir)), UTILITY_TIMEOUT)
            .await?;
        if !output.success() {
            return Ok(None);
        }
        Ok(parse_mode(&output.stdout))
    }

    async fn place_file(
        channel: &mut K::Channel,
        staged: &str,
        target: &str,
        contents: &[u8],
    ) -> Result<()> {
        channel.write_file(staged, contents).await?;
        if let Some(parent) = Path::new(target).parent().and_then(Path::to_str) {
            if !parent.is_empty() && parent != "/" {
                channel
                    .run_checked(&format!("sudo mkdir -p {}", shell_quote(parent)), UTILITY_TIMEOUT)
                    .await?;
            }
        }
        channel
            .run_checked(
                &format!("sudo mv {} {}", shell_quote(staged), shell_quote(target)),
                UTILITY_TIMEOUT,
            )
            .await?;
        Ok(())
    }

    // ========================================================================
    // Secondary operations
    // ========================================================================

    /// Read the Host Status.
    pub async fn status(&self, runtime_env: RuntimeEnv) -> Result<HostStatus> {
        let mut session = Session::new(&self.connector);
        let result = self.fetch_status(&mut session, &self.invoker(runtime_env)).await;
        session.close().await;
        result
    }

    /// Commit a finalized update (`trident commit`).
    pub async fn commit(&self, runtime_env: RuntimeEnv) -> Result<ExecOutput> {
        self.engine_once(runtime_env, &EngineCommand::commit()).await
    }

    /// Rebuild RAID arrays after a disk replacement. The engine config at
    /// `config_path` is seeded from the default location when missing.
    pub async fn rebuild_raid(&self, runtime_env: RuntimeEnv, config_path: &str) -> Result<ExecOutput> {
        let mut session = Session::new(&self.connector);
        let result = self.rebuild_raid_in(&mut session, runtime_env, config_path).await;
        session.close().await;
        result
    }

    /// Seed the engine datastore from a Host Status file already on the host.
    pub async fn offline_initialize(&self, runtime_env: RuntimeEnv, status_path: &str) -> Result<ExecOutput> {
        let command = EngineCommand::offline_initialize(status_path)
            .with_verbosity(&self.config.engine.verbosity);
        self.engine_once(runtime_env, &command).await
    }

    /// Bring up the network described by the installed configuration.
    pub async fn start_network(&self, runtime_env: RuntimeEnv) -> Result<ExecOutput> {
        let command = EngineCommand::start_network().with_verbosity(&self.config.engine.verbosity);
        self.engine_once(runtime_env, &command).await
    }

    async fn engine_once(&self, runtime_env: RuntimeEnv, command: &EngineCommand) -> Result<ExecOutput> {
        let mut session = Session::new(&self.connector);
        let result = self.engine_checked(&mut session, runtime_env, command, None).await;
        session.close().await;
        result
    }

    async fn rebuild_raid_in(
        &self,
        session: &mut Session<'_, K>,
        runtime_env: RuntimeEnv,
        config_path: &str,
    ) -> Result<ExecOutput> {
        let channel = session.channel().await?;
        let exists = channel
            .execute(&format!("sudo test -f {}", shell_quote(config_path)), UTILITY_TIMEOUT)
            .await?;
        if !exists.success() {
            let source = &self.config.engine.host_config_path;
            info!(from = %source, to = config_path, "Seeding engine config for RAID rebuild");
            channel
                .run_checked(
                    &format!("sudo cp {} {}", shell_quote(source), shell_quote(config_path)),
                    UTILITY_TIMEOUT,
                )
                .await?;
        }

        let command = EngineCommand::rebuild_raid()
            .with_verbosity(&self.config.engine.verbosity)
            .with_config(config_path);
        let timeout = self.config.engine.rebuild_raid_timeout();
        self.engine_checked(session, runtime_env, &command, Some(timeout)).await
    }

    async fn engine_checked(
        &self,
        session: &mut Session<'_, K>,
        runtime_env: RuntimeEnv,
        command: &EngineCommand,
        timeout: Option<std::time::Duration>,
    ) -> Result<ExecOutput> {
        let invoker = self.invoker(runtime_env);
        let timeout = timeout.unwrap_or_else(|| invoker.command_timeout());
        invoker
            .invoke_with_timeout(session.channel().await?, command, timeout)
            .await?
            .require_success()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_validation() {
        let mut request = AbUpdateRequest::stage_only("2", "/abupdate");
        assert!(request.validate().is_ok());

        request.finalize = true;
        assert_eq!(AllowedOperation::join(&request.allowed_operations()), "stage,finalize");

        request.version = None;
        assert!(matches!(request.validate(), Err(RolloutError::Config(_))));

        request.stage = false;
        assert!(request.validate().is_ok());
        request.finalize = false;
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!(parse_mode("700\n").as_deref(), Some("700"));
        assert_eq!(parse_mode("1777").as_deref(), Some("1777"));
        assert_eq!(parse_mode(""), None);
        assert_eq!(parse_mode("stat: cannot stat"), None);
        assert_eq!(parse_mode("789"), None);
    }

    #[test]
    fn test_stage_params_follow_request() {
        let mut request = AbUpdateRequest::stage_only("9", "abupdate");
        request.runtime_env = RuntimeEnv::Container;
        request.packaging = PackagingFormat::Cosi;
        let params = request.stage_params().unwrap();
        assert_eq!(params.runtime_env, RuntimeEnv::Container);
        assert_eq!(params.packaging, PackagingFormat::Cosi);

        request.stage = false;
        assert!(request.stage_params().is_none());
    }
}
