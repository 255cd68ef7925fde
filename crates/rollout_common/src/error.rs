//! Error types for the rollout orchestrator.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RolloutError {
    /// Authentication failure, unreachable host or protocol error.
    #[error("Transport error on {host}: {message}")]
    Transport { host: String, message: String },

    #[error("Malformed document: {0}")]
    Parse(String),

    #[error("Unregistered YAML tag '!{0}' in document")]
    UnknownTag(String),

    /// The configuration cannot be transformed without risking a write to the wrong device.
    #[error("Configuration consistency error: {0}")]
    TransformPrecondition(String),

    #[error("Remote command timed out after {timeout_secs}s without a reboot marker in its output")]
    AmbiguousTimeout { timeout_secs: u64, output: String },

    #[error("Retry budget exhausted after {attempts} attempts (last exit code: {exit_code:?})")]
    RetryBudgetExhausted {
        attempts: u32,
        exit_code: Option<i32>,
        output: String,
    },

    #[error("Remote engine failed with exit code {exit_code:?}: {output}")]
    HardFailure { exit_code: Option<i32>, output: String },

    #[error("Overall deadline of {0}s exceeded")]
    DeadlineExceeded(u64),

    #[error("Active A/B volume changed from {before} to {after} while only staging was allowed")]
    ActiveVolumeFlipped { before: String, after: String },

    #[error("Container image archive not found on host at {0}")]
    ContainerImageMissing(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl RolloutError {
    /// Stable process exit code for each failure class.
    pub fn code(&self) -> i32 {
        match self {
            RolloutError::Transport { .. } => 10,
            RolloutError::Parse(_) => 11,
            RolloutError::UnknownTag(_) => 11,
            RolloutError::Yaml(_) => 11,
            RolloutError::TransformPrecondition(_) => 12,
            RolloutError::AmbiguousTimeout { .. } => 13,
            RolloutError::RetryBudgetExhausted { .. } => 14,
            RolloutError::HardFailure { .. } => 15,
            RolloutError::DeadlineExceeded(_) => 16,
            RolloutError::ActiveVolumeFlipped { .. } => 17,
            RolloutError::ContainerImageMissing(_) => 18,
            RolloutError::Config(_) => 19,
            RolloutError::Io(_) => 20,
        }
    }

    pub fn transport(host: impl Into<String>, message: impl Into<String>) -> Self {
        RolloutError::Transport {
            host: host.into(),
            message: message.into(),
        }
    }

    /// Whether the failure came from the transport rather than the remote engine.
    pub fn is_transport(&self) -> bool {
        matches!(self, RolloutError::Transport { .. })
    }
}

pub type Result<T, E = RolloutError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_failures_share_code() {
        let yaml_err = serde_yaml::from_str::<u32>("not a number").unwrap_err();
        assert_eq!(RolloutError::Parse("x".into()).code(), RolloutError::Yaml(yaml_err).code());
        assert_eq!(RolloutError::UnknownTag("foo".into()).code(), 11);
    }

    #[test]
    fn test_transport_display_names_host() {
        let err = RolloutError::transport("10.0.0.4", "Connection refused");
        assert!(err.is_transport());
        assert_eq!(err.to_string(), "Transport error on 10.0.0.4: Connection refused");
    }
}
