//! Outcome classification
//!
//! Maps how a `trident run` ended (termination kind plus log text) onto one
//! of five outcomes. The mapping is pure and total.
//!
//! | termination            | log contains        | outcome                     |
//! |------------------------|---------------------|-----------------------------|
//! | exit 0                 | staged (if required)| Success                     |
//! | exit 0                 | staged missing      | HardFailure                 |
//! | reboot exit code       | reboot              | RebootInProgress            |
//! | disconnected/timed out | reboot              | RebootInProgress            |
//! | timed out              | (no reboot)         | AmbiguousTimeout            |
//! | other non-zero         | forced rerun        | IntentionalRetryableFailure |
//! | anything else          |                     | HardFailure                 |

use crate::channel::{ExecOutput, Termination};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const REBOOT_MARKER: &str = "[INFO  trident::engine] Rebooting system";
pub const STAGED_MARKER: &str = "[INFO  trident::engine] Staging of update 'AbUpdate' succeeded";
pub const FORCED_RERUN_MARKER: &str = "[DEBUG trident::engine::hooks] Running script fail-on-the-first-run-to-force-rerun with interpreter /usr/bin/python3";

/// Exit status reported when the session drops because the host rebooted.
pub const DEFAULT_REBOOT_EXIT_CODE: i32 = -1;

/// Log lines the engine emits at decision points.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMarkers {
    #[serde(default = "default_reboot")]
    pub reboot: String,

    #[serde(default = "default_staged")]
    pub staged: String,

    #[serde(default = "default_forced_rerun")]
    pub forced_rerun: String,
}

fn default_reboot() -> String {
    REBOOT_MARKER.to_string()
}

fn default_staged() -> String {
    STAGED_MARKER.to_string()
}

fn default_forced_rerun() -> String {
    FORCED_RERUN_MARKER.to_string()
}

impl Default for LogMarkers {
    fn default() -> Self {
        Self {
            reboot: default_reboot(),
            staged: default_staged(),
            forced_rerun: default_forced_rerun(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    RebootInProgress,
    AmbiguousTimeout,
    IntentionalRetryableFailure,
    HardFailure,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::RebootInProgress => "reboot_in_progress",
            Self::AmbiguousTimeout => "ambiguous_timeout",
            Self::IntentionalRetryableFailure => "intentional_retryable_failure",
            Self::HardFailure => "hard_failure",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a clean exit must also show to count as success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuccessCriterion {
    /// Post-reboot finalize runs.
    ExitZero,
    /// Every `trident run` that stages or finalizes must log the staged marker.
    StagedMarker,
}

#[derive(Debug, Clone)]
pub struct OutcomeClassifier {
    markers: LogMarkers,
    reboot_exit_code: i32,
}

impl OutcomeClassifier {
    pub fn new(markers: LogMarkers, reboot_exit_code: i32) -> Self {
        Self {
            markers,
            reboot_exit_code,
        }
    }

    pub fn markers(&self) -> &LogMarkers {
        &self.markers
    }

    pub fn classify(&self, result: &ExecOutput, criterion: SuccessCriterion) -> Outcome {
        let log = result.combined();
        let rebooting = log.contains(&self.markers.reboot);

        match result.termination {
            Termination::TimedOut if rebooting => Outcome::RebootInProgress,
            Termination::TimedOut => Outcome::AmbiguousTimeout,
            Termination::Disconnected if rebooting => Outcome::RebootInProgress,
            Termination::Disconnected => Outcome::HardFailure,
            Termination::Exited(0) => match criterion {
                SuccessCriterion::ExitZero => Outcome::Success,
                SuccessCriterion::StagedMarker if log.contains(&self.markers.staged) => {
                    Outcome::Success
                }
                SuccessCriterion::StagedMarker => Outcome::HardFailure,
            },
            Termination::Exited(code) if code == self.reboot_exit_code && rebooting => {
                Outcome::RebootInProgress
            }
            Termination::Exited(_) if log.contains(&self.markers.forced_rerun) => {
                Outcome::IntentionalRetryableFailure
            }
            Termination::Exited(_) => Outcome::HardFailure,
        }
    }
}

impl Default for OutcomeClassifier {
    fn default() -> Self {
        Self::new(LogMarkers::default(), DEFAULT_REBOOT_EXIT_CODE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(out: ExecOutput) -> Outcome {
        OutcomeClassifier::default().classify(&out, SuccessCriterion::StagedMarker)
    }

    #[test]
    fn test_staged_success_needs_marker() {
        assert_eq!(classify(ExecOutput::exited(0, "", STAGED_MARKER)), Outcome::Success);
        assert_eq!(classify(ExecOutput::exited(0, "", "done")), Outcome::HardFailure);

        let finalize = OutcomeClassifier::default()
            .classify(&ExecOutput::ok(""), SuccessCriterion::ExitZero);
        assert_eq!(finalize, Outcome::Success);
    }

    #[test]
    fn test_reboot_paths() {
        let log = format!("line\n{}\n", REBOOT_MARKER);
        assert_eq!(classify(ExecOutput::exited(-1, "", log.clone())), Outcome::RebootInProgress);
        assert_eq!(classify(ExecOutput::timed_out(log.clone(), "")), Outcome::RebootInProgress);
        assert_eq!(classify(ExecOutput::disconnected("", log.clone())), Outcome::RebootInProgress);
        // Exit code alone is not enough.
        assert_eq!(classify(ExecOutput::exited(-1, "", "")), Outcome::HardFailure);
        // Marker with an unrelated exit code is not a reboot.
        assert_eq!(classify(ExecOutput::exited(3, "", log)), Outcome::HardFailure);
    }

    #[test]
    fn test_timeout_without_marker_is_ambiguous() {
        assert_eq!(classify(ExecOutput::timed_out("partial", "")), Outcome::AmbiguousTimeout);
        assert_eq!(classify(ExecOutput::disconnected("partial", "")), Outcome::HardFailure);
    }

    #[test]
    fn test_forced_rerun_is_retryable() {
        let out = ExecOutput::exited(2, FORCED_RERUN_MARKER, "error: script failed");
        assert_eq!(classify(out), Outcome::IntentionalRetryableFailure);
    }

    #[test]
    fn test_custom_reboot_exit_code() {
        let classifier = OutcomeClassifier::new(LogMarkers::default(), 255);
        let out = ExecOutput::exited(255, "", REBOOT_MARKER);
        assert_eq!(
            classifier.classify(&out, SuccessCriterion::ExitZero),
            Outcome::RebootInProgress
        );
    }
}
