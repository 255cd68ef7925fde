//! Bounded retry around engine runs.
//!
//! `max_attempts` counts every engine invocation including the first. A
//! reconnect that fails consumes an attempt as well. All waiting happens
//! under one overall deadline.

use crate::channel::{Connector, ExecOutput};
use crate::engine::{EngineCommand, EngineInvoker};
use crate::error::{Result, RolloutError};
use crate::outcome::{Outcome, OutcomeClassifier, SuccessCriterion};
use crate::session::Session;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
    pub settle_delay: Duration,
    pub overall_budget: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            interval: Duration::from_secs(60),
            settle_delay: Duration::from_secs(60),
            overall_budget: Duration::from_secs(3600),
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts. Used by tests and dry runs.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            interval: Duration::ZERO,
            settle_delay: Duration::ZERO,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn start(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.started.elapsed())
    }

    pub fn check(&self) -> Result<()> {
        if self.started.elapsed() > self.budget {
            return Err(RolloutError::DeadlineExceeded(self.budget.as_secs()));
        }
        Ok(())
    }

    /// Sleep for `delay`, failing early if the deadline falls inside it.
    pub async fn sleep(&self, delay: Duration) -> Result<()> {
        self.check()?;
        let remaining = self.remaining();
        if delay > remaining {
            tokio::time::sleep(remaining).await;
            return Err(RolloutError::DeadlineExceeded(self.budget.as_secs()));
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }
}

/// Result of a classified engine run.
#[derive(Debug, Clone)]
pub struct Classified {
    pub outcome: Outcome,
    pub output: ExecOutput,
    /// Engine invocations and reconnects spent, including the first run.
    pub attempts: u32,
}

impl Classified {
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

pub struct RetryController {
    policy: RetryPolicy,
    classifier: OutcomeClassifier,
    deadline: Deadline,
}

impl RetryController {
    /// Starts the overall deadline.
    pub fn new(policy: RetryPolicy, classifier: OutcomeClassifier) -> Self {
        let deadline = Deadline::start(policy.overall_budget);
        Self {
            policy,
            classifier,
            deadline,
        }
    }

    pub fn deadline(&self) -> &Deadline {
        &self.deadline
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `command` until it reaches a terminal outcome.
    ///
    /// Only `IntentionalRetryableFailure` is retried: wait, reconnect, run
    /// again. `Success` and `RebootInProgress` are returned; timeouts without
    /// a reboot marker and hard failures are errors.
    pub async fn run_engine<K: Connector>(
        &self,
        session: &mut Session<'_, K>,
        invoker: &EngineInvoker,
        command: &EngineCommand,
        criterion: SuccessCriterion,
    ) -> Result<Classified> {
        let mut attempt: u32 = 1;
        loop {
            self.deadline.check()?;
            let output = invoker.invoke(session.channel().await?, command).await?;
            let outcome = self.classifier.classify(&output, criterion);
            info!(
                attempt,
                max_attempts = self.policy.max_attempts,
                exit_code = ?output.exit_code(),
                outcome = %outcome,
                "Classified engine run"
            );

            match outcome {
                Outcome::Success | Outcome::RebootInProgress => {
                    return Ok(Classified {
                        outcome,
                        output,
                        attempts: attempt,
                    })
                }
                Outcome::AmbiguousTimeout => {
                    return Err(RolloutError::AmbiguousTimeout {
                        timeout_secs: invoker.command_timeout().as_secs(),
                        output: output.combined(),
                    })
                }
                Outcome::HardFailure => {
                    return Err(RolloutError::HardFailure {
                        exit_code: output.exit_code(),
                        output: output.combined(),
                    })
                }
                Outcome::IntentionalRetryableFailure => {
                    warn!(attempt, "Intentional engine failure, reconnecting to run again");
                    attempt = self.reconnect_for_retry(session, attempt, &output).await?;
                }
            }
        }
    }

    /// Reconnect for the next attempt. Returns the attempt number to run.
    async fn reconnect_for_retry<K: Connector>(
        &self,
        session: &mut Session<'_, K>,
        mut attempt: u32,
        last: &ExecOutput,
    ) -> Result<u32> {
        loop {
            if attempt >= self.policy.max_attempts {
                return Err(RolloutError::RetryBudgetExhausted {
                    attempts: attempt,
                    exit_code: last.exit_code(),
                    output: last.combined(),
                });
            }
            attempt += 1;
            self.deadline.sleep(self.policy.interval).await?;
            info!(attempt, "Reconnecting to the host");
            match session.reconnect().await {
                Ok(()) => return Ok(attempt),
                Err(e) if e.is_transport() => {
                    warn!(attempt, "Reconnection failed: {}", e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// After a container-mode reboot, keep reconnecting and running
    /// `command` until it exits 0.
    pub async fn finalize_after_reboot<K: Connector>(
        &self,
        session: &mut Session<'_, K>,
        invoker: &EngineInvoker,
        command: &EngineCommand,
    ) -> Result<Classified> {
        let mut last: Option<ExecOutput> = None;

        for attempt in 1..=self.policy.max_attempts {
            self.deadline.sleep(self.policy.settle_delay).await?;
            info!(attempt, "Running engine on the updated OS");

            if let Err(e) = session.reconnect().await {
                if !e.is_transport() {
                    return Err(e);
                }
                warn!(attempt, "Host not reachable yet: {}", e);
                continue;
            }

            let run = match session.channel().await {
                Ok(channel) => invoker.invoke(channel, command).await,
                Err(e) => Err(e),
            };
            match run {
                Ok(output)
                    if self.classifier.classify(&output, SuccessCriterion::ExitZero)
                        == Outcome::Success =>
                {
                    return Ok(Classified {
                        outcome: Outcome::Success,
                        output,
                        attempts: attempt,
                    })
                }
                Ok(output) => {
                    warn!(attempt, exit_code = ?output.exit_code(), "Engine run after reboot failed");
                    last = Some(output);
                }
                Err(e) if e.is_transport() => {
                    warn!(attempt, "Lost host during engine run: {}", e);
                }
                Err(e) => return Err(e),
            }
            session.close().await;
        }

        match last {
            Some(output) => Err(RolloutError::HardFailure {
                exit_code: output.exit_code(),
                output: output.combined(),
            }),
            None => Err(RolloutError::RetryBudgetExhausted {
                attempts: self.policy.max_attempts,
                exit_code: None,
                output: String::new(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deadline_sleep_fails_when_budget_too_small() {
        let deadline = Deadline::start(Duration::from_millis(10));
        let err = deadline.sleep(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, RolloutError::DeadlineExceeded(_)));
    }

    #[tokio::test]
    async fn test_deadline_zero_sleep_is_ok() {
        let deadline = Deadline::start(Duration::from_secs(60));
        deadline.sleep(Duration::ZERO).await.unwrap();
        assert!(deadline.remaining() <= Duration::from_secs(60));
    }

    #[test]
    fn test_immediate_policy() {
        let policy = RetryPolicy::immediate(3);
        assert_eq!(policy.max_attempts, 3);
        assert!(policy.interval.is_zero());
        assert_eq!(policy.overall_budget, Duration::from_secs(3600));
    }
}
