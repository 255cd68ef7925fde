//! Remote execution channel
//!
//! `RemoteChannel` is the seam between the orchestrator and the host: run a
//! shell command with a timeout, write a file, close. `Connector` opens fresh
//! channels, which is how the orchestrator reconnects after a reboot.
//!
//! Production uses the SSH implementation in `ssh.rs`. Tests use
//! `FakeConnector`, which replays scripted responses and counts calls.

use crate::error::{Result, RolloutError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

// ============================================================================
// Command results
// ============================================================================

/// How a remote command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited(i32),
    /// The connection dropped while the command was running.
    Disconnected,
    /// The local timeout fired; output up to that point is kept.
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub termination: Termination,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl ExecOutput {
    pub fn exited(code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            termination: Termination::Exited(code),
            stdout: stdout.into(),
            stderr: stderr.into(),
            elapsed: Duration::ZERO,
        }
    }

    pub fn ok(stdout: impl Into<String>) -> Self {
        Self::exited(0, stdout, "")
    }

    pub fn disconnected(stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            termination: Termination::Disconnected,
            ..Self::exited(0, stdout, stderr)
        }
    }

    pub fn timed_out(stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            termination: Termination::TimedOut,
            ..Self::exited(0, stdout, stderr)
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self.termination {
            Termination::Exited(code) => Some(code),
            _ => None,
        }
    }

    pub fn success(&self) -> bool {
        self.termination == Termination::Exited(0)
    }

    /// stdout followed by stderr.
    pub fn combined(&self) -> String {
        let mut out = String::with_capacity(self.stdout.len() + self.stderr.len() + 1);
        out.push_str(&self.stdout);
        if !self.stdout.is_empty() && !self.stdout.ends_with('\n') && !self.stderr.is_empty() {
            out.push('\n');
        }
        out.push_str(&self.stderr);
        out
    }

    /// Turn anything but a clean exit 0 into a `HardFailure`.
    pub fn require_success(self) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(RolloutError::HardFailure {
                exit_code: self.exit_code(),
                output: self.combined(),
            })
        }
    }
}

/// Quote `arg` for the remote POSIX shell. Plain paths and words pass through.
pub fn shell_quote(arg: &str) -> String {
    if arg.is_empty() {
        return "''".to_string();
    }
    let safe = arg.chars().all(|ch| {
        matches!(
            ch,
            'a'..='z' | 'A'..='Z' | '0'..='9' | '_' | '-' | '.' | '/' | ':' | '@' | '+' | '=' | ','
        )
    });
    if safe {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', "'\"'\"'"))
}

// ============================================================================
// Channel traits
// ============================================================================

#[async_trait]
pub trait RemoteChannel: Send {
    fn host(&self) -> &str;

    /// Run `command` through the remote shell. Non-zero exits are returned as
    /// output; only transport failures are errors.
    async fn execute(&mut self, command: &str, timeout: Duration) -> Result<ExecOutput>;

    /// Write `contents` to `remote_path` as the login user.
    async fn write_file(&mut self, remote_path: &str, contents: &[u8]) -> Result<()>;

    async fn close(&mut self) -> Result<()>;

    /// `execute`, requiring exit code 0.
    async fn run_checked(&mut self, command: &str, timeout: Duration) -> Result<ExecOutput> {
        self.execute(command, timeout).await?.require_success()
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    type Channel: RemoteChannel;

    async fn connect(&self) -> Result<Self::Channel>;
}

// ============================================================================
// Fake channel (testing)
// ============================================================================

#[derive(Debug, Clone)]
enum Scripted {
    Output(ExecOutput),
    TransportError(String),
}

#[derive(Debug)]
struct FakeRule {
    pattern: String,
    /// Played in order; the last one repeats.
    responses: VecDeque<Scripted>,
}

impl FakeRule {
    fn next(&mut self) -> Option<Scripted> {
        if self.responses.len() > 1 {
            self.responses.pop_front()
        } else {
            self.responses.front().cloned()
        }
    }
}

#[derive(Debug, Default)]
struct FakeState {
    rules: Vec<FakeRule>,
    connect_failures: VecDeque<String>,
    /// Successful connects before `connect_failures` kick in.
    fail_after: usize,
    executed: Vec<String>,
    written: Vec<(String, Vec<u8>)>,
    connects: usize,
    closes: usize,
}

fn lock(state: &Mutex<FakeState>) -> MutexGuard<'_, FakeState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Host name reported by fake channels.
pub const FAKE_HOST: &str = "fake-host";

/// Connector whose channels replay scripted responses.
///
/// Commands are matched against rules by substring, first rule wins.
/// Unmatched commands exit 0 with no output. All channels share one state,
/// so counters survive reconnects.
///
/// ```rust,ignore
/// let fake = FakeConnectorBuilder::new()
///     .respond("trident get", ExecOutput::ok(STATUS))
///     .respond_sequence("trident run", vec![retry, success])
///     .build();
/// ```
#[derive(Debug, Clone, Default)]
pub struct FakeConnector {
    state: Arc<Mutex<FakeState>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect_count(&self) -> usize {
        lock(&self.state).connects
    }

    pub fn close_count(&self) -> usize {
        lock(&self.state).closes
    }

    /// Channels opened and not yet closed.
    pub fn open_channels(&self) -> usize {
        let state = lock(&self.state);
        state.connects.saturating_sub(state.closes)
    }

    pub fn executed(&self) -> Vec<String> {
        lock(&self.state).executed.clone()
    }

    pub fn count_matching(&self, pattern: &str) -> usize {
        lock(&self.state)
            .executed
            .iter()
            .filter(|c| c.contains(pattern))
            .count()
    }

    pub fn written_files(&self) -> Vec<(String, Vec<u8>)> {
        lock(&self.state).written.clone()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    type Channel = FakeChannel;

    async fn connect(&self) -> Result<FakeChannel> {
        let mut state = lock(&self.state);
        if state.connects >= state.fail_after {
            if let Some(message) = state.connect_failures.pop_front() {
                return Err(RolloutError::transport(FAKE_HOST, message));
            }
        }
        state.connects += 1;
        Ok(FakeChannel {
            state: Arc::clone(&self.state),
            closed: false,
        })
    }
}

#[derive(Debug)]
pub struct FakeChannel {
    state: Arc<Mutex<FakeState>>,
    closed: bool,
}

impl FakeChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(RolloutError::transport(FAKE_HOST, "channel is closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteChannel for FakeChannel {
    fn host(&self) -> &str {
        FAKE_HOST
    }

    async fn execute(&mut self, command: &str, _timeout: Duration) -> Result<ExecOutput> {
        self.ensure_open()?;
        let mut state = lock(&self.state);
        state.executed.push(command.to_string());
        let scripted = state
            .rules
            .iter_mut()
            .find(|rule| command.contains(&rule.pattern))
            .and_then(FakeRule::next);

        match scripted {
            Some(Scripted::Output(output)) => Ok(output),
            Some(Scripted::TransportError(message)) => {
                Err(RolloutError::transport(FAKE_HOST, message))
            }
            None => Ok(ExecOutput::ok("")),
        }
    }

    async fn write_file(&mut self, remote_path: &str, contents: &[u8]) -> Result<()> {
        self.ensure_open()?;
        lock(&self.state)
            .written
            .push((remote_path.to_string(), contents.to_vec()));
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            lock(&self.state).closes += 1;
        }
        Ok(())
    }
}

// ============================================================================
// Builder for FakeConnector
// ============================================================================

#[derive(Debug, Default)]
pub struct FakeConnectorBuilder {
    state: FakeState,
}

impl FakeConnectorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always answer commands containing `pattern` with `output`.
    pub fn respond(self, pattern: &str, output: ExecOutput) -> Self {
        self.respond_sequence(pattern, vec![output])
    }

    /// Answer successive matching commands in order, repeating the last.
    pub fn respond_sequence(mut self, pattern: &str, outputs: Vec<ExecOutput>) -> Self {
        self.state.rules.push(FakeRule {
            pattern: pattern.to_string(),
            responses: outputs.into_iter().map(Scripted::Output).collect(),
        });
        self
    }

    /// Fail commands containing `pattern` with a transport error.
    pub fn transport_error(mut self, pattern: &str, message: &str) -> Self {
        self.state.rules.push(FakeRule {
            pattern: pattern.to_string(),
            responses: VecDeque::from([Scripted::TransportError(message.to_string())]),
        });
        self
    }

    /// Make the first `count` connection attempts fail.
    pub fn fail_connects(self, count: usize, message: &str) -> Self {
        self.fail_connects_after(0, count, message)
    }

    /// Let `successes` connections through, then fail the next `count`.
    pub fn fail_connects_after(mut self, successes: usize, count: usize, message: &str) -> Self {
        self.state.fail_after = successes;
        self.state
            .connect_failures
            .extend(std::iter::repeat(message.to_string()).take(count));
        self
    }

    pub fn build(self) -> FakeConnector {
        FakeConnector {
            state: Arc::new(Mutex::new(self.state)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: Duration = Duration::from_secs(1);

    #[test]
    fn test_combined_output_order() {
        let out = ExecOutput::exited(1, "line one", "line two\n");
        assert_eq!(out.combined(), "line one\nline two\n");
        assert_eq!(out.exit_code(), Some(1));
        assert!(!out.success());
        assert_eq!(ExecOutput::timed_out("a", "").exit_code(), None);
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/etc/trident/config.yaml"), "/etc/trident/config.yaml");
        assert_eq!(shell_quote("stage,finalize"), "stage,finalize");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), "'it'\"'\"'s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_require_success() {
        assert!(ExecOutput::ok("fine").require_success().is_ok());
        let err = ExecOutput::exited(2, "", "boom").require_success().unwrap_err();
        assert!(matches!(err, RolloutError::HardFailure { exit_code: Some(2), .. }));
    }

    #[tokio::test]
    async fn test_fake_sequence_repeats_last() {
        let fake = FakeConnectorBuilder::new()
            .respond_sequence(
                "trident run",
                vec![ExecOutput::exited(1, "", "first"), ExecOutput::ok("second")],
            )
            .build();
        let mut channel = fake.connect().await.unwrap();

        let first = channel.execute("sudo trident run", T).await.unwrap();
        let second = channel.execute("sudo trident run", T).await.unwrap();
        let third = channel.execute("sudo trident run", T).await.unwrap();
        assert_eq!(first.stderr, "first");
        assert_eq!(second.stdout, "second");
        assert_eq!(third.stdout, "second");

        let other = channel.execute("echo hi", T).await.unwrap();
        assert!(other.success());
        assert_eq!(fake.count_matching("trident run"), 3);
    }

    #[tokio::test]
    async fn test_fake_connect_failures_and_close_counts() {
        let fake = FakeConnectorBuilder::new()
            .fail_connects(1, "Connection refused")
            .build();

        let err = fake.connect().await.unwrap_err();
        assert!(err.is_transport());

        let mut channel = fake.connect().await.unwrap();
        assert_eq!(fake.open_channels(), 1);
        channel.write_file("/tmp/staging/hc.yaml", b"a: 1").await.unwrap();
        channel.close().await.unwrap();
        channel.close().await.unwrap();
        assert_eq!(fake.close_count(), 1);
        assert_eq!(fake.open_channels(), 0);
        assert!(channel.execute("true", T).await.is_err());
        assert_eq!(fake.written_files()[0].0, "/tmp/staging/hc.yaml");
    }

    #[tokio::test]
    async fn test_fake_transport_error_rule() {
        let fake = FakeConnectorBuilder::new()
            .transport_error("docker", "Broken pipe")
            .build();
        let mut channel = fake.connect().await.unwrap();
        let err = channel.run_checked("sudo docker images -q", T).await.unwrap_err();
        assert!(err.is_transport());
    }
}
