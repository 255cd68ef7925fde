//! SSH channel backed by the system `ssh` client.
//!
//! Every command is its own `ssh` process in batch mode, so a reconnect is
//! simply the next process. Output is streamed line by line into `debug!`
//! events while it is buffered for classification.

use crate::channel::{shell_quote, Connector, ExecOutput, RemoteChannel, Termination};
use crate::config::SshConfig;
use crate::engine::UTILITY_TIMEOUT;
use crate::error::{Result, RolloutError};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Exit status `ssh` uses for its own failures.
const SSH_ERROR_EXIT: i32 = 255;

/// Grace period for the output readers after the process is gone.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// stderr text meaning the session never came up.
const CONNECT_FAILURES: &[&str] = &[
    "Permission denied",
    "Connection refused",
    "No route to host",
    "Could not resolve hostname",
    "Connection timed out",
    "Network is unreachable",
    "Host key verification failed",
    "kex_exchange_identification",
];

/// stderr text meaning an established session was cut.
const DISCONNECTS: &[&str] = &[
    "closed by remote host",
    "Broken pipe",
    "Connection reset",
    "client_loop",
    "Timeout, server",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub user: String,
    pub port: u16,
    pub identity_file: Option<PathBuf>,
    pub connect_timeout_secs: u64,
    pub keepalive_interval_secs: u64,
    pub keepalive_count_max: u32,
    pub strict_host_key_checking: bool,
}

impl SshTarget {
    pub fn new(host: impl Into<String>, config: &SshConfig) -> Self {
        Self {
            host: host.into(),
            user: config.user.clone(),
            port: config.port,
            identity_file: config.identity_file.clone(),
            connect_timeout_secs: config.connect_timeout_secs,
            keepalive_interval_secs: config.keepalive_interval_secs,
            keepalive_count_max: config.keepalive_count_max,
            strict_host_key_checking: config.strict_host_key_checking,
        }
    }

    /// `ssh` arguments up to and including the destination.
    pub fn ssh_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
            "-o".to_string(),
            format!("ServerAliveInterval={}", self.keepalive_interval_secs),
            "-o".to_string(),
            format!("ServerAliveCountMax={}", self.keepalive_count_max),
        ];
        if !self.strict_host_key_checking {
            args.extend([
                "-o".to_string(),
                "StrictHostKeyChecking=no".to_string(),
                "-o".to_string(),
                "UserKnownHostsFile=/dev/null".to_string(),
                "-o".to_string(),
                "LogLevel=ERROR".to_string(),
            ]);
        }
        if let Some(key) = &self.identity_file {
            args.push("-i".to_string());
            args.push(key.display().to_string());
        }
        args.extend([
            "-p".to_string(),
            self.port.to_string(),
            "-l".to_string(),
            self.user.clone(),
            self.host.clone(),
        ]);
        args
    }
}

/// How an `ssh` exit status maps onto the remote command's fate.
fn interpret_exit(code: Option<i32>, stderr: &str) -> std::result::Result<Termination, String> {
    match code {
        Some(SSH_ERROR_EXIT) => {
            if let Some(reason) = CONNECT_FAILURES.iter().find(|m| stderr.contains(**m)) {
                Err((*reason).to_string())
            } else if DISCONNECTS.iter().any(|m| stderr.contains(m)) {
                Ok(Termination::Disconnected)
            } else {
                Ok(Termination::Exited(SSH_ERROR_EXIT))
            }
        }
        Some(code) => Ok(Termination::Exited(code)),
        // Killed by a signal.
        None => Ok(Termination::Disconnected),
    }
}

fn stream_lines<R>(pipe: R, buffer: Arc<Mutex<String>>, host: String, stream: &'static str) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(pipe);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&line);
                    debug!(target: "remote", host = %host, stream, "{}", text.trim_end());
                    buffer
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .push_str(&text);
                }
            }
        }
    })
}

fn take_buffer(buffer: &Arc<Mutex<String>>) -> String {
    std::mem::take(&mut *buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
}

async fn drain(handle: JoinHandle<()>) {
    if tokio::time::timeout(DRAIN_TIMEOUT, handle).await.is_err() {
        warn!("Remote output reader did not finish in time");
    }
}

// ============================================================================
// Connector
// ============================================================================

#[derive(Debug, Clone)]
pub struct SshConnector {
    target: SshTarget,
}

impl SshConnector {
    pub fn new(target: SshTarget) -> Self {
        Self { target }
    }

    pub fn target(&self) -> &SshTarget {
        &self.target
    }
}

#[async_trait]
impl Connector for SshConnector {
    type Channel = SshChannel;

    async fn connect(&self) -> Result<SshChannel> {
        let mut channel = SshChannel {
            target: self.target.clone(),
            closed: false,
        };
        let probe = channel.execute("true", UTILITY_TIMEOUT).await?;
        if !probe.success() {
            return Err(RolloutError::transport(
                &self.target.host,
                format!("connection probe failed: {}", probe.combined().trim()),
            ));
        }
        info!(host = %self.target.host, user = %self.target.user, "SSH connection established");
        Ok(channel)
    }
}

// ============================================================================
// Channel
// ============================================================================

#[derive(Debug)]
pub struct SshChannel {
    target: SshTarget,
    closed: bool,
}

impl SshChannel {
    fn command(&self, remote: &str) -> Result<Command> {
        if self.closed {
            return Err(RolloutError::transport(&self.target.host, "channel is closed"));
        }
        let mut cmd = Command::new("ssh");
        cmd.args(self.target.ssh_args())
            .arg(remote)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(cmd)
    }

    fn spawn_error(&self, e: std::io::Error) -> RolloutError {
        RolloutError::transport(&self.target.host, format!("failed to spawn ssh: {}", e))
    }
}

#[async_trait]
impl RemoteChannel for SshChannel {
    fn host(&self) -> &str {
        &self.target.host
    }

    async fn execute(&mut self, command: &str, timeout: Duration) -> Result<ExecOutput> {
        let started = Instant::now();
        let mut cmd = self.command(command)?;
        cmd.stdin(Stdio::null());
        debug!(host = %self.target.host, command, "Executing remote command");
        let mut child = cmd.spawn().map_err(|e| self.spawn_error(e))?;

        let stdout_buf = Arc::new(Mutex::new(String::new()));
        let stderr_buf = Arc::new(Mutex::new(String::new()));
        let readers = [
            child
                .stdout
                .take()
                .map(|pipe| stream_lines(pipe, Arc::clone(&stdout_buf), self.target.host.clone(), "stdout")),
            child
                .stderr
                .take()
                .map(|pipe| stream_lines(pipe, Arc::clone(&stderr_buf), self.target.host.clone(), "stderr")),
        ];

        let waited = tokio::time::timeout(timeout, child.wait()).await;
        let status = match waited {
            Ok(status) => Some(status?),
            Err(_) => {
                warn!(host = %self.target.host, timeout_secs = timeout.as_secs(), "Remote command timed out");
                if let Err(e) = child.kill().await {
                    debug!("Killing ssh after timeout: {}", e);
                }
                None
            }
        };
        for reader in readers.into_iter().flatten() {
            drain(reader).await;
        }

        let stdout = take_buffer(&stdout_buf);
        let stderr = take_buffer(&stderr_buf);
        let termination = match status {
            None => Termination::TimedOut,
            Some(status) => interpret_exit(status.code(), &stderr)
                .map_err(|reason| RolloutError::transport(&self.target.host, reason))?,
        };

        Ok(ExecOutput {
            termination,
            stdout,
            stderr,
            elapsed: started.elapsed(),
        })
    }

    async fn write_file(&mut self, remote_path: &str, contents: &[u8]) -> Result<()> {
        let mut cmd = self.command(&format!("cat > {}", shell_quote(remote_path)))?;
        cmd.stdin(Stdio::piped());
        let mut child = cmd.spawn().map_err(|e| self.spawn_error(e))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(contents).await?;
            stdin.shutdown().await?;
        }
        let output = tokio::time::timeout(UTILITY_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| {
                RolloutError::transport(&self.target.host, format!("upload of {} timed out", remote_path))
            })??;

        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        match interpret_exit(output.status.code(), &stderr) {
            Ok(Termination::Exited(0)) => {
                debug!(host = %self.target.host, remote_path, bytes = contents.len(), "Uploaded file");
                Ok(())
            }
            Ok(termination) => Err(RolloutError::HardFailure {
                exit_code: match termination {
                    Termination::Exited(code) => Some(code),
                    _ => None,
                },
                output: stderr,
            }),
            Err(reason) => Err(RolloutError::transport(&self.target.host, reason)),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> SshTarget {
        let mut config = SshConfig::default();
        config.identity_file = Some(PathBuf::from("/home/ci/.ssh/id_ed25519"));
        SshTarget::new("10.0.0.4", &config)
    }

    #[test]
    fn test_ssh_args() {
        let args = target().ssh_args();
        assert_eq!(args.first().map(String::as_str), Some("-o"));
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"StrictHostKeyChecking=no".to_string()));
        assert!(args.contains(&"ConnectTimeout=10".to_string()));
        let tail: Vec<_> = args.iter().rev().take(5).rev().cloned().collect();
        assert_eq!(tail, vec!["-p", "22", "-l", "testing-user", "10.0.0.4"]);
        let key = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[key + 1], "/home/ci/.ssh/id_ed25519");
    }

    #[test]
    fn test_strict_host_keys_drop_overrides() {
        let mut t = target();
        t.strict_host_key_checking = true;
        assert!(!t.ssh_args().iter().any(|a| a.contains("StrictHostKeyChecking")));
    }

    #[test]
    fn test_interpret_exit() {
        assert_eq!(interpret_exit(Some(0), ""), Ok(Termination::Exited(0)));
        assert_eq!(interpret_exit(Some(2), "oops"), Ok(Termination::Exited(2)));
        assert_eq!(interpret_exit(None, ""), Ok(Termination::Disconnected));
        assert_eq!(
            interpret_exit(Some(255), "Connection to 10.0.0.4 closed by remote host."),
            Ok(Termination::Disconnected)
        );
        assert!(interpret_exit(Some(255), "ssh: connect to host 10.0.0.4 port 22: Connection refused").is_err());
        assert!(interpret_exit(Some(255), "testing-user@10.0.0.4: Permission denied (publickey).").is_err());
        assert_eq!(interpret_exit(Some(255), "remote tool failed"), Ok(Termination::Exited(255)));
    }
}
