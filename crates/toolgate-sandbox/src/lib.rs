use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::{Duration, timeout};
use tracing::{debug, instrument, warn};

/// How long output readers may keep draining after the child is gone.
/// Grandchildren that inherited the pipes can hold them open indefinitely.
const DRAIN_GRACE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxLimits {
    pub max_runtime: Duration,
    pub max_output_bytes: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            max_runtime: Duration::from_secs(30),
            max_output_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxRequest {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
    pub limits: SandboxLimits,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxExecution {
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// `None` when the process was killed or terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub truncated: bool,
}

impl SandboxExecution {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

#[async_trait]
pub trait SandboxRunner: Send + Sync {
    async fn run(&self, request: SandboxRequest) -> Result<SandboxExecution>;
}

/// Runs commands as local child processes with a cleared environment.
#[derive(Debug, Clone)]
pub struct LocalSandboxRunner {
    allowed_commands: Vec<String>,
    inherit_env: Vec<String>,
}

impl LocalSandboxRunner {
    /// An empty allow-list permits any command.
    pub fn new(allowed_commands: Vec<String>) -> Self {
        Self {
            allowed_commands,
            inherit_env: vec!["PATH".to_owned(), "HOME".to_owned(), "LANG".to_owned()],
        }
    }

    /// Variables copied from the gateway's own environment into every child.
    pub fn with_inherited_env(mut self, inherit_env: Vec<String>) -> Self {
        self.inherit_env = inherit_env;
        self
    }

    fn command_allowed(&self, command: &str) -> bool {
        self.allowed_commands.is_empty() || self.allowed_commands.iter().any(|c| c == command)
    }
}

#[derive(Debug, Default)]
struct CapturedOutput {
    bytes: Vec<u8>,
    truncated: bool,
}

impl CapturedOutput {
    fn push(&mut self, chunk: &[u8], max_output_bytes: usize) {
        let room = max_output_bytes.saturating_sub(self.bytes.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.bytes.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }
}

/// Drains one child pipe into a shared buffer so partial output survives a kill.
struct OutputCapture {
    buffer: Arc<Mutex<CapturedOutput>>,
    task: Option<JoinHandle<()>>,
}

impl OutputCapture {
    fn spawn<R>(reader: Option<R>, max_output_bytes: usize) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(CapturedOutput::default()));
        let task = reader.map(|mut reader| {
            let buffer = buffer.clone();
            tokio::spawn(async move {
                let mut chunk = [0_u8; 4096];
                loop {
                    match reader.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(read) => buffer.lock().push(&chunk[..read], max_output_bytes),
                    }
                }
            })
        });
        Self { buffer, task }
    }

    async fn finish(mut self) -> (String, bool) {
        if let Some(mut task) = self.task.take()
            && timeout(DRAIN_GRACE, &mut task).await.is_err()
        {
            task.abort();
        }
        let captured = self.buffer.lock();
        (
            String::from_utf8_lossy(&captured.bytes).into_owned(),
            captured.truncated,
        )
    }
}

#[async_trait]
impl SandboxRunner for LocalSandboxRunner {
    #[instrument(
        skip(self, request),
        fields(
            command = %request.command,
            args_count = request.args.len(),
            cwd = %request.cwd.display()
        )
    )]
    async fn run(&self, request: SandboxRequest) -> Result<SandboxExecution> {
        if !self.command_allowed(&request.command) {
            bail!("command not allowed in sandbox: {}", request.command);
        }

        let mut command = Command::new(&request.command);
        command.args(&request.args);
        command.current_dir(&request.cwd);
        command.env_clear();
        for key in &self.inherit_env {
            if let Ok(value) = std::env::var(key) {
                command.env(key, value);
            }
        }
        command.envs(&request.env);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // The child leads a fresh process group so a timeout can take its
        // descendants down with it.
        #[cfg(unix)]
        command.process_group(0);

        let started_at = Utc::now();
        let clock = Instant::now();
        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn {}", request.command))?;

        let max_output_bytes = request.limits.max_output_bytes;
        let stdout = OutputCapture::spawn(child.stdout.take(), max_output_bytes);
        let stderr = OutputCapture::spawn(child.stderr.take(), max_output_bytes);

        let limit = request.limits.max_runtime.max(Duration::from_millis(1));
        let (exit_code, timed_out) = match timeout(limit, child.wait()).await {
            Ok(status) => {
                let status = status.context("failed waiting for command")?;
                (status.code(), false)
            }
            Err(_) => {
                warn!(
                    max_runtime_ms = limit.as_millis() as u64,
                    "sandbox command timed out"
                );
                if let Some(pid) = child.id() {
                    if let Err(error) = kill_process_group(pid) {
                        warn!(%error, pid, "failed to kill timed-out process group");
                    }
                }
                if let Err(error) = child.kill().await {
                    warn!(%error, "failed to kill timed-out command");
                }
                (None, true)
            }
        };

        let (stdout, stdout_truncated) = stdout.finish().await;
        let (mut stderr, stderr_truncated) = stderr.finish().await;
        if timed_out {
            if !stderr.is_empty() && !stderr.ends_with('\n') {
                stderr.push('\n');
            }
            stderr.push_str(&format!(
                "sandbox timeout after {} ms",
                limit.as_millis()
            ));
        }

        let execution = SandboxExecution {
            started_at,
            ended_at: Utc::now(),
            duration_ms: clock.elapsed().as_millis() as u64,
            exit_code,
            stdout,
            stderr,
            timed_out,
            truncated: stdout_truncated || stderr_truncated,
        };
        debug!(
            exit_code = ?execution.exit_code,
            duration_ms = execution.duration_ms,
            timed_out = execution.timed_out,
            "sandbox command finished"
        );
        Ok(execution)
    }
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn kill_process_group(pid: u32) -> std::io::Result<()> {
    let pgid = libc::pid_t::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: killpg takes no pointers. `pgid` is the pid of a child spawned
    // with `process_group(0)` and not yet reaped, so it names that child's group.
    let result = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if result == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) -> std::io::Result<()> {
    Ok(())
}
