use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::TaskError;

/// Fully resolved command line. Every element of `args` is one argv entry.
/// Without a `cwd` the child inherits the server's working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

/// Abnormal termination reported by [`ChildProcess::wait`].
#[derive(Error, Debug)]
pub enum ExitError {
    #[error("process exited with {0}")]
    Status(ExitStatus),

    #[error("process was killed")]
    Killed,

    #[error("failed to wait for process: {0}")]
    Io(#[from] std::io::Error),
}

/// Kill switch for a running child.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: Option<u32>,
    kill: CancellationToken,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Request termination. Calling this more than once, or after the child
    /// already exited, has no further effect.
    pub fn kill(&self) {
        if !self.kill.is_cancelled() {
            debug!(pid = ?self.pid, "kill requested");
        }
        self.kill.cancel();
    }

    pub fn is_killed(&self) -> bool {
        self.kill.is_cancelled()
    }
}

/// Owner of the OS process.
#[derive(Debug)]
pub struct ChildProcess {
    child: Child,
    kill: CancellationToken,
}

impl ChildProcess {
    /// Block until the child exits or is killed through its handle.
    pub async fn wait(mut self) -> Result<(), ExitError> {
        tokio::select! {
            status = self.child.wait() => return classify(status),
            _ = self.kill.cancelled() => {}
        }

        // Already-exited children are fine here: kill() only reaps them.
        if let Err(err) = self.child.kill().await {
            debug!(error = %err, "kill after cancellation failed");
        }
        Err(ExitError::Killed)
    }
}

fn classify(status: std::io::Result<ExitStatus>) -> Result<(), ExitError> {
    let status = status?;
    if status.success() {
        Ok(())
    } else {
        Err(ExitError::Status(status))
    }
}

/// Lazy sequence of text lines read from a pipe. Ends when the pipe closes.
/// Invalid UTF-8 is replaced rather than ending the stream.
pub struct LineReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: BufReader::new(reader),
            buf: Vec::new(),
        }
    }

    pub async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        self.buf.clear();
        let n = self.inner.read_until(b'\n', &mut self.buf).await?;
        if n == 0 {
            return Ok(None);
        }
        if self.buf.last() == Some(&b'\n') {
            self.buf.pop();
            if self.buf.last() == Some(&b'\r') {
                self.buf.pop();
            }
        }
        Ok(Some(String::from_utf8_lossy(&self.buf).into_owned()))
    }
}

/// Everything produced by a successful spawn.
pub struct Spawned {
    pub handle: ProcessHandle,
    pub child: ChildProcess,
    pub stdout: LineReader<ChildStdout>,
    pub stderr: LineReader<ChildStderr>,
}

/// Start `spec` with piped stdout/stderr and a null stdin. Returns right after
/// launch. The child is killed if its [`ChildProcess`] is dropped unawaited.
pub fn spawn(spec: &CommandSpec) -> Result<Spawned, TaskError> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| TaskError::Spawn(format!("{}: {e}", spec.program)))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| TaskError::Spawn("stdout was not captured".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| TaskError::Spawn("stderr was not captured".to_string()))?;

    let kill = CancellationToken::new();
    let pid = child.id();
    debug!(program = %spec.program, pid = ?pid, "child spawned");

    Ok(Spawned {
        handle: ProcessHandle {
            pid,
            kill: kill.clone(),
        },
        child: ChildProcess { child, kill },
        stdout: LineReader::new(stdout),
        stderr: LineReader::new(stderr),
    })
}
