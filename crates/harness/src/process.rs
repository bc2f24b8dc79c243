//! Process supervision - spawning test files, capturing output, enforcing timeouts

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::environment::{registry, ExecutionEnvironment, Interpreters};
use crate::error::{HarnessError, HarnessResult};

/// How long to keep reading pipes after the process itself is gone
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

const READ_CHUNK: usize = 8192;

/// Captured outcome of one process invocation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// `None` when the process was killed by a signal (including our own timeout kill)
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub duration: Duration,
    pub timed_out: bool,

    /// A pipe was still open when capture gave up, so the streams may be cut short
    #[serde(default)]
    pub output_truncated: bool,
}

impl ExecutionResult {
    pub fn exited_cleanly(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    pub fn exit_description(&self) -> String {
        match (self.timed_out, self.exit_code) {
            (true, _) => format!("timed out after {:.1}s", self.duration.as_secs_f64()),
            (false, Some(code)) => format!("exit code {}", code),
            (false, None) => "terminated by signal".to_string(),
        }
    }
}

/// Spawns test files under the configured interpreters
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    interpreters: Arc<Interpreters>,
}

impl ProcessRunner {
    pub fn new(interpreters: Interpreters) -> Self {
        Self {
            interpreters: Arc::new(interpreters),
        }
    }

    /// Use the collaborators published in the process-wide registry
    pub fn from_registry() -> HarnessResult<Self> {
        Ok(Self {
            interpreters: registry::current()?,
        })
    }

    pub fn interpreters(&self) -> &Interpreters {
        &self.interpreters
    }

    /// Build the command for `file`. The process runs in the file's directory
    /// and receives the bare file name.
    fn command(&self, file: &Path, env: &ExecutionEnvironment) -> HarnessResult<(Command, String)> {
        let name = file
            .file_name()
            .map(Path::new)
            .ok_or_else(|| HarnessError::Process(format!("not a file: {}", file.display())))?;
        let argv = self.interpreters.command_line(env, name)?;
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| HarnessError::InvalidConfig("empty interpreter command".to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(dir) = file.parent().filter(|d| !d.as_os_str().is_empty()) {
            cmd.current_dir(dir);
        }

        // Own process group, so a timeout kill also reaches grandchildren
        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("Command for {} [{}]: {}", file.display(), env, argv.join(" "));
        Ok((cmd, program.clone()))
    }

    /// Run `file` to completion (or until `limit` elapses)
    pub async fn run(
        &self,
        file: &Path,
        env: &ExecutionEnvironment,
        stdin: Option<&[u8]>,
        limit: Duration,
    ) -> HarnessResult<ExecutionResult> {
        let (mut cmd, program) = self.command(file, env)?;
        cmd.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() });

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|e| spawn_error(&program, env, e))?;
        let pid = child.id();

        let stdout = StreamCapture::start(child.stdout.take());
        let stderr = StreamCapture::start(child.stderr.take());

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            let input = input.to_vec();
            tokio::spawn(async move {
                if let Err(e) = pipe.write_all(&input).await {
                    debug!("Could not write stdin: {}", e);
                }
            });
        }

        let (exit_code, timed_out) = match timeout(limit, child.wait()).await {
            Ok(status) => {
                let code = status?.code();
                reap_stragglers(pid);
                (code, false)
            }
            Err(_) => {
                warn!("{} exceeded {:?}, killing it", file.display(), limit);
                terminate(&mut child, pid).await;
                (None, true)
            }
        };

        let (stdout, stdout_complete) = stdout.finish().await;
        let (stderr, stderr_complete) = stderr.finish().await;

        Ok(ExecutionResult {
            exit_code,
            stdout,
            stderr,
            duration: start.elapsed(),
            timed_out,
            output_truncated: !(stdout_complete && stderr_complete),
        })
    }

    /// Start a long-lived helper whose stdin stays open until shutdown is signalled
    pub fn spawn_subprocess(&self, file: &Path, env: &ExecutionEnvironment) -> HarnessResult<SubprocessHandle> {
        let (mut cmd, program) = self.command(file, env)?;
        cmd.stdin(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| spawn_error(&program, env, e))?;
        let pid = child.id();
        debug!("Subprocess {} started (pid: {:?})", file.display(), pid);

        Ok(SubprocessHandle {
            file: file.to_path_buf(),
            stdin: child.stdin.take(),
            stdout: Some(StreamCapture::start(child.stdout.take())),
            stderr: Some(StreamCapture::start(child.stderr.take())),
            child,
            pid,
            started: Instant::now(),
            reaped: false,
        })
    }
}

/// A running subprocess-role file.
///
/// Shutdown is two-phase: [`signal_shutdown`](Self::signal_shutdown) closes
/// stdin, [`wait_for_exit`](Self::wait_for_exit) waits a bounded grace period
/// and kills the process group if it is still alive. Dropping an unreaped
/// handle kills it.
pub struct SubprocessHandle {
    file: PathBuf,
    child: Child,
    pid: Option<u32>,
    stdin: Option<ChildStdin>,
    stdout: Option<StreamCapture>,
    stderr: Option<StreamCapture>,
    started: Instant,
    reaped: bool,
}

impl SubprocessHandle {
    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    /// Close the subprocess's stdin; it is expected to exit on end-of-stream
    pub fn signal_shutdown(&mut self) {
        if self.stdin.take().is_some() {
            debug!("Closed stdin of subprocess {}", self.file.display());
        }
    }

    /// Wait up to `grace` for the process to exit, killing it otherwise.
    /// A forced kill is reported as `timed_out`.
    pub async fn wait_for_exit(mut self, grace: Duration) -> HarnessResult<ExecutionResult> {
        let (exit_code, timed_out) = match timeout(grace, self.child.wait()).await {
            Ok(status) => {
                let code = status?.code();
                reap_stragglers(self.pid);
                (code, false)
            }
            Err(_) => {
                warn!(
                    "Subprocess {} did not exit within {:?} of shutdown, killing it",
                    self.file.display(),
                    grace
                );
                terminate(&mut self.child, self.pid).await;
                (None, true)
            }
        };
        self.reaped = true;

        let (stdout, stdout_complete) = match self.stdout.take() {
            Some(capture) => capture.finish().await,
            None => (Vec::new(), true),
        };
        let (stderr, stderr_complete) = match self.stderr.take() {
            Some(capture) => capture.finish().await,
            None => (Vec::new(), true),
        };

        Ok(ExecutionResult {
            exit_code,
            stdout,
            stderr,
            duration: self.started.elapsed(),
            timed_out,
            output_truncated: !(stdout_complete && stderr_complete),
        })
    }

    /// `signal_shutdown` followed by `wait_for_exit`
    pub async fn shutdown(mut self, grace: Duration) -> HarnessResult<ExecutionResult> {
        self.signal_shutdown();
        self.wait_for_exit(grace).await
    }
}

impl Drop for SubprocessHandle {
    fn drop(&mut self) {
        if self.reaped {
            return;
        }
        warn!("Subprocess {} dropped while running, killing it", self.file.display());
        #[cfg(unix)]
        {
            if let Some(pid) = self.pid {
                kill_process_group(pid);
            }
        }
        let _ = self.child.start_kill();
    }
}

/// Background reader accumulating one pipe
struct StreamCapture {
    buf: Arc<Mutex<Vec<u8>>>,
    task: JoinHandle<()>,
}

impl StreamCapture {
    fn start<R>(pipe: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let sink = buf.clone();
        let task = tokio::spawn(async move {
            let Some(mut pipe) = pipe else { return };
            let mut chunk = vec![0u8; READ_CHUNK];
            loop {
                match pipe.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => sink.lock().extend_from_slice(&chunk[..n]),
                    Err(e) => {
                        debug!("Pipe read failed: {}", e);
                        break;
                    }
                }
            }
        });
        Self { buf, task }
    }

    /// Wait briefly for end-of-stream, then return whatever was read and
    /// whether the stream actually ended. A descendant that escaped the
    /// process group may hold the pipe open forever.
    async fn finish(self) -> (Vec<u8>, bool) {
        let mut task = self.task;
        let complete = timeout(DRAIN_TIMEOUT, &mut task).await.is_ok();
        if !complete {
            warn!(
                "Pipe still open {:?} after process exit, output capture is incomplete",
                DRAIN_TIMEOUT
            );
            task.abort();
        }
        let mut buf = self.buf.lock();
        (std::mem::take(&mut *buf), complete)
    }
}

/// Kill whatever the finished process left running in its group
fn reap_stragglers(pid: Option<u32>) {
    #[cfg(unix)]
    {
        if let Some(pid) = pid {
            kill_process_group(pid);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
    }
}

async fn terminate(child: &mut Child, pid: Option<u32>) {
    reap_stragglers(pid);

    if let Err(e) = child.kill().await {
        debug!("Kill after timeout failed: {}", e);
    }
}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        debug!("killpg({}) failed: {}", pid, e);
    }
}

fn spawn_error(program: &str, env: &ExecutionEnvironment, e: std::io::Error) -> HarnessError {
    HarnessError::Environment(format!("failed to start {} interpreter '{}': {}", env, program, e))
}
