//! Local subprocess runner.
//!
//! Runs the real compiler locally for racing, fallback, and verification.
//! Admission is CPU-budgeted: LIGHT processes only need a slot in the total
//! budget, HEAVY ones (links, LTO) additionally hold a heavy permit, so a
//! burst of remote tasks falling back cannot fork more compilers than the
//! machine bears.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use thiserror::Error;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SubprocError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("subprocess I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("subprocess task lost")]
    Lost,
}

/// Admission weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Weight {
    Light,
    Heavy,
}

/// What to run.
#[derive(Debug, Clone)]
pub struct SubprocSpec {
    pub program: Utf8PathBuf,
    /// argv[1..]; argv[0] is derived from `program`
    pub args: Vec<String>,
    /// Environment is explicit: the child sees exactly this
    pub env: Vec<(String, String)>,
    pub cwd: Utf8PathBuf,
    pub weight: Weight,
}

/// Captured result of a finished subprocess.
#[derive(Debug, Clone)]
pub struct SubprocResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    /// True when the process died to a kill() rather than on its own
    pub killed: bool,
}

#[derive(Debug, Clone)]
pub struct SubprocOptions {
    /// Total concurrent local subprocesses
    pub max_total: usize,
    /// Concurrent HEAVY subprocesses
    pub max_heavy: usize,
}

impl Default for SubprocOptions {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            max_total: cpus,
            max_heavy: (cpus / 4).max(1),
        }
    }
}

/// The runner; one per daemon, shared by all compile tasks.
pub struct SubprocRunner {
    total: Arc<Semaphore>,
    heavy: Arc<Semaphore>,
}

impl SubprocRunner {
    pub fn new(options: SubprocOptions) -> Arc<Self> {
        Arc::new(Self {
            total: Arc::new(Semaphore::new(options.max_total.max(1))),
            heavy: Arc::new(Semaphore::new(options.max_heavy.max(1))),
        })
    }

    /// Start a subprocess. It queues for admission, runs, and captures
    /// output. The returned handle can kill it or await its completion.
    pub fn start(self: &Arc<Self>, spec: SubprocSpec) -> SubprocHandle {
        let kill = Arc::new(Notify::new());
        let runner = self.clone();

        let kill_rx = kill.clone();
        let join = tokio::spawn(async move { runner.run(spec, kill_rx).await });

        SubprocHandle { kill, join }
    }

    async fn run(
        &self,
        spec: SubprocSpec,
        kill: Arc<Notify>,
    ) -> Result<SubprocResult, SubprocError> {
        // admission; a kill while queued aborts before anything is forked
        let _heavy_permit = if spec.weight == Weight::Heavy {
            tokio::select! {
                permit = self.heavy.clone().acquire_owned() => Some(permit.expect("semaphore closed")),
                _ = kill.notified() => {
                    return Ok(killed_result());
                }
            }
        } else {
            None
        };
        let _total_permit = tokio::select! {
            permit = self.total.clone().acquire_owned() => permit.expect("semaphore closed"),
            _ = kill.notified() => {
                return Ok(killed_result());
            }
        };

        let start = Instant::now();
        debug!(program = %spec.program, cwd = %spec.cwd, "spawning local subprocess");

        let mut command = tokio::process::Command::new(&spec.program);
        command
            .args(&spec.args)
            .current_dir(&spec.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command.env_clear();
        for (key, value) in &spec.env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|source| SubprocError::Spawn {
            program: spec.program.to_string(),
            source,
        })?;

        // drain pipes concurrently so a chatty child never blocks on a full
        // pipe buffer; the readers end at EOF when the child exits
        let mut stdout = child.stdout.take().expect("stdout piped");
        let mut stderr = child.stderr.take().expect("stderr piped");
        let stdout_task = tokio::spawn(async move {
            use tokio::io::AsyncReadExt;
            let mut buf = Vec::new();
            let _ = stdout.read_to_end(&mut buf).await;
            buf
        });
        let stderr_task = tokio::spawn(async move {
            use tokio::io::AsyncReadExt;
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf).await;
            buf
        });

        let mut killed = false;
        let waited = tokio::select! {
            result = child.wait() => Some(result),
            _ = kill.notified() => None,
        };
        let status = match waited {
            Some(result) => result?,
            None => {
                killed = true;
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "failed to kill subprocess");
                }
                child.wait().await?
            }
        };

        let stdout_buf = stdout_task.await.unwrap_or_default();
        let stderr_buf = stderr_task.await.unwrap_or_default();

        Ok(SubprocResult {
            exit_code: status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&stdout_buf).to_string(),
            stderr: String::from_utf8_lossy(&stderr_buf).to_string(),
            duration: start.elapsed(),
            killed,
        })
    }
}

fn killed_result() -> SubprocResult {
    SubprocResult {
        exit_code: -1,
        stdout: String::new(),
        stderr: String::new(),
        duration: Duration::ZERO,
        killed: true,
    }
}

/// Clonable kill switch for a subprocess; usable after the handle itself
/// has been moved into a waiter.
#[derive(Clone)]
pub struct KillHandle {
    kill: Arc<Notify>,
}

impl KillHandle {
    /// Kill the subprocess (or cancel it while still queued). Idempotent.
    pub fn kill(&self) {
        self.kill.notify_one();
    }
}

/// Handle to a running (or queued) subprocess.
pub struct SubprocHandle {
    kill: Arc<Notify>,
    join: tokio::task::JoinHandle<Result<SubprocResult, SubprocError>>,
}

impl SubprocHandle {
    /// Kill the subprocess (or cancel it while still queued). Idempotent.
    pub fn kill(&self) {
        self.kill.notify_one();
    }

    pub fn kill_handle(&self) -> KillHandle {
        KillHandle {
            kill: self.kill.clone(),
        }
    }

    /// Wait for completion and take the result.
    pub async fn wait(self) -> Result<SubprocResult, SubprocError> {
        self.join.await.map_err(|_| SubprocError::Lost)?
    }
}
