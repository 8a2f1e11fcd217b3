//! The compile-task state machine.
//!
//! One instance per intercepted compile. A task is pinned to one worker:
//! every state transition happens there, and background file workers only
//! send completions back. The flow is
//! `INIT → SETUP → FILE_REQ → CALL_EXEC → {LOCAL_OUTPUT | FILE_RESP} →
//! FINISHED`, with `LOCAL_RUN` (never dispatched remotely) and
//! `LOCAL_FINISHED` (local race won, or fallback completed) as the local
//! terminals. `abort` is orthogonal: the reply has been sent, the rest is
//! cleanup.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use facet::Facet;
use lx_deps::{deps_identifier, FileStatCache};
use lx_proto::{
    CacheHit, CompileRequest, Compression, ContentHash, ExecRequest, ExecResponse, ExpectedOutput,
    FileBlob, Fingerprint,
};
use lx_resolve::{resolve, ResolveError, ResolveOptions};
use lx_runtime::Priority;
use lx_subproc::{KillHandle, SubprocResult, SubprocSpec, Weight};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::compiler::{validate_compiler, CompilerCheck};
use crate::flags::{parse_gcc_style, CompileFlags};
use crate::service::Service;

/// Rename attempts for output commit before giving up.
const COMMIT_RETRIES: u32 = 4;

/// Failures a task can hit on its way through the states. Which of these
/// reach the user (versus the log) is decided where they are recorded.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("local compiler not found: {0}")]
    LocalCompilerMissing(String),

    #[error("include processor: {0}")]
    Resolver(#[from] ResolveError),

    #[error("exec rpc failed: {0}")]
    Rpc(#[from] lx_http::HttpError),

    #[error("malformed exec response")]
    ResponseParse,

    #[error("output commit failed: {0}")]
    OutputCommit(String),

    #[error("input file: {0}")]
    Input(String),

    #[error("{0}")]
    Internal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Init,
    Setup,
    FileReq,
    CallExec,
    LocalOutput,
    FileResp,
    Finished,
    LocalRun,
    LocalFinished,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Init => "INIT",
            TaskState::Setup => "SETUP",
            TaskState::FileReq => "FILE_REQ",
            TaskState::CallExec => "CALL_EXEC",
            TaskState::LocalOutput => "LOCAL_OUTPUT",
            TaskState::FileResp => "FILE_RESP",
            TaskState::Finished => "FINISHED",
            TaskState::LocalRun => "LOCAL_RUN",
            TaskState::LocalFinished => "LOCAL_FINISHED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Finished | TaskState::LocalRun | TaskState::LocalFinished
        )
    }
}

/// Where an error message goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrDest {
    /// Log file and status page only
    Log,
    /// Also appended to the response's stderr, where the user reads it
    User,
}

/// Accumulated per-phase timings.
#[derive(Debug, Clone, Copy, Default, Facet)]
pub struct TaskStats {
    pub setup_ms: u64,
    pub file_req_ms: u64,
    pub rpc_ms: u64,
    pub file_resp_ms: u64,
    pub total_ms: u64,
    pub input_files: u64,
    pub input_bytes: u64,
    pub output_files: u64,
}

/// Owner-thread snapshot of a task, serialized for `/status`.
#[derive(Debug, Clone, Facet)]
pub struct TaskSnapshot {
    pub id: u64,
    pub trace_id: String,
    /// Wall-clock intake time
    pub started_at: String,
    pub state: String,
    pub terminal: bool,
    pub elapsed_ms: u64,
    pub cache_hit: bool,
    pub local_cache_hit: bool,
    pub fallback: bool,
    pub abort: bool,
    pub canceled: bool,
    pub local_killed: bool,
    pub deps_cache_used: bool,
    pub stats: TaskStats,
}

/// Set when the caller's IPC connection goes away. The task still runs to
/// completion to populate caches, but skips output commit and reply.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct LocalRun {
    kill: KillHandle,
    result: oneshot::Receiver<Result<SubprocResult, lx_subproc::SubprocError>>,
}

pub struct CompileTask {
    id: u64,
    trace_id: String,
    service: Arc<Service>,
    request: CompileRequest,
    cancel: CancelFlag,

    state: TaskState,
    flags: CompileFlags,
    cwd: Utf8PathBuf,
    input_stats: Arc<FileStatCache>,
    output_stats: Arc<FileStatCache>,
    errors: Vec<(ErrDest, String)>,
    started: Instant,
    started_at: jiff::Timestamp,
    stats: TaskStats,

    local: Option<LocalRun>,
    local_result: Option<SubprocResult>,

    should_fallback: bool,
    fail_fallback: bool,
    abort: bool,
    cache_hit: bool,
    local_cache_hit: bool,
    local_killed: bool,
    deps_cache_used: bool,

    output_cache_key: Option<Fingerprint>,
    /// Outputs and diagnostics held for a deferred cache publish
    pending_cache_put: Option<PendingCachePut>,
}

struct PendingCachePut {
    outputs: Vec<(String, Vec<u8>, bool)>,
    stdout: String,
    stderr: String,
}

impl CompileTask {
    pub fn new(service: Arc<Service>, request: CompileRequest, cancel: CancelFlag) -> Self {
        let id = service.next_task_id();
        let trace_id = service.make_trace_id(id);
        let cwd = Utf8PathBuf::from(&request.cwd);
        Self {
            id,
            trace_id,
            service,
            request,
            cancel,
            state: TaskState::Init,
            flags: CompileFlags::default(),
            cwd,
            input_stats: Arc::new(FileStatCache::new()),
            output_stats: Arc::new(FileStatCache::new()),
            errors: Vec::new(),
            started: Instant::now(),
            started_at: jiff::Timestamp::now(),
            stats: TaskStats::default(),
            local: None,
            local_result: None,
            should_fallback: false,
            fail_fallback: false,
            abort: false,
            cache_hit: false,
            local_cache_hit: false,
            local_killed: false,
            deps_cache_used: false,
            output_cache_key: None,
            pending_cache_put: None,
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Drive the task to one of the terminal states. Exactly one response
    /// comes back, always.
    pub async fn run(mut self) -> ExecResponse {
        let response = self.drive().await;
        let response = self.finish(response).await;
        self.set_state(if self.state.is_terminal() {
            self.state
        } else {
            TaskState::Finished
        });
        response
    }

    async fn drive(&mut self) -> ExecResponse {
        // ---- INIT ----------------------------------------------------
        self.set_state(TaskState::Init);
        self.flags = parse_gcc_style(&self.request.args);

        let identity = self.request.compiler.clone();
        let cwd = self.cwd.clone();
        let check = tokio::task::spawn_blocking(move || validate_compiler(&identity, &cwd))
            .await
            .unwrap_or(CompilerCheck::Missing);

        match check {
            CompilerCheck::Valid => {}
            CompilerCheck::Missing => {
                let error = TaskError::LocalCompilerMissing(self.request.compiler.path.clone());
                self.add_error(ErrDest::User, error.to_string());
                return self.error_response();
            }
            CompilerCheck::HashMismatch => {
                // the remote toolchain is selected by the caller's hash;
                // a mismatched local binary cannot be shipped
                self.add_error(
                    ErrDest::Log,
                    format!(
                        "compiler hash mismatch for {}; running locally",
                        self.request.compiler.path
                    ),
                );
                self.should_fallback = true;
            }
        }

        if self.should_fallback {
            self.set_state(TaskState::LocalRun);
            return self.run_local().await;
        }

        if self.service.config.race_local || self.service.config.verify_output {
            self.start_local_subprocess();
        }

        // ---- SETUP ---------------------------------------------------
        self.set_state(TaskState::Setup);
        let setup_start = Instant::now();

        let required = match self.discover_inputs().await {
            Ok(required) => required,
            Err(error) => {
                self.add_error(ErrDest::Log, error.to_string());
                return self.fallback_or_fail().await;
            }
        };
        self.stats.setup_ms = setup_start.elapsed().as_millis() as u64;

        // ---- FILE_REQ ------------------------------------------------
        self.set_state(TaskState::FileReq);
        let file_req_start = Instant::now();

        // one link-sized upload at a time, process-wide; the permit covers
        // only the upload phase
        let loaded = {
            let _link_permit = if self.flags.linking {
                self.service.link_admission.clone().acquire_owned().await.ok()
            } else {
                None
            };
            self.load_inputs(&required).await
        };
        let inputs = match loaded {
            Ok(inputs) => inputs,
            Err(error) => {
                self.add_error(ErrDest::Log, error.to_string());
                return self.fallback_or_fail().await;
            }
        };
        self.stats.file_req_ms = file_req_start.elapsed().as_millis() as u64;
        self.stats.input_files = inputs.len() as u64;
        self.stats.input_bytes = inputs.iter().map(|b| b.size).sum();

        let input_hashes: Vec<(String, ContentHash)> = inputs
            .iter()
            .map(|blob| (blob.path.clone(), blob.content_hash))
            .collect();
        let cache_key = lx_outcache::output_cache_key(
            &self.request.compiler.content_hash,
            &self.request.args,
            &input_hashes,
        );
        self.output_cache_key = Some(cache_key);

        if let Some(hit) = self.service.output_cache.lookup(&cache_key).await {
            self.set_state(TaskState::LocalOutput);
            self.local_cache_hit = true;
            info!(trace = %self.trace_id, "local output cache hit");
            let (stdout, stderr) = (hit.stdout.clone(), hit.stderr.clone());
            match self.commit_cached_outputs(hit).await {
                Ok(()) => {
                    return ExecResponse {
                        exit_code: 0,
                        stdout,
                        stderr,
                        cache_hit: CacheHit::Storage,
                        outputs: vec![],
                        error: None,
                    };
                }
                Err(reason) => {
                    // treat a broken cache entry as a miss
                    self.local_cache_hit = false;
                    self.add_error(ErrDest::Log, reason);
                    self.service.output_cache.remove(&cache_key).await;
                }
            }
        }

        // ---- CALL_EXEC -----------------------------------------------
        self.set_state(TaskState::CallExec);
        let rpc_start = Instant::now();

        let exec_request = ExecRequest {
            trace_id: self.trace_id.clone(),
            compiler: self.request.compiler.clone(),
            cwd: self.request.cwd.clone(),
            args: self.request.args.clone(),
            env: self.request.env.clone(),
            inputs,
            expected_outputs: self
                .flags
                .outputs
                .iter()
                .map(|path| ExpectedOutput {
                    logical: "out".to_string(),
                    path: path.to_string(),
                    executable: false,
                })
                .collect(),
        };

        if let Some(auth) = &self.service.auth {
            auth.ensure_fresh().await;
        }

        let response = match self.call_exec(exec_request).await {
            CallOutcome::LocalWon(response) => return response,
            CallOutcome::Response(response) => response,
            CallOutcome::Failed(error) => {
                self.add_error(ErrDest::Log, error.to_string());
                return self.fallback_or_fail().await;
            }
        };
        self.stats.rpc_ms = rpc_start.elapsed().as_millis() as u64;

        self.cache_hit = response.cache_hit != CacheHit::Miss;

        if response.exit_code != 0 {
            // a real compile failure: the diagnostics are the product
            debug!(trace = %self.trace_id, exit = response.exit_code, "remote compile failed");
            return ExecResponse {
                outputs: vec![],
                ..response
            };
        }

        // ---- FILE_RESP -----------------------------------------------
        self.set_state(TaskState::FileResp);
        let file_resp_start = Instant::now();

        let committed = self.process_outputs(&response).await;
        self.stats.file_resp_ms = file_resp_start.elapsed().as_millis() as u64;
        self.stats.output_files = response.outputs.len() as u64;

        if let Err(error) = committed {
            self.add_error(ErrDest::User, error.to_string());
            return self.error_response();
        }

        ExecResponse {
            outputs: vec![],
            ..response
        }
    }

    /// Terminal bookkeeping: deferred cache publish, subprocess reaping,
    /// user-visible error propagation.
    async fn finish(&mut self, mut response: ExecResponse) -> ExecResponse {
        if let (Some(key), Some(pending)) = (self.output_cache_key, self.pending_cache_put.take())
        {
            if let Err(e) = self
                .service
                .output_cache
                .put(key, &pending.outputs, &pending.stdout, &pending.stderr)
                .await
            {
                warn!(trace = %self.trace_id, error = %e, "output cache publish failed");
            }
        }

        if let Some(local) = self.local.take() {
            local.kill.kill();
            self.local_killed = true;
            // reap so the process table stays clean
            let _ = local.result.await;
        }

        for (dest, message) in &self.errors {
            if *dest == ErrDest::User {
                if !response.stderr.is_empty() && !response.stderr.ends_with('\n') {
                    response.stderr.push('\n');
                }
                response.stderr.push_str(message);
                response.stderr.push('\n');
            }
        }

        self.stats.total_ms = self.started.elapsed().as_millis() as u64;
        response
    }

    // ------------------------------------------------------------------
    // SETUP helpers

    /// Enumerate the input set: dep-cache first, full resolution on miss.
    async fn discover_inputs(&mut self) -> Result<Vec<Utf8PathBuf>, TaskError> {
        let primary = self
            .flags
            .sources
            .first()
            .cloned()
            .unwrap_or_else(|| Utf8PathBuf::from(""));

        let deps_id = deps_identifier(
            &self.request.compiler.content_hash,
            &self.request.args,
            primary.as_str(),
            &self.request.env,
        );

        if let Some(cached) =
            self.service
                .deps_cache
                .lookup(&deps_id, &self.cwd, &self.input_stats)
        {
            self.deps_cache_used = true;
            debug!(trace = %self.trace_id, files = cached.len(), "deps cache hit");
            return Ok(self.with_declared_inputs(cached));
        }

        if self.flags.sources.is_empty() {
            // nothing to resolve (pure link): the declared inputs are all
            return Ok(self.with_declared_inputs(Vec::new()));
        }

        // resolver work is CPU-bound; keep it off the event loop
        let sources = self.flags.sources.clone();
        // search directories come from the caller's command line and are
        // relative to the caller's cwd, not the daemon's
        let mut search = self.flags.search.clone();
        for dir in search
            .quote
            .iter_mut()
            .chain(search.system.iter_mut())
            .chain(search.after.iter_mut())
        {
            if !dir.is_absolute() {
                *dir = self.cwd.join(&*dir);
            }
        }
        let macros = self.flags.initial_macros.clone();
        let cwd = self.cwd.clone();
        let service = self.service.clone();
        let stats = self.input_stats.clone();

        let resolved: Result<Vec<Utf8PathBuf>, ResolveError> =
            tokio::task::spawn_blocking(move || {
                let mut all = Vec::new();
                for source in &sources {
                    let path = if source.is_absolute() {
                        source.clone()
                    } else {
                        cwd.join(source)
                    };
                    let result = resolve(
                        &path,
                        macros.clone(),
                        &search,
                        &ResolveOptions::default(),
                        &stats,
                        &service.directive_cache,
                        &service.memo_cache,
                    )?;
                    for warning in &result.warnings {
                        debug!(source = %source, "{warning}");
                    }
                    all.extend(result.files);
                }
                Ok(all)
            })
            .await
            .map_err(|e| TaskError::Internal(format!("include processor panicked: {e}")))?;

        // every resolver failure (parse errors and missing includes
        // included) routes to local fallback, where the real compiler
        // produces the canonical diagnostic
        let files = resolved?;

        if !self
            .service
            .deps_cache
            .record(deps_id, &self.cwd, &files, &self.input_stats)
        {
            debug!(trace = %self.trace_id, "deps cache record skipped");
        }

        Ok(self.with_declared_inputs(files))
    }

    fn with_declared_inputs(&self, mut files: Vec<Utf8PathBuf>) -> Vec<Utf8PathBuf> {
        for declared in &self.request.declared_inputs {
            let path = Utf8PathBuf::from(declared);
            if !files.contains(&path) {
                files.push(path);
            }
        }
        files
    }

    // ------------------------------------------------------------------
    // FILE_REQ helpers

    /// Read and hash every input on the worker pool (MED priority), one
    /// closure per file.
    async fn load_inputs(&self, files: &[Utf8PathBuf]) -> Result<Vec<FileBlob>, TaskError> {
        let mut pending = Vec::with_capacity(files.len());

        for file in files {
            let (tx, rx) = oneshot::channel();
            let abs = if file.is_absolute() {
                file.clone()
            } else {
                self.cwd.join(file)
            };
            let name = file.to_string();
            let stats = self.input_stats.clone();

            self.service.pool.run(Priority::Med, move || {
                let _ = tx.send(read_input_blob(&abs, name, &stats));
            });
            pending.push(rx);
        }

        let mut blobs = Vec::with_capacity(pending.len());
        for rx in pending {
            match rx.await {
                Ok(Ok(blob)) => blobs.push(blob),
                Ok(Err(reason)) => return Err(TaskError::Input(reason)),
                Err(_) => return Err(TaskError::Input("file worker vanished".to_string())),
            }
        }
        Ok(blobs)
    }

    // ------------------------------------------------------------------
    // CALL_EXEC helpers

    async fn call_exec(&mut self, exec_request: ExecRequest) -> CallOutcome {
        let body = exec_request.to_bytes();
        let path = self.service.config.server_path.clone();

        let rpc_client = self.service.rpc.clone();
        let rpc = async move { rpc_client.call(&path, body).await };
        tokio::pin!(rpc);

        // racing: watch the local compiler while the RPC is in flight
        if let Some(mut local) = self.local.take() {
            loop {
                tokio::select! {
                    rpc_result = &mut rpc => {
                        self.local = Some(local);
                        return decode_exec_response(rpc_result);
                    }
                    local_result = &mut local.result => {
                        match local_result {
                            Ok(Ok(result)) if result.exit_code == 0 && !result.killed => {
                                // local won: discard the remote path entirely
                                self.abort = true;
                                self.set_state(TaskState::LocalFinished);
                                info!(trace = %self.trace_id, "local compile won the race");
                                return CallOutcome::LocalWon(response_from_local(&result));
                            }
                            Ok(Ok(result)) => {
                                // remember the outcome for verify/fallback
                                self.local_result = Some(result);
                                break;
                            }
                            // local run broke; stay on the remote path
                            _ => break,
                        }
                    }
                }
            }
        }

        decode_exec_response(rpc.await)
    }

    // ------------------------------------------------------------------
    // FILE_RESP helpers

    /// Write downloaded outputs to `<final>.tmp.<id>`, then atomically
    /// rename all of them into place. Skipped entirely for canceled tasks.
    async fn process_outputs(&mut self, response: &ExecResponse) -> Result<(), TaskError> {
        // deferred cache publish happens in finish(), canceled or not
        self.pending_cache_put = Some(PendingCachePut {
            outputs: response
                .outputs
                .iter()
                .map(|o| (o.path.clone(), o.content.clone(), o.executable))
                .collect(),
            stdout: response.stdout.clone(),
            stderr: response.stderr.clone(),
        });

        if self.cancel.is_canceled() {
            debug!(trace = %self.trace_id, "canceled; skipping output commit");
            return Ok(());
        }

        if self.service.config.verify_output {
            self.verify_against_local(response).await;
        }

        let mut temps = Vec::with_capacity(response.outputs.len());
        let mut pending = Vec::with_capacity(response.outputs.len());

        for output in &response.outputs {
            let final_path = self.resolve_output_path(&output.path);
            let tmp_path =
                Utf8PathBuf::from(format!("{final_path}.tmp.{id}", id = self.id));

            #[allow(unused_mut)]
            let mut content = output.content.clone();
            #[cfg(windows)]
            {
                let now = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs() as u32;
                crate::coff::rewrite_timestamp(&mut content, now);
            }

            let executable = output.executable;
            let (tx, rx) = oneshot::channel();
            let tmp = tmp_path.clone();
            self.service.pool.run(Priority::Med, move || {
                let result = lx_io::sync::atomic_write(&tmp, &content)
                    .and_then(|()| {
                        #[cfg(unix)]
                        if executable {
                            use std::os::unix::fs::PermissionsExt;
                            let perms = std::fs::Permissions::from_mode(0o755);
                            return std::fs::set_permissions(&tmp, perms);
                        }
                        let _ = executable;
                        Ok(())
                    })
                    .map_err(|e| format!("cannot write {tmp}: {e}"));
                let _ = tx.send(result);
            });
            pending.push(rx);
            temps.push((tmp_path, final_path));
        }

        for rx in pending {
            match rx.await {
                Ok(Ok(())) => {}
                Ok(Err(reason)) => {
                    cleanup_temps(&temps).await;
                    return Err(TaskError::OutputCommit(reason));
                }
                Err(_) => {
                    cleanup_temps(&temps).await;
                    return Err(TaskError::OutputCommit("file worker vanished".to_string()));
                }
            }
        }

        // second pass: all writes succeeded, flip everything into place
        for (tmp, final_path) in &temps {
            let mut attempt = 0;
            loop {
                match tokio::fs::rename(tmp, final_path).await {
                    Ok(()) => break,
                    Err(e) if attempt < COMMIT_RETRIES => {
                        attempt += 1;
                        debug!(trace = %self.trace_id, error = %e, path = %final_path, attempt, "rename retry");
                        tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
                    }
                    Err(e) => {
                        cleanup_temps(&temps).await;
                        return Err(TaskError::OutputCommit(format!("{final_path}: {e}")));
                    }
                }
            }
            self.output_stats.get(final_path);
        }

        Ok(())
    }

    /// Byte-compare remote outputs against what the local compiler wrote.
    async fn verify_against_local(&mut self, response: &ExecResponse) {
        let Some(local) = self.wait_local().await else {
            self.add_error(
                ErrDest::Log,
                "verify-output requested but no local result".to_string(),
            );
            return;
        };
        if local.exit_code != 0 {
            self.add_error(
                ErrDest::Log,
                format!("verify-output: local compile exited {}", local.exit_code),
            );
            return;
        }
        for output in &response.outputs {
            let path = self.resolve_output_path(&output.path);
            match tokio::fs::read(&path).await {
                Ok(local_bytes) if local_bytes == output.content => {}
                Ok(_) => {
                    self.add_error(
                        ErrDest::User,
                        format!("verify-output: {path} differs between local and remote compile"),
                    );
                }
                Err(e) => {
                    self.add_error(
                        ErrDest::Log,
                        format!("verify-output: cannot read local {path}: {e}"),
                    );
                }
            }
        }
    }

    /// Copy cached outputs to their final names.
    async fn commit_cached_outputs(
        &mut self,
        hit: lx_outcache::CacheHitEntry,
    ) -> Result<(), String> {
        if self.cancel.is_canceled() {
            return Ok(());
        }
        for (output, blob_path) in hit.outputs {
            let content = tokio::fs::read(&blob_path)
                .await
                .map_err(|e| format!("cache blob {blob_path} unreadable: {e}"))?;
            let final_path = self.resolve_output_path(&output.path);
            lx_io::atomic_write_executable(&final_path, &content, output.executable)
                .await
                .map_err(|e| format!("cannot write {final_path}: {e}"))?;
        }
        Ok(())
    }

    fn resolve_output_path(&self, path: &str) -> Utf8PathBuf {
        let path = Utf8Path::new(path);
        if path.is_absolute() {
            path.to_owned()
        } else {
            self.cwd.join(path)
        }
    }

    // ------------------------------------------------------------------
    // Local execution

    fn subproc_spec(&self) -> SubprocSpec {
        let mut env = self.request.env.clone();
        // the linker needs PATH even under an explicit environment
        if !env.iter().any(|(k, _)| k == "PATH") {
            if let Ok(path) = std::env::var("PATH") {
                env.push(("PATH".to_string(), path));
            }
        }
        SubprocSpec {
            program: Utf8PathBuf::from(&self.request.compiler.path),
            args: self.request.args.iter().skip(1).cloned().collect(),
            env,
            cwd: self.cwd.clone(),
            weight: if self.flags.linking {
                Weight::Heavy
            } else {
                Weight::Light
            },
        }
    }

    fn start_local_subprocess(&mut self) {
        if self.local.is_some() || self.local_result.is_some() {
            return;
        }
        let handle = self.service.subprocs.start(self.subproc_spec());
        let kill = handle.kill_handle();
        let (tx, rx) = oneshot::channel();
        tokio::task::spawn_local(async move {
            let _ = tx.send(handle.wait().await);
        });
        self.local = Some(LocalRun { kill, result: rx });
        debug!(trace = %self.trace_id, "local subprocess started");
    }

    /// Wait for the local subprocess result, starting it if needed.
    async fn wait_local(&mut self) -> Option<SubprocResult> {
        if self.local_result.is_some() {
            return self.local_result.clone();
        }
        if self.local.is_none() {
            self.start_local_subprocess();
        }
        let local = self.local.take()?;
        match local.result.await {
            Ok(Ok(result)) => {
                self.local_result = Some(result.clone());
                Some(result)
            }
            Ok(Err(e)) => {
                self.add_error(ErrDest::User, format!("local compile failed to run: {e}"));
                None
            }
            Err(_) => None,
        }
    }

    /// Run locally and reply with the local result (LOCAL_RUN path).
    async fn run_local(&mut self) -> ExecResponse {
        match self.wait_local().await {
            Some(result) => response_from_local(&result),
            None => self.error_response(),
        }
    }

    /// Remote path failed: fall back if allowed, else surface the error.
    async fn fallback_or_fail(&mut self) -> ExecResponse {
        if !self.service.config.fallback {
            self.add_error(
                ErrDest::User,
                "remote compile failed and fallback is disabled".to_string(),
            );
            return self.error_response();
        }

        self.fail_fallback = true;
        info!(trace = %self.trace_id, "falling back to local compile");
        let response = self.run_local().await;
        self.set_state(TaskState::LocalFinished);
        response
    }

    // ------------------------------------------------------------------

    fn set_state(&mut self, state: TaskState) {
        debug!(trace = %self.trace_id, from = self.state.as_str(), to = state.as_str(), "state");
        self.state = state;
        self.service.update_snapshot(self.snapshot());
    }

    fn add_error(&mut self, dest: ErrDest, message: String) {
        if dest == ErrDest::User {
            warn!(trace = %self.trace_id, "{message}");
        } else {
            debug!(trace = %self.trace_id, "{message}");
        }
        self.errors.push((dest, message));
    }

    fn error_response(&self) -> ExecResponse {
        let log: Vec<&str> = self.errors.iter().map(|(_, m)| m.as_str()).collect();
        ExecResponse {
            exit_code: 1,
            stdout: String::new(),
            stderr: String::new(),
            cache_hit: CacheHit::Miss,
            outputs: vec![],
            error: Some(log.join("; ")),
        }
    }

    /// Owner-thread snapshot; `/status` serializes these, never the task.
    fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id,
            trace_id: self.trace_id.clone(),
            started_at: self.started_at.to_string(),
            state: self.state.as_str().to_string(),
            terminal: self.state.is_terminal(),
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            cache_hit: self.cache_hit,
            local_cache_hit: self.local_cache_hit,
            fallback: self.fail_fallback,
            abort: self.abort,
            canceled: self.cancel.is_canceled(),
            local_killed: self.local_killed,
            deps_cache_used: self.deps_cache_used,
            stats: self.stats,
        }
    }
}

enum CallOutcome {
    Response(ExecResponse),
    LocalWon(ExecResponse),
    Failed(TaskError),
}

fn decode_exec_response(result: Result<Vec<u8>, lx_http::HttpError>) -> CallOutcome {
    match result {
        Ok(bytes) => match ExecResponse::from_bytes(&bytes) {
            Some(response) => CallOutcome::Response(response),
            None => CallOutcome::Failed(TaskError::ResponseParse),
        },
        Err(e) => CallOutcome::Failed(e.into()),
    }
}

fn response_from_local(result: &SubprocResult) -> ExecResponse {
    ExecResponse {
        exit_code: result.exit_code,
        stdout: result.stdout.clone(),
        stderr: result.stderr.clone(),
        cache_hit: CacheHit::Miss,
        outputs: vec![],
        error: None,
    }
}

/// Runs on a pool worker: read, hash, and wrap one input file.
fn read_input_blob(
    abs: &Utf8Path,
    name: String,
    stats: &FileStatCache,
) -> Result<FileBlob, String> {
    let stat = stats.get(abs);
    if !stat.exists {
        return Err(format!("input file missing: {abs}"));
    }
    let content = std::fs::read(abs).map_err(|e| format!("cannot read input {abs}: {e}"))?;
    let content_hash = ContentHash::of_bytes(&content);
    stats.set_content_hash(abs, content_hash);

    #[cfg(unix)]
    let executable = {
        use std::os::unix::fs::PermissionsExt;
        std::fs::metadata(abs)
            .map(|m| m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    };
    #[cfg(not(unix))]
    let executable = false;

    Ok(FileBlob {
        path: name,
        size: content.len() as u64,
        content_hash,
        executable,
        compression: Compression::None,
        content,
    })
}

async fn cleanup_temps(temps: &[(Utf8PathBuf, Utf8PathBuf)]) {
    for (tmp, _) in temps {
        let _ = tokio::fs::remove_file(tmp).await;
    }
}
