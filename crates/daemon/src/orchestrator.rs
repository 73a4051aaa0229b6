//! Run orchestration
//!
//! Owns the single execution slot. A run moves through
//! `Starting → Running → (Terminating) → Finalizing` and the slot is released
//! only after its terminal status is persisted, so a concurrent reconcile or
//! start never observes a half-finished run.
//!
//! Each spawned run gets one supervisor task which owns the child process. The
//! supervisor is the only place the child is waited on, so finalization runs
//! exactly once per run.

use crate::config::RunnerConfig;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use testdeck_common::{
    Error, PathResolver, ReportParser, Result, RunMode, RunPaths, RunStatus, RunStore, RunUpdate,
    EXIT_CODE_CANCELLED, EXIT_CODE_SPAWN_FAILED, EXIT_CODE_STALE, EXIT_CODE_TIMEOUT,
};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// How long finalization waits for the output pumps to drain
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

const PUMP_BUFFER_SIZE: usize = 8192;

/// Why a run was asked to terminate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationCause {
    Timeout,
    Cancelled,
}

impl TerminationCause {
    /// Exit code recorded in place of the process's own
    pub fn exit_code(&self) -> i32 {
        match self {
            TerminationCause::Timeout => EXIT_CODE_TIMEOUT,
            TerminationCause::Cancelled => EXIT_CODE_CANCELLED,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    /// Slot reserved, process not spawned yet
    Starting,
    Running,
    /// Termination requested; the first cause wins
    Terminating(TerminationCause),
    Finalizing,
}

impl RunPhase {
    fn cause(&self) -> Option<TerminationCause> {
        match self {
            RunPhase::Terminating(cause) => Some(*cause),
            _ => None,
        }
    }
}

/// Outcome of asking the active run to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TerminationRequest {
    /// This request moved the run to Terminating
    Accepted,
    AlreadyTerminating,
    /// Not the active run, or not in a phase that can be terminated
    Rejected,
}

/// Occupant of the execution slot
#[derive(Debug)]
struct ActiveRun {
    run_id: String,
    phase: RunPhase,
    /// Termination requests; a stored permit survives until the supervisor polls
    terminate: Arc<Notify>,
}

/// Everything needed to launch one run
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub run_id: String,
    pub suite_name: String,
    pub base_url: String,
    pub mode: RunMode,
    pub slow_mo_ms: u64,
    pub timeout: Duration,
    /// `--grep` filter, used to rerun failing tests only
    pub grep: Option<String>,
}

/// Append-only sink for one output stream
#[derive(Clone)]
struct LogSink {
    file: Arc<tokio::sync::Mutex<Option<File>>>,
}

impl LogSink {
    async fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path).await?;
        Ok(Self {
            file: Arc::new(tokio::sync::Mutex::new(Some(file))),
        })
    }

    async fn write(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut guard = self.file.lock().await;
        match guard.as_mut() {
            Some(file) => file.write_all(bytes).await,
            None => Ok(()),
        }
    }

    async fn write_line(&self, line: &str) {
        if let Err(e) = self.write(format!("{}\n", line).as_bytes()).await {
            warn!("Failed to write log line: {}", e);
        }
    }

    async fn close(&self) {
        let file = self.file.lock().await.take();
        if let Some(mut file) = file {
            if let Err(e) = file.flush().await {
                warn!("Failed to flush log sink: {}", e);
            }
        }
    }
}

/// Copy a child stream into a sink; each write completes before the next read
fn pump<R>(mut reader: R, sink: LogSink) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; PUMP_BUFFER_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if let Err(e) = sink.write(&buf[..n]).await {
                        warn!("Failed to write run output: {}", e);
                        break;
                    }
                }
                Err(e) => {
                    debug!("Run output stream closed: {}", e);
                    break;
                }
            }
        }
    })
}

struct Inner {
    store: Arc<dyn RunStore>,
    resolver: PathResolver,
    parser: ReportParser,
    runner: RunnerConfig,
    slot: Mutex<Option<ActiveRun>>,
    idle: Notify,
}

/// Clears a reserved slot if start fails before the run is handed off
struct StartingGuard<'a> {
    inner: &'a Inner,
    run_id: String,
    armed: bool,
}

impl StartingGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for StartingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.release(&self.run_id);
        }
    }
}

/// Single-flight run orchestrator
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn RunStore>, resolver: PathResolver, runner: RunnerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                parser: ReportParser::new(resolver.clone()),
                resolver,
                runner,
                slot: Mutex::new(None),
                idle: Notify::new(),
            }),
        }
    }

    /// Start a run. Returns once the process is spawned; a spawn failure is
    /// recorded as a FAILED run with exit code -1 rather than returned.
    pub async fn start_run(&self, request: RunRequest) -> Result<()> {
        let terminate = Arc::new(Notify::new());
        {
            let mut slot = self.inner.slot.lock();
            if let Some(active) = slot.as_ref() {
                return Err(Error::Concurrency {
                    active_run_id: active.run_id.clone(),
                });
            }
            *slot = Some(ActiveRun {
                run_id: request.run_id.clone(),
                phase: RunPhase::Starting,
                terminate: terminate.clone(),
            });
        }

        let mut guard = StartingGuard {
            inner: &self.inner,
            run_id: request.run_id.clone(),
            armed: true,
        };

        let paths = self.inner.resolver.paths_for(&request.run_id)?;
        tokio::fs::create_dir_all(&paths.run_dir).await?;
        let stdout_sink = LogSink::open(&paths.stdout).await?;
        let stderr_sink = LogSink::open(&paths.stderr).await?;

        let mut command = self.inner.command_for(&request, &paths);
        debug!(
            "Runner command: {} {}",
            self.inner.runner.program,
            self.inner.runner_args(&request).join(" ")
        );

        match command.spawn() {
            Ok(mut child) => {
                info!(
                    "Run {} started for suite {} (pid {:?})",
                    request.run_id,
                    request.suite_name,
                    child.id()
                );

                let mut pumps = Vec::with_capacity(2);
                if let Some(stdout) = child.stdout.take() {
                    pumps.push(pump(stdout, stdout_sink.clone()));
                }
                if let Some(stderr) = child.stderr.take() {
                    pumps.push(pump(stderr, stderr_sink.clone()));
                }

                self.inner.set_phase(&request.run_id, RunPhase::Running);
                guard.disarm();

                let supervisor = Supervisor {
                    inner: self.inner.clone(),
                    run_id: request.run_id.clone(),
                    paths,
                    timeout: request.timeout,
                    terminate,
                    sinks: [stdout_sink, stderr_sink],
                    pumps,
                };
                tokio::spawn(supervisor.run(child));
            }
            Err(e) => {
                error!("Failed to spawn runner for run {}: {}", request.run_id, e);
                stderr_sink.write_line(&format!("[spawn-error] {}", e)).await;

                self.inner.set_phase(&request.run_id, RunPhase::Finalizing);
                guard.disarm();
                self.inner
                    .finalize(&request.run_id, &paths, None, [stdout_sink, stderr_sink], Vec::new())
                    .await;
            }
        }

        Ok(())
    }

    /// Request termination of the active run. False when the run is not
    /// active or has not reached the running phase.
    pub fn cancel_run(&self, run_id: &str) -> bool {
        match self.inner.slot.lock().as_ref() {
            Some(active) if active.run_id == run_id => {}
            _ => return false,
        }
        self.inner.request_termination(run_id, TerminationCause::Cancelled) != TerminationRequest::Rejected
    }

    /// Mark persisted RUNNING runs this process is not tracking as FAILED (-2)
    pub fn reconcile_stale_running_runs(&self) -> Result<usize> {
        let active_id = self.inner.slot.lock().as_ref().map(|a| a.run_id.clone());

        let stale: Vec<String> = self
            .inner
            .store
            .list_run_ids_with_status(RunStatus::Running)?
            .into_iter()
            .filter(|id| Some(id) != active_id.as_ref())
            .collect();

        if stale.is_empty() {
            return Ok(0);
        }

        let changed = self.inner.store.update_runs_where_status(
            &stale,
            RunStatus::Running,
            &RunUpdate::failed(EXIT_CODE_STALE),
        )?;

        if changed > 0 {
            warn!("Reconciled {} stale running run(s) to FAILED", changed);
        }
        Ok(changed)
    }

    /// True while a run is starting, running or finalizing
    pub fn has_active_runs(&self) -> bool {
        self.inner.slot.lock().is_some()
    }

    pub fn active_run_id(&self) -> Option<String> {
        self.inner.slot.lock().as_ref().map(|a| a.run_id.clone())
    }

    pub fn active_phase(&self) -> Option<RunPhase> {
        self.inner.slot.lock().as_ref().map(|a| a.phase)
    }

    /// Wait until the slot is free
    pub async fn wait_until_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.has_active_runs() {
                return;
            }
            notified.await;
        }
    }
}

impl Inner {
    fn runner_args(&self, request: &RunRequest) -> Vec<String> {
        let suite_path = self.runner.tests_dir.join(&request.suite_name);

        let mut args = self.runner.args.clone();
        args.push(suite_path.to_string_lossy().into_owned());
        args.push(format!("--config={}", self.runner.config_path.display()));
        if request.mode == RunMode::Headed {
            args.push("--headed".to_string());
        }
        if let Some(pattern) = &request.grep {
            args.push("--grep".to_string());
            args.push(pattern.clone());
        }
        args
    }

    fn command_for(&self, request: &RunRequest, paths: &RunPaths) -> Command {
        let mut command = Command::new(&self.runner.program);
        command
            .args(self.runner_args(request))
            .current_dir(self.resolver.workspace_root())
            .env("BASE_URL", &request.base_url)
            .env("RUN_ID", &request.run_id)
            .env("SLOW_MO_MS", request.slow_mo_ms.to_string())
            .env("HEADLESS", if request.mode == RunMode::Headed { "0" } else { "1" })
            .env("RETRIES", self.runner.retries.to_string())
            .env("FORCE_COLOR", "1")
            .env("RUN_ARTIFACTS_DIR", &paths.run_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        command
    }

    fn set_phase(&self, run_id: &str, phase: RunPhase) {
        if let Some(active) = self.slot.lock().as_mut() {
            if active.run_id == run_id {
                active.phase = phase;
            }
        }
    }

    /// Record the first termination cause and wake the supervisor. Later
    /// requests leave the recorded cause unchanged.
    fn request_termination(&self, run_id: &str, cause: TerminationCause) -> TerminationRequest {
        let mut slot = self.slot.lock();
        let Some(active) = slot.as_mut().filter(|a| a.run_id == run_id) else {
            return TerminationRequest::Rejected;
        };

        match active.phase {
            RunPhase::Running => {
                info!("Terminating run {} ({:?})", run_id, cause);
                active.phase = RunPhase::Terminating(cause);
                active.terminate.notify_one();
                TerminationRequest::Accepted
            }
            RunPhase::Terminating(first) => {
                debug!("Run {} already terminating ({:?}); ignoring {:?}", run_id, first, cause);
                TerminationRequest::AlreadyTerminating
            }
            RunPhase::Starting | RunPhase::Finalizing => TerminationRequest::Rejected,
        }
    }

    /// Move to Finalizing and return the recorded termination cause
    fn begin_finalizing(&self, run_id: &str) -> Option<TerminationCause> {
        let mut slot = self.slot.lock();
        let active = slot.as_mut().filter(|a| a.run_id == run_id)?;
        let cause = active.phase.cause();
        active.phase = RunPhase::Finalizing;
        cause
    }

    fn release(&self, run_id: &str) {
        let mut slot = self.slot.lock();
        if slot.as_ref().map_or(false, |a| a.run_id == run_id) {
            *slot = None;
            drop(slot);
            self.idle.notify_waiters();
        }
    }

    async fn finalize(
        &self,
        run_id: &str,
        paths: &RunPaths,
        process_exit: Option<i32>,
        sinks: [LogSink; 2],
        pumps: Vec<JoinHandle<()>>,
    ) {
        let cause = self.begin_finalizing(run_id);

        for mut handle in pumps {
            if tokio::time::timeout(DRAIN_TIMEOUT, &mut handle).await.is_err() {
                warn!("Output of run {} did not drain in time", run_id);
                handle.abort();
            }
        }
        for sink in &sinks {
            sink.close().await;
        }

        let exit_code = cause
            .map(|c| c.exit_code())
            .or(process_exit)
            .unwrap_or(EXIT_CODE_SPAWN_FAILED);
        let summary = self.parser.parse_file(&paths.report).await.map(|r| r.summary);
        let update = RunUpdate::finished(exit_code, summary);

        match self.persist(run_id, &update) {
            Ok(true) => info!("Run {} finished: {} (exit code {})", run_id, update.status, exit_code),
            Ok(false) => debug!("Run {} no longer running in store; finalize skipped", run_id),
            Err(e) => error!("Failed to persist result of run {}: {}", run_id, e),
        }

        self.release(run_id);
    }

    fn persist(&self, run_id: &str, update: &RunUpdate) -> Result<bool> {
        if self.store.get_run(run_id)?.is_none() {
            return Ok(false);
        }
        let changed = self
            .store
            .update_runs_where_status(&[run_id.to_string()], RunStatus::Running, update)?;
        Ok(changed > 0)
    }
}

/// Per-run task owning the child process
struct Supervisor {
    inner: Arc<Inner>,
    run_id: String,
    paths: RunPaths,
    timeout: Duration,
    terminate: Arc<Notify>,
    sinks: [LogSink; 2],
    pumps: Vec<JoinHandle<()>>,
}

impl Supervisor {
    async fn run(self, mut child: Child) {
        let status = self.wait(&mut child).await;
        let process_exit = match status {
            Ok(status) => exit_code_of(status),
            Err(e) => {
                warn!("Failed to wait for run {}: {}", self.run_id, e);
                None
            }
        };

        let Supervisor {
            inner,
            run_id,
            paths,
            sinks,
            pumps,
            ..
        } = self;
        inner.finalize(&run_id, &paths, process_exit, sinks, pumps).await;
    }

    async fn wait(&self, child: &mut Child) -> std::io::Result<ExitStatus> {
        let pid = child.id();
        let grace = Duration::from_millis(self.inner.runner.grace_period_ms);

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);
        let mut timeout_armed = true;
        let mut kill_at: Option<Instant> = None;
        let mut killed = false;

        loop {
            tokio::select! {
                status = child.wait() => return status,

                _ = &mut deadline, if timeout_armed => {
                    timeout_armed = false;
                    let request = self.inner.request_termination(&self.run_id, TerminationCause::Timeout);
                    if request == TerminationRequest::Accepted {
                        warn!("Run {} exceeded {} ms", self.run_id, self.timeout.as_millis());
                        self.sinks[1]
                            .write_line(&format!(
                                "[timeout] Run exceeded {} ms; terminating",
                                self.timeout.as_millis()
                            ))
                            .await;
                    }
                }

                _ = self.terminate.notified(), if kill_at.is_none() && !killed => {
                    signal_group(pid, Signal::SIGTERM);
                    kill_at = Some(Instant::now() + grace);
                }

                _ = tokio::time::sleep_until(kill_at.unwrap_or_else(Instant::now)), if kill_at.is_some() => {
                    info!("Force killing run {} after {} ms grace", self.run_id, grace.as_millis());
                    signal_group(pid, Signal::SIGKILL);
                    if let Err(e) = child.start_kill() {
                        debug!("Kill of run {} failed: {}", self.run_id, e);
                    }
                    kill_at = None;
                    killed = true;
                }
            }
        }
    }
}

/// Signal the child's whole process group
fn signal_group(pid: Option<u32>, signal: Signal) {
    let Some(pid) = pid else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(pid as i32), signal) {
        debug!("Failed to send {:?} to process group {}: {}", signal, pid, e);
    }
}

/// Real exit code; None when the process was killed by a signal
fn exit_code_of(status: ExitStatus) -> Option<i32> {
    status.code()
}

#[cfg(test)]
mod tests {
    use super::*;
    use testdeck_common::{Database, Run};

    const LONG: Duration = Duration::from_secs(30);

    struct Harness {
        _dir: tempfile::TempDir,
        db: Database,
        resolver: PathResolver,
        orchestrator: Orchestrator,
    }

    /// Runner that executes the suite name as a shell script: `sh -c <suite> <config arg>`
    fn harness(grace_period_ms: u64) -> Harness {
        harness_with(RunnerConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string()],
            tests_dir: std::path::PathBuf::new(),
            grace_period_ms,
            ..RunnerConfig::default()
        })
    }

    fn harness_with(runner: RunnerConfig) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_memory().unwrap();
        let resolver = PathResolver::new(dir.path());
        let orchestrator = Orchestrator::new(Arc::new(db.clone()), resolver.clone(), runner);
        Harness {
            _dir: dir,
            db,
            resolver,
            orchestrator,
        }
    }

    impl Harness {
        fn create(&self, run_id: &str) {
            self.db
                .create_run(&Run::running(run_id, "t1", "smoke.spec.ts", RunMode::Headless, 0))
                .unwrap();
        }

        fn request(&self, run_id: &str, script: &str, timeout: Duration) -> RunRequest {
            RunRequest {
                run_id: run_id.to_string(),
                suite_name: script.to_string(),
                base_url: "http://localhost:3000".to_string(),
                mode: RunMode::Headless,
                slow_mo_ms: 0,
                timeout,
                grep: None,
            }
        }

        async fn start(&self, run_id: &str, script: &str, timeout: Duration) -> Result<()> {
            self.create(run_id);
            self.orchestrator.start_run(self.request(run_id, script, timeout)).await
        }

        async fn wait_idle(&self) {
            tokio::time::timeout(Duration::from_secs(20), self.orchestrator.wait_until_idle())
                .await
                .expect("run did not finish in time");
        }

        fn run(&self, run_id: &str) -> Run {
            self.db.get_run(run_id).unwrap().unwrap()
        }
    }

    #[tokio::test]
    async fn test_successful_run_passes_and_captures_output() {
        let h = harness(200);
        h.start("ok", "echo hello; echo oops >&2; echo \"$RUN_ID $HEADLESS\"", LONG)
            .await
            .unwrap();
        h.wait_idle().await;

        let run = h.run("ok");
        assert_eq!(run.status, RunStatus::Passed);
        assert_eq!(run.exit_code, Some(0));
        assert!(run.finished_at.is_some());

        let paths = h.resolver.paths_for("ok").unwrap();
        let stdout = std::fs::read_to_string(paths.stdout).unwrap();
        assert_eq!(stdout, "hello\nok 1\n");
        assert_eq!(std::fs::read_to_string(paths.stderr).unwrap(), "oops\n");
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails_with_summary() {
        let h = harness(200);
        let report = r#"{"stats":{"expected":2,"unexpected":1,"flaky":0,"skipped":1,"duration":42}}"#;
        let script = format!("printf '%s' '{}' > \"$RUN_ARTIFACTS_DIR/report.json\"; exit 3", report);
        h.start("bad", &script, LONG).await.unwrap();
        h.wait_idle().await;

        let run = h.run("bad");
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.exit_code, Some(3));
        assert_eq!(run.total, Some(3));
        assert_eq!(run.passed, Some(2));
        assert_eq!(run.failed, Some(1));
        assert_eq!(run.duration_ms, Some(42));
    }

    #[tokio::test]
    async fn test_timeout_records_124() {
        let h = harness(200);
        h.start("slow", "sleep 30", Duration::from_millis(50)).await.unwrap();
        h.wait_idle().await;

        let run = h.run("slow");
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.exit_code, Some(EXIT_CODE_TIMEOUT));

        let stderr = std::fs::read_to_string(h.resolver.paths_for("slow").unwrap().stderr).unwrap();
        assert!(stderr.contains("[timeout]"));
    }

    #[tokio::test]
    async fn test_forced_kill_after_grace_period() {
        let h = harness(300);
        let started = Instant::now();
        h.start("stubborn", "trap '' TERM; sleep 30", Duration::from_millis(50))
            .await
            .unwrap();
        h.wait_idle().await;

        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(started.elapsed() < Duration::from_secs(15));
        assert_eq!(h.run("stubborn").exit_code, Some(EXIT_CODE_TIMEOUT));
    }

    #[tokio::test]
    async fn test_concurrent_start_is_rejected() {
        let h = harness(200);
        h.start("a", "sleep 30", LONG).await.unwrap();

        let err = h.start("b", "true", LONG).await.unwrap_err();
        match err {
            Error::Concurrency { active_run_id } => assert_eq!(active_run_id, "a"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(!h.resolver.paths_for("b").unwrap().run_dir.exists());
        assert_eq!(h.db.count_by_status(RunStatus::Running).unwrap(), 2);

        assert!(h.orchestrator.cancel_run("a"));
        h.wait_idle().await;

        h.start("c", "true", LONG).await.unwrap();
        h.wait_idle().await;
        assert_eq!(h.run("c").status, RunStatus::Passed);
    }

    #[tokio::test]
    async fn test_cancel_records_130_and_is_idempotent() {
        let h = harness(200);
        h.start("x", "sleep 30", LONG).await.unwrap();

        assert!(h.orchestrator.cancel_run("x"));
        assert!(h.orchestrator.cancel_run("x"));
        assert_eq!(
            h.orchestrator.active_phase(),
            Some(RunPhase::Terminating(TerminationCause::Cancelled))
        );
        assert!(!h.orchestrator.cancel_run("other"));
        h.wait_idle().await;

        let run = h.run("x");
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.exit_code, Some(EXIT_CODE_CANCELLED));
        assert!(!h.orchestrator.cancel_run("x"));
    }

    #[tokio::test]
    async fn test_timeout_during_cancel_grace_keeps_cancel() {
        let h = harness(1500);
        h.start("late", "trap '' TERM; sleep 30", Duration::from_millis(300))
            .await
            .unwrap();

        assert!(h.orchestrator.cancel_run("late"));
        h.wait_idle().await;

        assert_eq!(h.run("late").exit_code, Some(EXIT_CODE_CANCELLED));
        let stderr = std::fs::read_to_string(h.resolver.paths_for("late").unwrap().stderr).unwrap();
        assert!(!stderr.contains("[timeout]"));
    }

    #[tokio::test]
    async fn test_spawn_failure_records_minus_one() {
        let h = harness_with(RunnerConfig {
            program: "/nonexistent/testdeck-runner".to_string(),
            ..RunnerConfig::default()
        });
        h.start("nospawn", "ignored", LONG).await.unwrap();
        h.wait_idle().await;

        let run = h.run("nospawn");
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.exit_code, Some(EXIT_CODE_SPAWN_FAILED));
        assert!(!h.orchestrator.has_active_runs());

        let stderr = std::fs::read_to_string(h.resolver.paths_for("nospawn").unwrap().stderr).unwrap();
        assert!(stderr.starts_with("[spawn-error]"));
    }

    #[tokio::test]
    async fn test_invalid_run_id_releases_slot() {
        let h = harness(200);
        let err = h
            .orchestrator
            .start_run(h.request("../escape", "true", LONG))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRunId(_)));
        assert!(!h.orchestrator.has_active_runs());
    }

    #[tokio::test]
    async fn test_deleted_record_finalizes_silently() {
        let h = harness(200);
        // no persisted record for this run
        h.orchestrator
            .start_run(h.request("ghost", "true", LONG))
            .await
            .unwrap();
        h.wait_idle().await;
        assert!(h.db.get_run("ghost").unwrap().is_none());
        assert!(!h.orchestrator.has_active_runs());
    }

    #[tokio::test]
    async fn test_finalize_transitions_once() {
        let h = harness(200);
        h.start("once", "exit 0", LONG).await.unwrap();
        h.wait_idle().await;
        let first = h.run("once");
        assert_eq!(first.status, RunStatus::Passed);

        // a later stale reconcile must not touch the terminal record
        assert_eq!(h.orchestrator.reconcile_stale_running_runs().unwrap(), 0);
        assert_eq!(h.run("once"), first);
    }

    #[tokio::test]
    async fn test_reconcile_marks_stale_runs() {
        let h = harness(200);
        h.create("stale");

        assert_eq!(h.orchestrator.reconcile_stale_running_runs().unwrap(), 1);
        let run = h.run("stale");
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.exit_code, Some(EXIT_CODE_STALE));
        assert!(run.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_reconcile_spares_active_run() {
        let h = harness(200);
        h.start("live", "sleep 30", LONG).await.unwrap();
        h.create("stale");

        assert_eq!(h.orchestrator.reconcile_stale_running_runs().unwrap(), 1);
        assert_eq!(h.run("live").status, RunStatus::Running);

        h.orchestrator.cancel_run("live");
        h.wait_idle().await;
    }

    #[test]
    fn test_runner_args() {
        let h = harness_with(RunnerConfig::default());
        let request = RunRequest {
            run_id: "r".to_string(),
            suite_name: "checkout/cart.spec.ts".to_string(),
            base_url: "http://app".to_string(),
            mode: RunMode::Headed,
            slow_mo_ms: 250,
            timeout: LONG,
            grep: Some("(a|b)".to_string()),
        };
        assert_eq!(
            h.orchestrator.inner.runner_args(&request),
            vec![
                "playwright",
                "test",
                "playwright/tests/checkout/cart.spec.ts",
                "--config=playwright/playwright.config.ts",
                "--headed",
                "--grep",
                "(a|b)",
            ]
        );
    }
}
