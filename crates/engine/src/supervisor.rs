use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::ledger::ExecutionLedger;
use crate::policy::PolicyGate;
use crate::quota::QuotaTracker;
use crate::sandbox::SandboxSpec;
use crate::sync::lock;
use crate::toolchain::{ResolvedToolchain, Toolchain};
use crate::types::{
    JobLimits, JobRecord, JobState, LogChunk, StopReason, Submission, UserId,
};

/// Resource ceilings resolved for one job (global defaults merged with the
/// submission's overrides).
#[derive(Debug, Clone, Copy)]
pub(crate) struct EffectiveLimits {
    pub(crate) memory_limit_bytes: u64,
    pub(crate) cpu_limit_percent: f64,
    pub(crate) max_runtime: Duration,
}

/// Monitor-facing view of one running job.
#[derive(Debug, Clone)]
pub(crate) struct RunningJob {
    pub(crate) id: Uuid,
    pub(crate) pid: u32,
    pub(crate) running_for: Duration,
    pub(crate) limits: EffectiveLimits,
}

/// Live control entry for a non-terminal job. The OS process handle itself
/// is owned by the job's task; the table holds what the supervisor needs to
/// observe and terminate it.
#[derive(Debug)]
struct LiveJob {
    user_id: UserId,
    pid: Option<u32>,
    started: Option<Instant>,
    limits: EffectiveLimits,
    kill_tx: mpsc::Sender<StopReason>,
    kill_requested: bool,
}

enum CompileOutcome {
    Succeeded,
    Failed { code: Option<i32>, timed_out: bool },
}

/// Owns the lifecycle of every submitted job: admission, compile, launch,
/// output draining, observation of exit, and termination.
#[derive(Debug)]
pub struct ProcessSupervisor {
    config: EngineConfig,
    toolchain: Toolchain,
    policy: PolicyGate,
    quota: QuotaTracker,
    sandbox: SandboxSpec,
    ledger: Arc<ExecutionLedger>,
    table: Mutex<HashMap<Uuid, LiveJob>>,
}

impl ProcessSupervisor {
    pub fn new(config: EngineConfig, ledger: Arc<ExecutionLedger>) -> Result<Self> {
        let policy = PolicyGate::new(&config.security)?;
        let quota = QuotaTracker::new(&config.limits);
        let toolchain = Toolchain::new(config.languages.clone());
        let sandbox = SandboxSpec::detect(&config.security);
        Ok(Self {
            config,
            toolchain,
            policy,
            quota,
            sandbox,
            ledger,
            table: Mutex::new(HashMap::new()),
        })
    }

    /// Admit a submission and launch its job task.
    ///
    /// Validation order: allow-list, language, policy, then quota — the
    /// cheap, certain-failure checks run first so a submission that cannot
    /// run never consumes a quota slot another user could have used.
    pub async fn submit(self: &Arc<Self>, submission: Submission) -> Result<Uuid> {
        let user_id = submission.user_id;
        let allowed = &self.config.security.allowed_users;
        if !allowed.is_empty() && !allowed.contains(&user_id) {
            return Err(EngineError::UserNotAllowed(user_id));
        }

        let language = match &submission.language {
            Some(language) => language.clone(),
            None => self
                .toolchain
                .detect(&submission.source)
                .map(String::from)
                .ok_or_else(|| {
                    EngineError::UnsupportedLanguage("could not detect language".into())
                })?,
        };
        let plan = self.toolchain.resolve(&language)?;
        self.policy.evaluate(&submission.source, &plan.language)?;

        let source_bytes = submission.source.len() as u64;
        self.quota.reserve(user_id, source_bytes)?;

        // Quota is held from here on; give the slot back on any failure.
        match self.admit(submission, plan, source_bytes).await {
            Ok(id) => Ok(id),
            Err(e) => {
                self.quota.release(user_id);
                Err(e)
            }
        }
    }

    async fn admit(
        self: &Arc<Self>,
        submission: Submission,
        plan: ResolvedToolchain,
        source_bytes: u64,
    ) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let job_dir = self.config.jobs_dir.join(id.to_string());
        tokio::fs::create_dir_all(&job_dir).await?;
        tokio::fs::write(job_dir.join(&plan.file_name), &submission.source).await?;

        let limits = self.effective_limits(&submission.limits);
        self.ledger.record_submission(JobRecord {
            id,
            user_id: submission.user_id,
            language: plan.language.clone(),
            source_bytes,
            compile_command: plan.compile_command.clone(),
            run_command: plan.run_command.clone(),
            state: JobState::Pending,
            reason: None,
            created_seq: 0, // assigned by the ledger
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        });

        let (kill_tx, kill_rx) = mpsc::channel(1);
        lock(&self.table).insert(
            id,
            LiveJob {
                user_id: submission.user_id,
                pid: None,
                started: None,
                limits,
                kill_tx,
                kill_requested: false,
            },
        );

        info!(
            job_id = %id,
            user_id = submission.user_id,
            language = %plan.language,
            source_bytes,
            "job admitted"
        );

        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            supervisor.run_job(id, job_dir, plan, limits, kill_rx).await;
        });
        Ok(id)
    }

    /// Stop a job on behalf of its owner or an admin.
    ///
    /// Stopping an already-terminal job is a success no-op: a caller racing
    /// with natural completion must not see a failure.
    pub fn stop(&self, job_id: Uuid, requested_by: UserId) -> Result<()> {
        let record = self
            .ledger
            .job(job_id)
            .ok_or(EngineError::NotFound(job_id))?;
        let is_admin = self.config.security.admin_users.contains(&requested_by);
        if record.user_id != requested_by && !is_admin {
            return Err(EngineError::NotOwner {
                job: job_id,
                user: requested_by,
            });
        }
        if record.state.is_terminal() {
            return Ok(());
        }
        self.request_kill(job_id, StopReason::Requested { by: requested_by });
        Ok(())
    }

    pub fn status(&self, job_id: Uuid) -> Result<JobRecord> {
        self.ledger.job(job_id).ok_or(EngineError::NotFound(job_id))
    }

    /// All jobs of one user, in creation order.
    pub fn list_by_user(&self, user: UserId) -> Vec<JobRecord> {
        self.ledger.jobs_by_user(user)
    }

    /// Most recent `max_lines` of captured output, in emission order.
    pub fn logs(&self, job_id: Uuid, max_lines: usize) -> Result<Vec<LogChunk>> {
        self.ledger.logs_tail(job_id, max_lines)
    }

    /// Ask a job's task to terminate it. Returns whether this call won the
    /// race: of two concurrent triggers (external stop vs. monitor kill),
    /// only the first sets the recorded reason and drives the OS-level
    /// termination; the loser no-ops.
    pub(crate) fn request_kill(&self, job_id: Uuid, reason: StopReason) -> bool {
        let mut table = lock(&self.table);
        let Some(job) = table.get_mut(&job_id) else {
            return false;
        };
        if job.kill_requested {
            return false;
        }
        job.kill_requested = true;
        if job.kill_tx.try_send(reason).is_err() {
            // The job task is already tearing down and will settle the
            // terminal state itself.
            warn!(job_id = %job_id, "kill request raced with job completion");
        }
        true
    }

    /// Snapshot of jobs with a live process, for the Resource Monitor.
    pub(crate) fn running_jobs(&self) -> Vec<RunningJob> {
        let table = lock(&self.table);
        table
            .iter()
            .filter_map(|(id, job)| {
                let pid = job.pid?;
                let started = job.started?;
                Some(RunningJob {
                    id: *id,
                    pid,
                    running_for: started.elapsed(),
                    limits: job.limits,
                })
            })
            .collect()
    }

    pub(crate) fn live_jobs(&self) -> Vec<Uuid> {
        lock(&self.table).keys().copied().collect()
    }

    pub(crate) fn live_count(&self) -> usize {
        lock(&self.table).len()
    }

    fn effective_limits(&self, overrides: &JobLimits) -> EffectiveLimits {
        let limits = &self.config.limits;
        EffectiveLimits {
            memory_limit_bytes: overrides
                .memory_limit_bytes
                .unwrap_or(limits.memory_limit_bytes),
            cpu_limit_percent: overrides
                .cpu_limit_percent
                .unwrap_or(limits.cpu_limit_percent),
            max_runtime: Duration::from_secs(
                overrides.max_runtime_secs.unwrap_or(limits.max_runtime_secs),
            ),
        }
    }

    fn grace_period(&self) -> Duration {
        Duration::from_millis(self.config.limits.grace_period_ms)
    }

    // -----------------------------------------------------------------------
    // Job task
    // -----------------------------------------------------------------------

    async fn run_job(
        self: Arc<Self>,
        id: Uuid,
        job_dir: PathBuf,
        plan: ResolvedToolchain,
        limits: EffectiveLimits,
        mut kill_rx: mpsc::Receiver<StopReason>,
    ) {
        if let Some(compile_command) = &plan.compile_command {
            self.transition(id, JobState::Compiling);
            match self
                .run_compile(id, &job_dir, compile_command, plan.compile_timeout)
                .await
            {
                Ok(CompileOutcome::Succeeded) => {}
                Ok(CompileOutcome::Failed { code, timed_out }) => {
                    self.finalize(id, StopReason::CompileError { code, timed_out });
                    return;
                }
                Err(e) => {
                    error!(job_id = %id, error = %e, "compile step could not run");
                    self.finalize(
                        id,
                        StopReason::SpawnFailed {
                            detail: "compile step could not be started".into(),
                        },
                    );
                    return;
                }
            }
        }
        // A stop that arrived before launch ends the job here.
        if let Ok(reason) = kill_rx.try_recv() {
            self.finalize(id, reason);
            return;
        }

        let command_line = self.sandbox.command_line(
            &plan.run_command,
            limits.memory_limit_bytes,
            limits.max_runtime.as_secs(),
        );
        let mut child = match self.spawn_run(&job_dir, &command_line, limits.memory_limit_bytes) {
            Ok(child) => child,
            Err(e) => {
                // Environment fault: operators get the detail, the user a
                // generic failure on their next status query.
                error!(
                    job_id = %id,
                    error = %e,
                    command = %command_line,
                    "failed to spawn job process"
                );
                self.finalize(
                    id,
                    StopReason::SpawnFailed {
                        detail: "script process could not be started".into(),
                    },
                );
                return;
            }
        };

        let pid = child.id();
        {
            let mut table = lock(&self.table);
            if let Some(job) = table.get_mut(&id) {
                job.pid = pid;
                job.started = Some(Instant::now());
            }
        }
        self.transition(id, JobState::Running);
        info!(job_id = %id, pid = ?pid, "job running");

        // Output draining runs decoupled from this task so a verbose script
        // can never stall command handling.
        let drain_out = child
            .stdout
            .take()
            .map(|s| tokio::spawn(drain_lines(Arc::clone(&self.ledger), id, s)));
        let drain_err = child
            .stderr
            .take()
            .map(|s| tokio::spawn(drain_lines(Arc::clone(&self.ledger), id, s)));

        let mut kill_reason: Option<StopReason> = None;
        let wait_result = tokio::select! {
            status = child.wait() => Some(status),
            reason = kill_rx.recv() => {
                kill_reason = reason;
                None
            }
        };
        let status = match wait_result {
            Some(status) => status,
            None => self.terminate_with_grace(&mut child, pid).await,
        };

        // Grandchildren may hold the pipes open past the group kill; give
        // the drains a bounded window to flush, then cut them loose.
        for mut handle in [drain_out, drain_err].into_iter().flatten() {
            if tokio::time::timeout(self.grace_period(), &mut handle)
                .await
                .is_err()
            {
                handle.abort();
            }
        }

        let reason = match kill_reason {
            Some(reason) => reason,
            // A kill accepted just before natural exit still sets the reason.
            None => match kill_rx.try_recv() {
                Ok(reason) => reason,
                Err(_) => exit_reason(status),
            },
        };
        self.finalize(id, reason);
    }

    async fn run_compile(
        &self,
        id: Uuid,
        job_dir: &Path,
        command: &str,
        timeout: Duration,
    ) -> std::io::Result<CompileOutcome> {
        info!(job_id = %id, command, "compiling");
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(job_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()?;
        let pid = child.id();

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => {
                let output = output?;
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);
                for line in stdout.lines().chain(stderr.lines()) {
                    self.ledger.append_log(id, line.to_string());
                }
                if output.status.success() {
                    Ok(CompileOutcome::Succeeded)
                } else {
                    warn!(job_id = %id, code = ?output.status.code(), "compile step failed");
                    Ok(CompileOutcome::Failed {
                        code: output.status.code(),
                        timed_out: false,
                    })
                }
            }
            Err(_) => {
                if let Some(pid) = pid {
                    signal_group(pid, nix::sys::signal::Signal::SIGKILL);
                }
                self.ledger.append_log(
                    id,
                    format!("compile step timed out after {}s", timeout.as_secs()),
                );
                warn!(job_id = %id, timeout_secs = timeout.as_secs(), "compile step timed out");
                Ok(CompileOutcome::Failed {
                    code: None,
                    timed_out: true,
                })
            }
        }
    }

    fn spawn_run(
        &self,
        job_dir: &Path,
        command_line: &str,
        memory_limit_bytes: u64,
    ) -> std::io::Result<Child> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command_line)
            .current_dir(job_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        if !self.sandbox.is_active() {
            // Direct launch: cap the address space at process creation.
            unsafe {
                cmd.pre_exec(move || {
                    nix::sys::resource::setrlimit(
                        nix::sys::resource::Resource::RLIMIT_AS,
                        memory_limit_bytes,
                        memory_limit_bytes,
                    )
                    .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
                });
            }
        }
        cmd.spawn()
    }

    /// SIGTERM the process group, wait out the grace period, then SIGKILL.
    async fn terminate_with_grace(
        &self,
        child: &mut Child,
        pid: Option<u32>,
    ) -> std::io::Result<std::process::ExitStatus> {
        if let Some(pid) = pid {
            signal_group(pid, nix::sys::signal::Signal::SIGTERM);
        }
        match tokio::time::timeout(self.grace_period(), child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                if let Some(pid) = pid {
                    signal_group(pid, nix::sys::signal::Signal::SIGKILL);
                }
                let _ = child.start_kill();
                child.wait().await
            }
        }
    }

    fn transition(&self, id: Uuid, to: JobState) {
        if let Err(e) = self.ledger.record_transition(id, to, None) {
            error!(job_id = %id, state = %to, error = %e, "state transition failed");
        }
    }

    /// Settle the terminal state: drop the live entry first so the monitor
    /// stops seeing the job, then write the terminal record, then give the
    /// quota slot back.
    fn finalize(&self, id: Uuid, reason: StopReason) {
        let state = reason.terminal_state();
        let user_id = lock(&self.table).remove(&id).map(|job| job.user_id);
        if let Err(e) = self.ledger.record_transition(id, state, Some(reason.clone())) {
            error!(job_id = %id, error = %e, "terminal transition failed");
        }
        if let Some(user_id) = user_id {
            self.quota.release(user_id);
        }
        info!(job_id = %id, state = %state, reason = %reason, "job finished");
    }
}

async fn drain_lines<R>(ledger: Arc<ExecutionLedger>, job_id: Uuid, stream: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        ledger.append_log(job_id, line);
    }
}

/// Signal the whole process group of a job. Requires the child to have been
/// spawned with `process_group(0)` so its PGID equals its PID. No-op once
/// the group is gone or the PID does not fit an `i32`.
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) {
    if let Ok(pid) = i32::try_from(pid) {
        let _ = nix::sys::signal::killpg(nix::unistd::Pid::from_raw(pid), signal);
    }
}

fn exit_reason(status: std::io::Result<std::process::ExitStatus>) -> StopReason {
    match status {
        Ok(status) => StopReason::Exited {
            code: status.code(),
            signal: status.signal(),
        },
        Err(e) => StopReason::SpawnFailed {
            detail: format!("wait failed: {e}"),
        },
    }
}
