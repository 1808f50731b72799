use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque external user identifier (as delivered by the messaging front end).
pub type UserId = i64;

// ---------------------------------------------------------------------------
// Job lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Compiling,
    Running,
    Completed,
    Stopped,
    Killed,
    Crashed,
    CompileFailed,
}

impl JobState {
    /// Terminal states have no outgoing transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed
                | JobState::Stopped
                | JobState::Killed
                | JobState::Crashed
                | JobState::CompileFailed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Compiling => "compiling",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Stopped => "stopped",
            JobState::Killed => "killed",
            JobState::Crashed => "crashed",
            JobState::CompileFailed => "compile_failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a job left the `Running` (or earlier) state. Recorded once, on the
/// terminal transition; distinct reasons let statistics tell a voluntary
/// stop from an enforced kill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum StopReason {
    /// Explicit stop request from the owner or an admin.
    Requested { by: UserId },
    /// Resident memory of the process tree exceeded the ceiling.
    MemoryLimit { rss_bytes: u64, limit_bytes: u64 },
    /// CPU usage of the process tree exceeded the ceiling.
    CpuLimit { percent: f64, limit_percent: f64 },
    /// Absolute wall-clock runtime exceeded.
    Timeout { limit_secs: u64 },
    /// The process exited on its own.
    Exited {
        code: Option<i32>,
        signal: Option<i32>,
    },
    /// The compile step failed or timed out.
    CompileError { code: Option<i32>, timed_out: bool },
    /// The run command could not be spawned (environment fault).
    SpawnFailed { detail: String },
    /// Orphan sweep after a supervisor restart.
    SupervisorRestart,
}

impl StopReason {
    /// The terminal state this reason maps to.
    pub fn terminal_state(&self) -> JobState {
        match self {
            StopReason::Requested { .. } => JobState::Stopped,
            StopReason::MemoryLimit { .. }
            | StopReason::CpuLimit { .. }
            | StopReason::Timeout { .. } => JobState::Killed,
            StopReason::Exited { code, signal } => {
                if *code == Some(0) && signal.is_none() {
                    JobState::Completed
                } else {
                    JobState::Crashed
                }
            }
            StopReason::CompileError { .. } => JobState::CompileFailed,
            StopReason::SpawnFailed { .. } | StopReason::SupervisorRestart => JobState::Crashed,
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Requested { by } => write!(f, "stopped by user {by}"),
            StopReason::MemoryLimit {
                rss_bytes,
                limit_bytes,
            } => write!(f, "memory limit exceeded ({rss_bytes} > {limit_bytes} bytes)"),
            StopReason::CpuLimit {
                percent,
                limit_percent,
            } => write!(f, "cpu limit exceeded ({percent:.1}% > {limit_percent:.1}%)"),
            StopReason::Timeout { limit_secs } => {
                write!(f, "runtime limit exceeded ({limit_secs}s)")
            }
            StopReason::Exited { code, signal } => match (code, signal) {
                (Some(c), _) => write!(f, "exited with code {c}"),
                (None, Some(s)) => write!(f, "terminated by signal {s}"),
                (None, None) => write!(f, "exited"),
            },
            StopReason::CompileError { code, timed_out } => {
                if *timed_out {
                    write!(f, "compile step timed out")
                } else {
                    write!(f, "compile step failed (exit {})", code.unwrap_or(-1))
                }
            }
            StopReason::SpawnFailed { detail } => write!(f, "failed to start: {detail}"),
            StopReason::SupervisorRestart => write!(f, "supervisor restarted"),
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Durable record of one job. The `state` field is the single mutable cell,
/// updated exactly on each lifecycle transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub user_id: UserId,
    pub language: String,
    pub source_bytes: u64,
    pub compile_command: Option<String>,
    pub run_command: String,
    pub state: JobState,
    pub reason: Option<StopReason>,
    pub created_seq: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionEvent {
    pub job_id: Uuid,
    pub from: JobState,
    pub to: JobState,
    pub reason: Option<StopReason>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub job_id: Uuid,
    pub at: DateTime<Utc>,
    /// Percent of a single core; a tree spanning cores may exceed 100.
    pub cpu_percent: f64,
    pub rss_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogChunk {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub line: String,
}

/// Per-user bookkeeping. Created on first submission, never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_id: UserId,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub total_jobs: u64,
    pub total_source_bytes: u64,
}

// ---------------------------------------------------------------------------
// Submission
// ---------------------------------------------------------------------------

/// Per-job resource ceiling overrides; `None` falls back to the global
/// defaults from [`crate::config::LimitsConfig`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobLimits {
    pub memory_limit_bytes: Option<u64>,
    pub cpu_limit_percent: Option<f64>,
    pub max_runtime_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Submission {
    pub user_id: UserId,
    /// Declared language; when `None` the toolchain heuristics decide.
    pub language: Option<String>,
    pub source: String,
    pub limits: JobLimits,
}

impl Submission {
    pub fn new(user_id: UserId, language: Option<String>, source: impl Into<String>) -> Self {
        Self {
            user_id,
            language,
            source: source.into(),
            limits: JobLimits::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatScope {
    Global,
    User(UserId),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Statistics {
    pub total_jobs: u64,
    /// Jobs currently in a non-terminal state.
    pub active_jobs: u64,
    pub total_users: u64,
    pub by_state: BTreeMap<String, u64>,
    pub by_language: BTreeMap<String, u64>,
}
