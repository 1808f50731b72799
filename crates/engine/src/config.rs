use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::toolchain::{LanguageSpec, default_languages};
use crate::types::UserId;

pub(crate) const DEFAULT_MAX_JOBS_PER_USER: usize = 10;
pub(crate) const DEFAULT_MAX_SOURCE_BYTES: u64 = 100_000;
pub(crate) const DEFAULT_MEMORY_LIMIT_BYTES: u64 = 512 * 1024 * 1024;
pub(crate) const DEFAULT_CPU_LIMIT_PERCENT: f64 = 50.0;
pub(crate) const DEFAULT_MAX_RUNTIME_SECS: u64 = 3600;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Per-job working directories (source files, compile artifacts).
    pub jobs_dir: PathBuf,
    pub limits: LimitsConfig,
    pub security: SecurityConfig,
    pub languages: Vec<LanguageSpec>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            jobs_dir: PathBuf::from("jobs"),
            limits: LimitsConfig::default(),
            security: SecurityConfig::default(),
            languages: default_languages(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Concurrent non-terminal jobs per user.
    pub max_jobs_per_user: usize,
    pub max_source_bytes: u64,
    /// Default resident-memory ceiling for a job's process tree.
    pub memory_limit_bytes: u64,
    /// Default CPU ceiling, percent of a single core.
    pub cpu_limit_percent: f64,
    /// Absolute wall-clock runtime limit, measured from `Running` entry.
    pub max_runtime_secs: u64,
    /// Resource Monitor sampling interval.
    pub sample_interval_ms: u64,
    /// Grace period between SIGTERM and SIGKILL.
    pub grace_period_ms: u64,
    /// Retained log ring caps per job.
    pub log_max_lines: usize,
    pub log_max_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_jobs_per_user: DEFAULT_MAX_JOBS_PER_USER,
            max_source_bytes: DEFAULT_MAX_SOURCE_BYTES,
            memory_limit_bytes: DEFAULT_MEMORY_LIMIT_BYTES,
            cpu_limit_percent: DEFAULT_CPU_LIMIT_PERCENT,
            max_runtime_secs: DEFAULT_MAX_RUNTIME_SECS,
            sample_interval_ms: 2000,
            grace_period_ms: 5000,
            log_max_lines: 1000,
            log_max_bytes: 256 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Wrap run commands in the isolation wrapper when it is on PATH.
    pub enable_sandbox: bool,
    /// Empty list admits everyone.
    pub allowed_users: Vec<UserId>,
    /// Admins may stop any job.
    pub admin_users: Vec<UserId>,
    /// Denylisted command tokens, matched on word boundaries in any language.
    pub blocked_commands: Vec<String>,
    /// Denylisted Python module names.
    pub blocked_imports: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enable_sandbox: true,
            allowed_users: Vec::new(),
            admin_users: Vec::new(),
            blocked_commands: [
                "rm", "rmdir", "del", "format", "fdisk", "mkfs", "dd", "wget", "curl", "nc",
                "netcat", "ssh", "sudo", "su", "chmod", "chown", "mount", "umount",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            blocked_imports: ["subprocess", "ctypes", "socket"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}
