use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::Result;
use crate::ledger::ExecutionLedger;
use crate::monitor::ResourceMonitor;
use crate::supervisor::ProcessSupervisor;
use crate::types::{
    JobRecord, LogChunk, StatScope, Statistics, StopReason, Submission, UserId,
};

/// The engine: a Process Supervisor plus its Resource Monitor over a shared
/// Execution Ledger. This is the entire externally reachable surface.
///
/// Must be constructed inside a tokio runtime — the monitor task is spawned
/// at startup.
pub struct Engine {
    supervisor: Arc<ProcessSupervisor>,
    ledger: Arc<ExecutionLedger>,
    monitor: tokio::task::JoinHandle<()>,
    grace_period: Duration,
}

impl Engine {
    /// Start with a fresh ledger.
    pub fn start(config: EngineConfig) -> Result<Self> {
        let ledger = ExecutionLedger::new(&config.limits);
        Self::with_ledger(config, ledger)
    }

    /// Start over an existing (e.g. snapshot-rehydrated) ledger. Callers
    /// restoring after a restart should run `sweep_orphans` on the ledger
    /// first.
    pub fn with_ledger(config: EngineConfig, ledger: ExecutionLedger) -> Result<Self> {
        let interval = Duration::from_millis(config.limits.sample_interval_ms.max(100));
        let grace_period = Duration::from_millis(config.limits.grace_period_ms);
        let ledger = Arc::new(ledger);
        let supervisor = Arc::new(ProcessSupervisor::new(config, Arc::clone(&ledger))?);
        let monitor = ResourceMonitor::new(Arc::clone(&supervisor), Arc::clone(&ledger), interval);
        let monitor = tokio::spawn(monitor.run());
        info!(interval_ms = interval.as_millis() as u64, "engine started");
        Ok(Self {
            supervisor,
            ledger,
            monitor,
            grace_period,
        })
    }

    pub async fn submit(&self, submission: Submission) -> Result<Uuid> {
        self.supervisor.submit(submission).await
    }

    pub fn stop(&self, job_id: Uuid, requested_by: UserId) -> Result<()> {
        self.supervisor.stop(job_id, requested_by)
    }

    pub fn status(&self, job_id: Uuid) -> Result<JobRecord> {
        self.supervisor.status(job_id)
    }

    pub fn list_by_user(&self, user: UserId) -> Vec<JobRecord> {
        self.supervisor.list_by_user(user)
    }

    pub fn logs(&self, job_id: Uuid, max_lines: usize) -> Result<Vec<LogChunk>> {
        self.supervisor.logs(job_id, max_lines)
    }

    pub fn statistics(&self, scope: StatScope) -> Statistics {
        self.ledger.statistics(scope)
    }

    pub fn ledger(&self) -> &ExecutionLedger {
        &self.ledger
    }

    /// Maintenance entry point: drop terminal records older than `cutoff`.
    pub fn purge_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        self.ledger.purge_older_than(cutoff)
    }

    pub fn save_snapshot(&self, path: &Path) -> Result<()> {
        self.ledger.save_snapshot(path)
    }

    /// Drain: kill every live job, wait (bounded) for the tasks to settle
    /// their terminal records, then stop the monitor. Returns the ledger so
    /// callers can write a final snapshot that includes the drain.
    pub async fn shutdown(self) -> Arc<ExecutionLedger> {
        let live = self.supervisor.live_jobs();
        if !live.is_empty() {
            info!(count = live.len(), "terminating running jobs");
            for id in live {
                self.supervisor.request_kill(id, StopReason::SupervisorRestart);
            }
        }
        let deadline = Instant::now() + self.grace_period + Duration::from_secs(5);
        while self.supervisor.live_count() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.monitor.abort();
        info!("engine stopped");
        self.ledger
    }
}
