use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{info, trace, warn};
use uuid::Uuid;

use crate::ledger::ExecutionLedger;
use crate::proc::{ProcScan, clock_ticks_per_sec};
use crate::supervisor::{ProcessSupervisor, RunningJob};
use crate::types::{ResourceSample, StopReason};

/// Per-job CPU accounting between ticks.
struct CpuAccount {
    ticks: u64,
    at: Instant,
}

/// Fixed-interval sampler over the set of running jobs.
///
/// Each tick captures one `/proc` scan, walks every job's process tree,
/// appends a `ResourceSample`, and fires the supervisor's kill path on the
/// first sample that breaches a ceiling — hard containment, no hysteresis.
/// Jobs appearing or vanishing between ticks are expected, not errors.
pub(crate) struct ResourceMonitor {
    supervisor: Arc<ProcessSupervisor>,
    ledger: Arc<ExecutionLedger>,
    interval: Duration,
    cpu_accounts: HashMap<Uuid, CpuAccount>,
}

impl ResourceMonitor {
    pub(crate) fn new(
        supervisor: Arc<ProcessSupervisor>,
        ledger: Arc<ExecutionLedger>,
        interval: Duration,
    ) -> Self {
        Self {
            supervisor,
            ledger,
            interval,
            cpu_accounts: HashMap::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.tick();
        }
    }

    fn tick(&mut self) {
        let running = self.supervisor.running_jobs();
        self.cpu_accounts
            .retain(|id, _| running.iter().any(|job| job.id == *id));
        if running.is_empty() {
            return;
        }

        let scan = match ProcScan::capture() {
            Ok(scan) => scan,
            Err(e) => {
                warn!(error = %e, "proc scan failed, skipping tick");
                return;
            }
        };
        let now = Instant::now();

        for job in running {
            // A missing root means the process exited since the snapshot;
            // the supervisor's job task is already reaping it.
            let Some(usage) = scan.tree_usage(job.pid) else {
                continue;
            };
            let cpu_percent = self.cpu_percent(job.id, usage.cpu_ticks, now);
            trace!(
                job_id = %job.id,
                cpu_percent,
                rss_bytes = usage.rss_bytes,
                processes = usage.processes,
                "sampled job"
            );

            let appended = self.ledger.append_sample(ResourceSample {
                job_id: job.id,
                at: Utc::now(),
                cpu_percent,
                rss_bytes: usage.rss_bytes,
            });
            if !appended {
                // Terminal since the snapshot; never sample past that.
                continue;
            }

            if let Some(reason) = breach(&job, cpu_percent, usage.rss_bytes) {
                info!(job_id = %job.id, reason = %reason, "limit breached, killing job");
                self.supervisor.request_kill(job.id, reason);
            }
        }
    }

    /// CPU percent of one core over the window since this job's previous
    /// tick. The first observation establishes the baseline and reads as 0.
    fn cpu_percent(&mut self, id: Uuid, ticks: u64, now: Instant) -> f64 {
        let previous = self.cpu_accounts.insert(id, CpuAccount { ticks, at: now });
        let Some(previous) = previous else {
            return 0.0;
        };
        let elapsed = now.duration_since(previous.at).as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        let cpu_secs = ticks.saturating_sub(previous.ticks) as f64 / clock_ticks_per_sec() as f64;
        cpu_secs / elapsed * 100.0
    }
}

/// First ceiling breached wins; a single bad sample is enough to kill.
fn breach(job: &RunningJob, cpu_percent: f64, rss_bytes: u64) -> Option<StopReason> {
    let limits = &job.limits;
    if rss_bytes > limits.memory_limit_bytes {
        return Some(StopReason::MemoryLimit {
            rss_bytes,
            limit_bytes: limits.memory_limit_bytes,
        });
    }
    if cpu_percent > limits.cpu_limit_percent {
        return Some(StopReason::CpuLimit {
            percent: cpu_percent,
            limit_percent: limits.cpu_limit_percent,
        });
    }
    if job.running_for >= limits.max_runtime {
        return Some(StopReason::Timeout {
            limit_secs: limits.max_runtime.as_secs(),
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::EffectiveLimits;
    use crate::types::JobState;

    fn job(running_for: Duration) -> RunningJob {
        RunningJob {
            id: Uuid::new_v4(),
            pid: 4242,
            running_for,
            limits: EffectiveLimits {
                memory_limit_bytes: 512 * 1024 * 1024,
                cpu_limit_percent: 50.0,
                max_runtime: Duration::from_secs(3600),
            },
        }
    }

    #[test]
    fn within_limits_is_no_breach() {
        let job = job(Duration::from_secs(10));
        assert_eq!(breach(&job, 10.0, 1024 * 1024), None);
    }

    #[test]
    fn memory_breach_beats_cpu_breach() {
        let job = job(Duration::from_secs(10));
        let reason = breach(&job, 99.0, u64::MAX).unwrap();
        assert!(matches!(reason, StopReason::MemoryLimit { .. }));
        assert_eq!(reason.terminal_state(), JobState::Killed);
    }

    #[test]
    fn cpu_breach_is_detected() {
        let job = job(Duration::from_secs(10));
        let reason = breach(&job, 50.1, 1024).unwrap();
        assert!(matches!(
            reason,
            StopReason::CpuLimit { limit_percent, .. } if limit_percent == 50.0
        ));
    }

    #[test]
    fn wall_clock_timeout_is_detected() {
        let job = job(Duration::from_secs(3600));
        let reason = breach(&job, 0.0, 1024).unwrap();
        assert!(matches!(reason, StopReason::Timeout { limit_secs: 3600 }));
    }
}
