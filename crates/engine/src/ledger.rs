use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::config::LimitsConfig;
use crate::error::{EngineError, Result};
use crate::sync::lock;
use crate::types::{
    JobRecord, JobState, LogChunk, ResourceSample, StatScope, Statistics, StopReason,
    TransitionEvent, UserId, UserRecord,
};

/// Bounded per-job output buffer. Oldest lines drop first once either cap
/// is exceeded; a verbose script can never grow retained logs without bound.
#[derive(Debug, Default, Serialize, Deserialize)]
struct LogRing {
    next_seq: u64,
    bytes: usize,
    chunks: VecDeque<LogChunk>,
}

impl LogRing {
    fn push(&mut self, line: String, at: DateTime<Utc>, max_lines: usize, max_bytes: usize) {
        self.bytes += line.len();
        self.chunks.push_back(LogChunk {
            seq: self.next_seq,
            at,
            line,
        });
        self.next_seq += 1;

        while self.chunks.len() > 1 && (self.chunks.len() > max_lines || self.bytes > max_bytes) {
            if let Some(dropped) = self.chunks.pop_front() {
                self.bytes -= dropped.line.len();
            }
        }
    }

    fn tail(&self, max_lines: usize) -> Vec<LogChunk> {
        let skip = self.chunks.len().saturating_sub(max_lines);
        self.chunks.iter().skip(skip).cloned().collect()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Inner {
    next_seq: u64,
    jobs: HashMap<Uuid, JobRecord>,
    transitions: Vec<TransitionEvent>,
    samples: HashMap<Uuid, Vec<ResourceSample>>,
    logs: HashMap<Uuid, LogRing>,
    users: HashMap<UserId, UserRecord>,
}

/// Append-only record of jobs, transitions, log chunks, and resource
/// samples. Historical entries are never mutated; a job's current-state
/// field is the single mutable cell, touched only by `record_transition`.
#[derive(Debug)]
pub struct ExecutionLedger {
    log_max_lines: usize,
    log_max_bytes: usize,
    inner: Mutex<Inner>,
}

impl ExecutionLedger {
    pub fn new(limits: &LimitsConfig) -> Self {
        Self {
            log_max_lines: limits.log_max_lines,
            log_max_bytes: limits.log_max_bytes,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Insert a freshly admitted job (state `Pending`), assigning its
    /// creation sequence number and upserting the owner's user record.
    pub fn record_submission(&self, mut record: JobRecord) {
        let mut inner = lock(&self.inner);
        record.created_seq = inner.next_seq;
        inner.next_seq += 1;

        let now = record.created_at;
        let user = inner
            .users
            .entry(record.user_id)
            .or_insert_with(|| UserRecord {
                user_id: record.user_id,
                first_seen: now,
                last_seen: now,
                total_jobs: 0,
                total_source_bytes: 0,
            });
        user.last_seen = now;
        user.total_jobs += 1;
        user.total_source_bytes += record.source_bytes;

        inner.logs.insert(record.id, LogRing::default());
        inner.jobs.insert(record.id, record);
    }

    /// Apply one state transition. Terminal states are final: attempting to
    /// leave one is an internal error, never silently accepted.
    pub fn record_transition(
        &self,
        job_id: Uuid,
        to: JobState,
        reason: Option<StopReason>,
    ) -> Result<()> {
        let mut inner = lock(&self.inner);
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(EngineError::NotFound(job_id))?;

        let from = job.state;
        if from.is_terminal() {
            return Err(EngineError::Internal(format!(
                "job {job_id} cannot leave terminal state {from}"
            )));
        }

        let now = Utc::now();
        job.state = to;
        if to == JobState::Running {
            job.started_at = Some(now);
        }
        if to.is_terminal() {
            job.finished_at = Some(now);
            job.reason = reason.clone();
        }

        inner.transitions.push(TransitionEvent {
            job_id,
            from,
            to,
            reason,
            at: now,
        });
        Ok(())
    }

    /// Append one captured output line. Unknown ids are tolerated: a drain
    /// task may still be flushing while a purge removes the job.
    pub fn append_log(&self, job_id: Uuid, line: String) {
        let mut inner = lock(&self.inner);
        let (max_lines, max_bytes) = (self.log_max_lines, self.log_max_bytes);
        if let Some(ring) = inner.logs.get_mut(&job_id) {
            ring.push(line, Utc::now(), max_lines, max_bytes);
        }
    }

    /// Most recent `max_lines` captured lines, in emission order.
    pub fn logs_tail(&self, job_id: Uuid, max_lines: usize) -> Result<Vec<LogChunk>> {
        let inner = lock(&self.inner);
        inner
            .logs
            .get(&job_id)
            .map(|ring| ring.tail(max_lines))
            .ok_or(EngineError::NotFound(job_id))
    }

    /// Append a resource sample iff the job is still `Running`. The check
    /// and the append share the ledger lock, so no sample can land after
    /// the terminal transition.
    pub fn append_sample(&self, sample: ResourceSample) -> bool {
        let mut inner = lock(&self.inner);
        let running = matches!(
            inner.jobs.get(&sample.job_id),
            Some(job) if job.state == JobState::Running
        );
        if running {
            inner.samples.entry(sample.job_id).or_default().push(sample);
        }
        running
    }

    pub fn samples(&self, job_id: Uuid) -> Vec<ResourceSample> {
        lock(&self.inner)
            .samples
            .get(&job_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn transitions(&self, job_id: Uuid) -> Vec<TransitionEvent> {
        lock(&self.inner)
            .transitions
            .iter()
            .filter(|t| t.job_id == job_id)
            .cloned()
            .collect()
    }

    pub fn job(&self, job_id: Uuid) -> Option<JobRecord> {
        lock(&self.inner).jobs.get(&job_id).cloned()
    }

    /// All of a user's jobs in creation order.
    pub fn jobs_by_user(&self, user: UserId) -> Vec<JobRecord> {
        let inner = lock(&self.inner);
        let mut jobs: Vec<JobRecord> = inner
            .jobs
            .values()
            .filter(|j| j.user_id == user)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_seq);
        jobs
    }

    pub fn user_record(&self, user: UserId) -> Option<UserRecord> {
        lock(&self.inner).users.get(&user).cloned()
    }

    pub fn statistics(&self, scope: StatScope) -> Statistics {
        let inner = lock(&self.inner);
        let mut by_state: BTreeMap<String, u64> = BTreeMap::new();
        let mut by_language: BTreeMap<String, u64> = BTreeMap::new();
        let mut total_jobs = 0;
        let mut active_jobs = 0;

        let in_scope = |job: &JobRecord| match scope {
            StatScope::Global => true,
            StatScope::User(user) => job.user_id == user,
        };
        for job in inner.jobs.values().filter(|j| in_scope(j)) {
            total_jobs += 1;
            if !job.state.is_terminal() {
                active_jobs += 1;
            }
            *by_state.entry(job.state.to_string()).or_insert(0) += 1;
            *by_language.entry(job.language.clone()).or_insert(0) += 1;
        }

        let total_users = match scope {
            StatScope::Global => inner.users.len() as u64,
            StatScope::User(user) => u64::from(inner.users.contains_key(&user)),
        };

        Statistics {
            total_jobs,
            active_jobs,
            total_users,
            by_state,
            by_language,
        }
    }

    /// Drop terminal jobs (and their samples, logs, and transitions) that
    /// finished before `cutoff`. Live jobs and their writers are untouched.
    pub fn purge_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let mut inner = lock(&self.inner);
        let purged: Vec<Uuid> = inner
            .jobs
            .values()
            .filter(|j| j.state.is_terminal() && j.finished_at.is_some_and(|t| t < cutoff))
            .map(|j| j.id)
            .collect();

        for id in &purged {
            inner.jobs.remove(id);
            inner.samples.remove(id);
            inner.logs.remove(id);
        }
        if !purged.is_empty() {
            inner.transitions.retain(|t| !purged.contains(&t.job_id));
            info!(count = purged.len(), "purged expired job records");
        }
        purged.len()
    }

    /// Restart reconciliation: any record still non-terminal belongs to a
    /// process that no longer exists. Sweep them to `Crashed`.
    pub fn sweep_orphans(&self) -> usize {
        let mut inner = lock(&self.inner);
        let now = Utc::now();
        let mut swept = Vec::new();
        for job in inner.jobs.values_mut() {
            if job.state.is_terminal() {
                continue;
            }
            let from = job.state;
            job.state = JobState::Crashed;
            job.reason = Some(StopReason::SupervisorRestart);
            job.finished_at = Some(now);
            swept.push((job.id, from));
        }
        for (job_id, from) in &swept {
            inner.transitions.push(TransitionEvent {
                job_id: *job_id,
                from: *from,
                to: JobState::Crashed,
                reason: Some(StopReason::SupervisorRestart),
                at: now,
            });
        }
        swept.len()
    }

    /// Write the whole ledger as JSON, atomically (temp file + rename).
    pub fn save_snapshot(&self, path: &Path) -> Result<()> {
        let bytes = {
            let inner = lock(&self.inner);
            serde_json::to_vec(&*inner)
                .map_err(|e| EngineError::Internal(format!("serialize ledger: {e}")))?
        };
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Rehydrate a ledger from a snapshot written by `save_snapshot`.
    pub fn load_snapshot(path: &Path, limits: &LimitsConfig) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let inner: Inner = serde_json::from_slice(&bytes)
            .map_err(|e| EngineError::Internal(format!("parse ledger snapshot: {e}")))?;
        Ok(Self {
            log_max_lines: limits.log_max_lines,
            log_max_bytes: limits.log_max_bytes,
            inner: Mutex::new(inner),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(user: UserId, language: &str) -> JobRecord {
        JobRecord {
            id: Uuid::new_v4(),
            user_id: user,
            language: language.into(),
            source_bytes: 42,
            compile_command: None,
            run_command: "true".into(),
            state: JobState::Pending,
            reason: None,
            created_seq: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    fn ledger() -> ExecutionLedger {
        ExecutionLedger::new(&LimitsConfig::default())
    }

    #[test]
    fn log_ring_drops_oldest_lines_past_the_line_cap() {
        let limits = LimitsConfig {
            log_max_lines: 3,
            ..LimitsConfig::default()
        };
        let ledger = ExecutionLedger::new(&limits);
        let job = record(1, "sh");
        let id = job.id;
        ledger.record_submission(job);

        for i in 0..5 {
            ledger.append_log(id, format!("line {i}"));
        }
        let tail = ledger.logs_tail(id, 10).unwrap();
        let lines: Vec<&str> = tail.iter().map(|c| c.line.as_str()).collect();
        assert_eq!(lines, ["line 2", "line 3", "line 4"]);
        // Sequence numbers keep counting across drops.
        assert_eq!(tail[0].seq, 2);
        assert_eq!(tail[2].seq, 4);
    }

    #[test]
    fn log_ring_enforces_the_byte_cap() {
        let limits = LimitsConfig {
            log_max_lines: 100,
            log_max_bytes: 20,
            ..LimitsConfig::default()
        };
        let ledger = ExecutionLedger::new(&limits);
        let job = record(1, "sh");
        let id = job.id;
        ledger.record_submission(job);

        ledger.append_log(id, "aaaaaaaaaa".into()); // 10 bytes
        ledger.append_log(id, "bbbbbbbbbb".into()); // 10 bytes
        ledger.append_log(id, "cccc".into()); // pushes total past 20
        let tail = ledger.logs_tail(id, 10).unwrap();
        let lines: Vec<&str> = tail.iter().map(|c| c.line.as_str()).collect();
        assert_eq!(lines, ["bbbbbbbbbb", "cccc"]);
    }

    #[test]
    fn tail_returns_at_most_requested_lines_in_order() {
        let ledger = ledger();
        let job = record(1, "sh");
        let id = job.id;
        ledger.record_submission(job);
        for i in 0..10 {
            ledger.append_log(id, format!("line {i}"));
        }
        let tail = ledger.logs_tail(id, 2).unwrap();
        let lines: Vec<&str> = tail.iter().map(|c| c.line.as_str()).collect();
        assert_eq!(lines, ["line 8", "line 9"]);
    }

    #[test]
    fn samples_rejected_once_terminal() {
        let ledger = ledger();
        let job = record(1, "python");
        let id = job.id;
        ledger.record_submission(job);
        ledger.record_transition(id, JobState::Running, None).unwrap();

        assert!(ledger.append_sample(ResourceSample {
            job_id: id,
            at: Utc::now(),
            cpu_percent: 1.0,
            rss_bytes: 100,
        }));

        ledger
            .record_transition(
                id,
                JobState::Stopped,
                Some(StopReason::Requested { by: 1 }),
            )
            .unwrap();

        assert!(!ledger.append_sample(ResourceSample {
            job_id: id,
            at: Utc::now(),
            cpu_percent: 1.0,
            rss_bytes: 100,
        }));
        assert_eq!(ledger.samples(id).len(), 1);
    }

    #[test]
    fn terminal_states_cannot_be_left() {
        let ledger = ledger();
        let job = record(1, "sh");
        let id = job.id;
        ledger.record_submission(job);
        ledger.record_transition(id, JobState::Running, None).unwrap();
        ledger
            .record_transition(id, JobState::Stopped, Some(StopReason::Requested { by: 1 }))
            .unwrap();

        let err = ledger
            .record_transition(id, JobState::Running, None)
            .unwrap_err();
        assert!(matches!(err, EngineError::Internal(_)));
    }

    #[test]
    fn jobs_by_user_preserves_creation_order() {
        let ledger = ledger();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let job = record(5, "sh");
            ids.push(job.id);
            ledger.record_submission(job);
        }
        ledger.record_submission(record(6, "sh"));

        let jobs = ledger.jobs_by_user(5);
        let listed: Vec<Uuid> = jobs.iter().map(|j| j.id).collect();
        assert_eq!(listed, ids);
    }

    #[test]
    fn statistics_count_states_and_languages() {
        let ledger = ledger();
        let running = record(1, "python");
        let running_id = running.id;
        ledger.record_submission(running);
        ledger
            .record_transition(running_id, JobState::Running, None)
            .unwrap();

        let crashed = record(2, "sh");
        let crashed_id = crashed.id;
        ledger.record_submission(crashed);
        ledger
            .record_transition(crashed_id, JobState::Running, None)
            .unwrap();
        ledger
            .record_transition(
                crashed_id,
                JobState::Crashed,
                Some(StopReason::Exited {
                    code: Some(1),
                    signal: None,
                }),
            )
            .unwrap();

        let global = ledger.statistics(StatScope::Global);
        assert_eq!(global.total_jobs, 2);
        assert_eq!(global.active_jobs, 1);
        assert_eq!(global.total_users, 2);
        assert_eq!(global.by_language.get("python"), Some(&1));
        assert_eq!(global.by_state.get("crashed"), Some(&1));

        let user = ledger.statistics(StatScope::User(1));
        assert_eq!(user.total_jobs, 1);
        assert_eq!(user.active_jobs, 1);
    }

    #[test]
    fn purge_removes_only_old_terminal_jobs() {
        let ledger = ledger();
        let old = record(1, "sh");
        let old_id = old.id;
        ledger.record_submission(old);
        ledger.record_transition(old_id, JobState::Running, None).unwrap();
        ledger
            .record_transition(old_id, JobState::Stopped, Some(StopReason::Requested { by: 1 }))
            .unwrap();

        let live = record(1, "sh");
        let live_id = live.id;
        ledger.record_submission(live);
        ledger.record_transition(live_id, JobState::Running, None).unwrap();

        // Nothing is old enough yet.
        assert_eq!(ledger.purge_older_than(Utc::now() - chrono::Duration::hours(1)), 0);

        // The stopped job finished before a future cutoff; the live one survives.
        assert_eq!(ledger.purge_older_than(Utc::now() + chrono::Duration::hours(1)), 1);
        assert!(ledger.job(old_id).is_none());
        assert!(ledger.transitions(old_id).is_empty());
        assert!(ledger.job(live_id).is_some());
    }

    #[test]
    fn sweep_orphans_crashes_non_terminal_jobs() {
        let ledger = ledger();
        let orphan = record(1, "sh");
        let orphan_id = orphan.id;
        ledger.record_submission(orphan);
        ledger
            .record_transition(orphan_id, JobState::Running, None)
            .unwrap();

        let done = record(1, "sh");
        let done_id = done.id;
        ledger.record_submission(done);
        ledger.record_transition(done_id, JobState::Running, None).unwrap();
        ledger
            .record_transition(
                done_id,
                JobState::Completed,
                Some(StopReason::Exited {
                    code: Some(0),
                    signal: None,
                }),
            )
            .unwrap();

        assert_eq!(ledger.sweep_orphans(), 1);
        let swept = ledger.job(orphan_id).unwrap();
        assert_eq!(swept.state, JobState::Crashed);
        assert_eq!(swept.reason, Some(StopReason::SupervisorRestart));
        // Already-terminal records are untouched.
        assert_eq!(ledger.job(done_id).unwrap().state, JobState::Completed);
    }

    #[test]
    fn snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");

        let ledger = ledger();
        let job = record(9, "python");
        let id = job.id;
        ledger.record_submission(job);
        ledger.record_transition(id, JobState::Running, None).unwrap();
        ledger.append_log(id, "hello".into());
        ledger.append_sample(ResourceSample {
            job_id: id,
            at: Utc::now(),
            cpu_percent: 3.5,
            rss_bytes: 1024,
        });
        ledger.save_snapshot(&path).unwrap();

        let loaded = ExecutionLedger::load_snapshot(&path, &LimitsConfig::default()).unwrap();
        let reloaded = loaded.job(id).unwrap();
        assert_eq!(reloaded.state, JobState::Running);
        assert_eq!(loaded.logs_tail(id, 10).unwrap().len(), 1);
        assert_eq!(loaded.samples(id).len(), 1);
        assert_eq!(loaded.user_record(9).unwrap().total_jobs, 1);
    }
}
