use std::collections::HashMap;
use std::sync::Mutex;

use crate::config::LimitsConfig;
use crate::error::{EngineError, Result};
use crate::sync::lock;
use crate::types::UserId;

/// Per-user admission control: concurrent-job ceiling and source-size cap.
///
/// `reserve` checks and increments under one lock so two racing submissions
/// from the same user can never both squeeze past the last free slot.
#[derive(Debug)]
pub struct QuotaTracker {
    max_jobs_per_user: usize,
    max_source_bytes: u64,
    active: Mutex<HashMap<UserId, usize>>,
}

impl QuotaTracker {
    pub fn new(limits: &LimitsConfig) -> Self {
        Self {
            max_jobs_per_user: limits.max_jobs_per_user,
            max_source_bytes: limits.max_source_bytes,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Admit one submission, counting it against the user's ceiling.
    /// The source-size check happens here, before any toolchain work.
    pub fn reserve(&self, user: UserId, source_bytes: u64) -> Result<()> {
        if source_bytes > self.max_source_bytes {
            return Err(EngineError::QuotaExceeded(format!(
                "script too large ({source_bytes} > {} bytes)",
                self.max_source_bytes
            )));
        }

        let mut active = lock(&self.active);
        let count = active.entry(user).or_insert(0);
        if *count >= self.max_jobs_per_user {
            return Err(EngineError::QuotaExceeded(format!(
                "user {user} already has {count} running scripts (max {})",
                self.max_jobs_per_user
            )));
        }
        *count += 1;
        Ok(())
    }

    /// Release one slot when a job reaches a terminal state.
    pub fn release(&self, user: UserId) {
        let mut active = lock(&self.active);
        if let Some(count) = active.get_mut(&user) {
            *count = count.saturating_sub(1);
        }
    }

    /// Current non-terminal job count for a user.
    pub fn active_jobs(&self, user: UserId) -> usize {
        lock(&self.active).get(&user).copied().unwrap_or(0)
    }
}
