use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::locks::LockRequest;

/// A job instance an agent is currently running.
///
/// The same value travels in the `cluster-start-job` broadcast, so every
/// governor stores an identical copy under the same id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveJob {
    pub id: Uuid,
    pub job_type: String,
    pub agent_name: String,
    pub start: DateTime<Utc>,
    #[serde(default)]
    pub lock_data: Vec<LockRequest>,
    /// Overrides the configured maximum age for this job only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age_ms: Option<u64>,
}

impl ActiveJob {
    pub fn new(
        agent_name: impl Into<String>,
        job_type: impl Into<String>,
        start: DateTime<Utc>,
        lock_data: Vec<LockRequest>,
    ) -> Self {
        Self::with_id(Uuid::new_v4(), agent_name, job_type, start, lock_data)
    }

    pub fn with_id(
        id: Uuid,
        agent_name: impl Into<String>,
        job_type: impl Into<String>,
        start: DateTime<Utc>,
        lock_data: Vec<LockRequest>,
    ) -> Self {
        Self {
            id,
            job_type: job_type.into(),
            agent_name: agent_name.into(),
            start,
            lock_data,
            max_age_ms: None,
        }
    }

    pub fn with_max_age(mut self, max_age_ms: Option<u64>) -> Self {
        self.max_age_ms = max_age_ms;
        self
    }

    /// Milliseconds between the job start and `now`, never negative.
    pub fn age_ms(&self, now: DateTime<Utc>) -> u64 {
        (now - self.start).num_milliseconds().max(0) as u64
    }

    pub fn is_expired(&self, now: DateTime<Utc>, default_max_age_ms: u64) -> bool {
        self.age_ms(now) > self.max_age_ms.unwrap_or(default_max_age_ms)
    }
}
