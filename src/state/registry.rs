use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{GovernorError, Result};
use crate::state::job::ActiveJob;
use crate::state::locks::LockRequest;
use crate::state::stats::{JobTypeStats, JobTypeStatsSnapshot};

/// Statistics for one agent, overall and per job type it has run.
#[derive(Debug, Clone)]
pub struct AgentRecord {
    pub name: String,
    pub jobs: BTreeMap<String, JobTypeStats>,
    pub stats: JobTypeStats,
}

impl AgentRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            jobs: BTreeMap::new(),
            stats: JobTypeStats::new(),
        }
    }

    pub fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            name: self.name.clone(),
            stats: self.stats.snapshot(),
            jobs: self
                .jobs
                .iter()
                .map(|(name, stats)| (name.clone(), stats.snapshot()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentSnapshot {
    pub name: String,
    #[serde(flatten)]
    pub stats: JobTypeStatsSnapshot,
    pub jobs: BTreeMap<String, JobTypeStatsSnapshot>,
}

/// Result of ending a job: the removed instance and how long it ran.
#[derive(Debug, Clone)]
pub struct EndedJob {
    pub job: ActiveJob,
    pub duration_ms: u64,
    pub timed_out: bool,
}

/// Agents, job types and active job instances known to one governor.
///
/// All registration calls are idempotent upserts. Stats containers are never
/// removed.
#[derive(Debug, Default)]
pub struct JobRegistry {
    agents: BTreeMap<String, AgentRecord>,
    job_types: BTreeMap<String, JobTypeStats>,
    active_jobs: HashMap<Uuid, ActiveJob>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the agent record if absent. Returns true when it was created,
    /// which is the caller's cue to announce the agent to the cluster.
    pub fn register_agent(&mut self, name: &str) -> bool {
        if self.agents.contains_key(name) {
            return false;
        }
        self.agents.insert(name.to_string(), AgentRecord::new(name));
        tracing::debug!(agent = name, "Agent registered");
        true
    }

    pub fn register_job_type(&mut self, job_type: &str) -> bool {
        if self.job_types.contains_key(job_type) {
            return false;
        }
        self.job_types
            .insert(job_type.to_string(), JobTypeStats::new());
        true
    }

    /// Track that `agent` runs `job_type`. Returns true when the agent record
    /// itself was created by this call.
    pub fn register_agent_job(&mut self, agent: &str, job_type: &str) -> bool {
        let created = self.register_agent(agent);
        if let Some(record) = self.agents.get_mut(agent) {
            record.jobs.entry(job_type.to_string()).or_default();
        }
        created
    }

    /// Put a job into the active set, registering its agent and type first.
    ///
    /// Returns the job and whether the agent was newly created.
    pub fn start_job(&mut self, job: ActiveJob) -> (ActiveJob, bool) {
        let agent_created = self.register_agent_job(&job.agent_name, &job.job_type);
        self.register_job_type(&job.job_type);
        self.active_jobs.insert(job.id, job.clone());
        (job, agent_created)
    }

    /// Remove an active job and record its outcome at agent, job type and
    /// agent × job type granularity.
    pub fn end_job(
        &mut self,
        id: &Uuid,
        timestamp: DateTime<Utc>,
        is_timeout: bool,
    ) -> Result<EndedJob> {
        let job = self
            .active_jobs
            .remove(id)
            .ok_or_else(|| GovernorError::NotFound(format!("no job was found with id {id}")))?;

        let duration_ms = job.age_ms(timestamp);

        let agent = self
            .agents
            .entry(job.agent_name.clone())
            .or_insert_with(|| AgentRecord::new(job.agent_name.clone()));
        let agent_job = agent.jobs.entry(job.job_type.clone()).or_default();
        if is_timeout {
            agent_job.record_timeout();
        } else {
            agent_job.record_completion(duration_ms as f64);
        }

        let targets = [
            &mut agent.stats,
            self.job_types.entry(job.job_type.clone()).or_default(),
        ];
        for stats in targets {
            if is_timeout {
                stats.record_timeout();
            } else {
                stats.record_completion(duration_ms as f64);
            }
        }

        Ok(EndedJob {
            job,
            duration_ms,
            timed_out: is_timeout,
        })
    }

    pub fn get_job(&self, id: &Uuid) -> Option<&ActiveJob> {
        self.active_jobs.get(id)
    }

    /// Active jobs sorted by start time.
    pub fn active_jobs(&self) -> Vec<&ActiveJob> {
        let mut jobs: Vec<&ActiveJob> = self.active_jobs.values().collect();
        jobs.sort_by_key(|j| j.start);
        jobs
    }

    /// Active jobs older than their maximum age at `now`.
    pub fn expired_jobs(&self, now: DateTime<Utc>, default_max_age_ms: u64) -> Vec<ActiveJob> {
        self.active_jobs()
            .into_iter()
            .filter(|job| job.is_expired(now, default_max_age_ms))
            .cloned()
            .collect()
    }

    /// Lock data recorded when the job started, if the job is still active.
    pub fn job_lock_data(&self, id: &Uuid) -> Option<Vec<LockRequest>> {
        self.active_jobs.get(id).map(|job| job.lock_data.clone())
    }

    pub fn agent(&self, name: &str) -> Option<&AgentRecord> {
        self.agents.get(name)
    }

    pub fn agents(&self) -> impl Iterator<Item = &AgentRecord> {
        self.agents.values()
    }

    pub fn job_type(&self, name: &str) -> Option<&JobTypeStats> {
        self.job_types.get(name)
    }

    pub fn job_types(&self) -> impl Iterator<Item = (&String, &JobTypeStats)> {
        self.job_types.iter()
    }

    pub fn active_len(&self) -> usize {
        self.active_jobs.len()
    }
}
