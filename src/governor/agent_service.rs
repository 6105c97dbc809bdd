use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::governor::Governor;
use crate::rpc::messages::{
    AgentRequest, GovernorRequest, HandleLocksReply, HandleLocksRequest, JobEndRequest, Reply,
};
use crate::state::job::ActiveJob;
use crate::state::locks::{LockRequest, ReleaseStatus};
use crate::state::registry::EndedJob;

/// Outcome of ending a job on this governor.
pub(crate) struct FinishedJob {
    pub ended: EndedJob,
    /// Keys that were released, to be sent along in the end-job broadcast.
    pub released: Vec<LockRequest>,
    pub status: ReleaseStatus,
}

impl Governor {
    /// Handle one request on an agent connection. `session_agent` is the
    /// name the connection identified with, if any.
    pub async fn handle_agent_request(
        self: &Arc<Self>,
        session_agent: Option<&str>,
        request: AgentRequest,
    ) -> Reply {
        match request {
            AgentRequest::Identify { agent_name } => {
                self.register_agent(&agent_name).await;
                Reply::Ack
            }
            AgentRequest::HandleLocks(request) => {
                Reply::Locks(self.handle_locks(session_agent, request).await)
            }
            AgentRequest::RegisterJob {
                job_type,
                agent_name,
            } => {
                self.register_job(&agent_name, &job_type).await;
                Reply::Ack
            }
            AgentRequest::JobEnd(request) => match self.job_end(request).await {
                Ok(status) => Reply::Released(status),
                Err(e) => {
                    tracing::info!(error = %e, "Job end rejected");
                    Reply::error(&e)
                }
            },
        }
    }

    /// Register an agent, announcing it to the cluster the first time.
    pub async fn register_agent(&self, agent_name: &str) {
        let created = self.registry.write().await.register_agent(agent_name);
        if created {
            self.broadcast(GovernorRequest::ClusterIdentifyAgent {
                agent_name: agent_name.to_string(),
            })
            .await;
        }
    }

    pub async fn register_job(&self, agent_name: &str, job_type: &str) {
        let agent_created = {
            let mut registry = self.registry.write().await;
            registry.register_job_type(job_type);
            registry.register_agent_job(agent_name, job_type)
        };
        if agent_created {
            self.broadcast(GovernorRequest::ClusterIdentifyAgent {
                agent_name: agent_name.to_string(),
            })
            .await;
        }
        self.broadcast(GovernorRequest::ClusterRegisterJob {
            agent_name: agent_name.to_string(),
            job_type: job_type.to_string(),
        })
        .await;
    }

    /// Try to take the requested keys and, if allowed, start a job.
    ///
    /// Peer failures while replicating are logged by `broadcast` and never
    /// change the status returned to the agent.
    pub async fn handle_locks(
        &self,
        session_agent: Option<&str>,
        request: HandleLocksRequest,
    ) -> HandleLocksReply {
        let date = request.date.unwrap_or_else(Utc::now);
        let owner = session_agent.unwrap_or(&request.agent_name).to_string();

        let status = self
            .shared
            .write()
            .await
            .apply_locks(&request.lock_data, date, &owner);
        tracing::debug!(
            agent = %owner,
            job_type = %request.job_type,
            ok = status.ok,
            version = status.version,
            "Handled lock request"
        );

        if status.updated {
            self.broadcast(GovernorRequest::ClusterPlaceLocks {
                lock_data: request.lock_data.clone(),
                date,
                agent_name: owner.clone(),
                version: status.version,
            })
            .await;
        }

        let mut id = None;
        if status.ok {
            let job = ActiveJob::new(
                &owner,
                &request.job_type,
                date,
                request.lock_data,
            )
            .with_max_age(request.max_age_ms);
            let (job, agent_created) = self.registry.write().await.start_job(job);
            tracing::info!(job_id = %job.id, agent = %job.agent_name, job_type = %job.job_type, "Job started");

            if agent_created {
                self.broadcast(GovernorRequest::ClusterIdentifyAgent {
                    agent_name: job.agent_name.clone(),
                })
                .await;
            }
            id = Some(job.id);
            self.broadcast(GovernorRequest::ClusterStartJob(job)).await;
        }

        HandleLocksReply { status, id }
    }

    /// End a job reported by an agent. Unknown ids fail with `NotFound`.
    pub async fn job_end(&self, request: JobEndRequest) -> Result<ReleaseStatus> {
        let date = request.date.unwrap_or_else(Utc::now);
        let finished = self
            .finish_job(request.id, date, request.lock_data, false)
            .await?;

        self.broadcast(GovernorRequest::ClusterEndJob {
            id: request.id,
            date,
            agent_name: finished.ended.job.agent_name,
            lock_data: finished.released,
            version: finished.status.version,
            is_timeout: false,
        })
        .await;

        Ok(finished.status)
    }

    /// Remove a job from the registry, record its outcome and release the
    /// keys its agent still holds. `lock_data` overrides the keys recorded
    /// at start.
    pub(crate) async fn finish_job(
        &self,
        id: Uuid,
        date: DateTime<Utc>,
        lock_data: Option<Vec<LockRequest>>,
        is_timeout: bool,
    ) -> Result<FinishedJob> {
        let ended = self.registry.write().await.end_job(&id, date, is_timeout)?;
        let released = lock_data.unwrap_or_else(|| ended.job.lock_data.clone());
        let status = self
            .shared
            .write()
            .await
            .release_locks(&released, &ended.job.agent_name);

        tracing::info!(
            job_id = %id,
            agent = %ended.job.agent_name,
            job_type = %ended.job.job_type,
            duration_ms = ended.duration_ms,
            timed_out = is_timeout,
            version = status.version,
            "Job ended"
        );

        Ok(FinishedJob {
            ended,
            released,
            status,
        })
    }

    /// Called when an agent connection closes.
    pub async fn on_agent_disconnect(&self, agent_name: Option<String>) {
        let Some(agent_name) = agent_name else {
            return;
        };
        tracing::info!(agent = %agent_name, "Agent disconnected");

        if !self.config.release_locks_on_agent_disconnect {
            return;
        }

        let status = self.shared.write().await.clear_agent_locks(&agent_name);
        if status.updated {
            tracing::info!(agent = %agent_name, version = status.version, "Released locks of departed agent");
            self.broadcast(GovernorRequest::ClusterClearAgentLocks {
                agent_name,
                version: status.version,
            })
            .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::state::locks::KeyState;
    use tokio_util::sync::CancellationToken;

    fn lone_governor() -> Arc<Governor> {
        let addr = "127.0.0.1:7400".parse().unwrap();
        Governor::with_links(NodeConfig::new("solo", addr), vec![], CancellationToken::new())
    }

    fn lock_request(agent: &str, keys: Vec<LockRequest>) -> HandleLocksRequest {
        HandleLocksRequest {
            agent_name: agent.to_string(),
            job_type: "build".to_string(),
            lock_data: keys,
            date: None,
            max_age_ms: None,
        }
    }

    #[tokio::test]
    async fn second_agent_is_blocked() {
        let governor = lone_governor();

        let first = governor
            .handle_locks(Some("a1"), lock_request("a1", vec![LockRequest::lock("k")]))
            .await;
        assert!(first.status.ok && first.status.updated);
        assert_eq!(first.status.version, 1);
        assert_eq!(first.status.per_key_state, vec![KeyState::Ok]);
        assert!(first.id.is_some());

        let second = governor
            .handle_locks(Some("a2"), lock_request("a2", vec![LockRequest::lock("k")]))
            .await;
        assert!(!second.status.ok && !second.status.updated);
        assert_eq!(second.status.version, 1);
        assert_eq!(second.status.per_key_state, vec![KeyState::Locked]);
        assert!(second.id.is_none());
    }

    #[tokio::test]
    async fn job_end_releases_recorded_keys() {
        let governor = lone_governor();
        let reply = governor
            .handle_locks(Some("a1"), lock_request("a1", vec![LockRequest::lock("k")]))
            .await;

        let status = governor
            .job_end(JobEndRequest {
                id: reply.id.unwrap(),
                date: None,
                lock_data: None,
            })
            .await
            .unwrap();
        assert!(status.updated);
        assert_eq!(status.version, 2);
        assert!(!governor.shared.read().await.is_locked("k"));
    }

    #[tokio::test]
    async fn unknown_job_end_is_not_found() {
        let governor = lone_governor();
        let reply = governor
            .handle_agent_request(
                Some("a1"),
                AgentRequest::JobEnd(JobEndRequest {
                    id: Uuid::new_v4(),
                    date: None,
                    lock_data: Some(vec![LockRequest::lock("k")]),
                }),
            )
            .await;
        assert!(reply.into_result().unwrap_err().is_not_found());
        assert_eq!(governor.shared.read().await.version, 0);
    }

    #[tokio::test]
    async fn lock_owner_is_the_identified_session() {
        let governor = lone_governor();
        let reply = governor
            .handle_locks(Some("session"), lock_request("payload", vec![LockRequest::lock("k")]))
            .await;
        assert_eq!(governor.shared.read().await.locks["k"].agent, "session");
        let registry = governor.registry.read().await;
        assert_eq!(registry.get_job(&reply.id.unwrap()).unwrap().agent_name, "session");
        assert!(registry.agent("payload").is_none());
        drop(registry);

        governor.on_agent_disconnect(Some("session".to_string())).await;
        assert!(!governor.shared.read().await.is_locked("k"));
    }

    #[tokio::test]
    async fn ending_a_departed_agents_job_keeps_the_new_holder() {
        let governor = lone_governor();
        let orphan = governor
            .handle_locks(Some("a1"), lock_request("a1", vec![LockRequest::lock("k")]))
            .await;
        governor.on_agent_disconnect(Some("a1".to_string())).await;

        let taken = governor
            .handle_locks(Some("a2"), lock_request("a2", vec![LockRequest::lock("k")]))
            .await;
        assert!(taken.status.ok);

        let status = governor
            .job_end(JobEndRequest {
                id: orphan.id.unwrap(),
                date: None,
                lock_data: None,
            })
            .await
            .unwrap();
        assert!(!status.updated);
        assert_eq!(status.version, 3);
        assert_eq!(governor.shared.read().await.locks["k"].agent, "a2");

        let third = governor
            .handle_locks(Some("a3"), lock_request("a3", vec![LockRequest::lock("k")]))
            .await;
        assert!(!third.status.ok);
        assert_eq!(third.status.per_key_state, vec![KeyState::Locked]);
    }

    #[tokio::test]
    async fn disconnect_release_can_be_disabled() {
        let addr = "127.0.0.1:7400".parse().unwrap();
        let mut config = NodeConfig::new("solo", addr);
        config.release_locks_on_agent_disconnect = false;
        let governor = Governor::with_links(config, vec![], CancellationToken::new());

        governor
            .handle_locks(Some("a1"), lock_request("a1", vec![LockRequest::lock("k")]))
            .await;
        governor.on_agent_disconnect(Some("a1".to_string())).await;
        assert!(governor.shared.read().await.is_locked("k"));
    }
}
