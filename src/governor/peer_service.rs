use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::error::GovernorError;
use crate::governor::Governor;
use crate::rpc::messages::{GovernorRequest, Reply};

impl Governor {
    /// Handle one request from a peer governor and build its reply.
    pub async fn handle_peer_request(self: &Arc<Self>, request: GovernorRequest) -> Reply {
        match request {
            GovernorRequest::Identify(identity) => {
                if identity.node_name.is_empty() {
                    return Reply::error(&GovernorError::IdentityMismatch(
                        "identify without node name".to_string(),
                    ));
                }
                self.membership
                    .write()
                    .await
                    .record_inbound_identity(identity);
                Reply::Identity(self.identify_me().await)
            }

            GovernorRequest::Elected { node_name } => {
                self.elected_epoch.fetch_add(1, Ordering::SeqCst);
                let is_self = {
                    let mut local = self.local.write().await;
                    local.current_master = Some(node_name.clone());
                    let is_self = local.node_name == node_name;
                    if !is_self && local.is_master {
                        tracing::warn!(leader = %node_name, "Another node was elected, stepping down");
                        local.is_master = false;
                    }
                    is_self
                };
                tracing::info!(leader = %node_name, "Identified new leader");
                if !is_self {
                    self.membership.write().await.mark_master(&node_name);
                }
                Reply::Ack
            }

            GovernorRequest::MasterDemote { requesting_node } => {
                let mut local = self.local.write().await;
                if local.is_master {
                    tracing::info!(requesting_node = %requesting_node, "Demoting self on request");
                    local.demote();
                } else {
                    tracing::debug!(requesting_node = %requesting_node, "Not the leader, ignoring demote request");
                }
                Reply::Ack
            }

            GovernorRequest::NotifyMasterDemoted { node_name } => {
                tracing::info!(demoted = %node_name, "Leader demoted, re-electing");
                self.local.write().await.current_master = None;
                self.begin_election().await;
                Reply::Ack
            }

            GovernorRequest::NotifyMasterPromoted { node_name } => {
                tracing::info!(promoted = %node_name, "Leader promoted, re-electing");
                self.local.write().await.current_master = None;
                self.begin_election().await;
                Reply::Ack
            }

            GovernorRequest::ClusterPlaceLocks {
                lock_data,
                date,
                agent_name,
                version,
            } => {
                let status = self
                    .shared
                    .write()
                    .await
                    .apply_locks(&lock_data, date, &agent_name);
                self.check_version("cluster-place-locks", version, status.version)
                    .await
            }

            GovernorRequest::ClusterStartJob(job) => {
                tracing::debug!(job_id = %job.id, agent = %job.agent_name, job_type = %job.job_type, "Replicating job start");
                self.registry.write().await.start_job(job);
                Reply::Ack
            }

            GovernorRequest::ClusterEndJob {
                id,
                date,
                agent_name,
                lock_data,
                version,
                is_timeout,
            } => {
                let ended = self.registry.write().await.end_job(&id, date, is_timeout);
                // Keys are released even when the job is unknown here, so a
                // missed start broadcast does not leave this copy locked.
                let status = self
                    .shared
                    .write()
                    .await
                    .release_locks(&lock_data, &agent_name);
                let reply = self
                    .check_version("cluster-end-job", version, status.version)
                    .await;
                match ended {
                    Ok(ended) => {
                        tracing::debug!(job_id = %id, timed_out = ended.timed_out, "Replicated job end");
                        reply
                    }
                    Err(e) => Reply::error(&e),
                }
            }

            GovernorRequest::SendSharedState => {
                let snapshot = self.shared.read().await.clone();
                tracing::info!(version = snapshot.version, "Serving shared state snapshot");
                Reply::SharedState(snapshot)
            }

            GovernorRequest::ClusterIdentifyAgent { agent_name } => {
                self.registry.write().await.register_agent(&agent_name);
                Reply::Ack
            }

            GovernorRequest::ClusterRegisterJob {
                agent_name,
                job_type,
            } => {
                let mut registry = self.registry.write().await;
                registry.register_job_type(&job_type);
                registry.register_agent_job(&agent_name, &job_type);
                Reply::Ack
            }

            GovernorRequest::ClusterClearAgentLocks {
                agent_name,
                version,
            } => {
                let status = self.shared.write().await.clear_agent_locks(&agent_name);
                self.check_version("cluster-clear-agent-locks", version, status.version)
                    .await
            }
        }
    }

    /// Compare the version a broadcaster reached with ours and resync on
    /// mismatch.
    async fn check_version(&self, trigger: &str, expected: u64, local: u64) -> Reply {
        if expected == local {
            return Reply::Ack;
        }
        match self.resync(trigger, expected, local).await {
            Ok(()) => Reply::Ack,
            Err(e) => {
                tracing::error!(trigger, error = %e, "Resync failed");
                Reply::error(&e)
            }
        }
    }
}
