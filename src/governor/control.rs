use std::sync::Arc;

use serde::Serialize;

use crate::error::{GovernorError, Result};
use crate::governor::Governor;
use crate::rpc::messages::{GovernorRequest, Reply};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DemoteResult {
    pub demoted: bool,
    pub was_master: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromoteResult {
    pub promoted: bool,
    pub was_master: bool,
}

impl Governor {
    /// Drop this node to priority 0. A leader re-runs the election and, once
    /// someone else is preferred, tells every peer to re-elect.
    pub async fn demote(self: &Arc<Self>) -> Result<DemoteResult> {
        let was_master = self.local.write().await.demote();
        tracing::info!(was_master, "Demoted to priority 0");

        if was_master {
            self.begin_election().await;
            if !self.is_leader().await {
                self.broadcast(GovernorRequest::NotifyMasterDemoted {
                    node_name: self.config.node_name.clone(),
                })
                .await;
            }
        }

        Ok(DemoteResult {
            demoted: true,
            was_master,
        })
    }

    /// Raise this node's priority above every known peer, ask the current
    /// leader to step down, re-elect, and announce the change if it worked.
    pub async fn promote(self: &Arc<Self>) -> Result<PromoteResult> {
        let highest = self.membership.read().await.highest_priority();
        let (was_master, priority) = {
            let mut local = self.local.write().await;
            let was_master = local.promote(highest);
            (was_master, local.priority)
        };
        tracing::info!(priority, was_master, "Promotion requested");

        if was_master {
            return Ok(PromoteResult {
                promoted: true,
                was_master,
            });
        }

        let leader = {
            let membership = self.membership.read().await;
            match membership.flagged_masters() {
                0 => None,
                _ => Some(membership.master_link()?),
            }
        };

        if let Some(link) = leader {
            tracing::info!(leader = %link.addr(), "Asking current leader to step down");
            let reply = link
                .call(GovernorRequest::MasterDemote {
                    requesting_node: self.config.node_name.clone(),
                })
                .await?
                .into_result()?;
            if !matches!(reply, Reply::Ack) {
                return Err(GovernorError::UnexpectedReply(format!(
                    "master-demote answered with {}",
                    reply.kind()
                )));
            }
        }

        self.begin_election().await;
        if self.is_leader().await {
            self.broadcast(GovernorRequest::NotifyMasterPromoted {
                node_name: self.config.node_name.clone(),
            })
            .await;
        }

        Ok(PromoteResult {
            promoted: true,
            was_master,
        })
    }
}
