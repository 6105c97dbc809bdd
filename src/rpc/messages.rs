//! Wire messages for the governor and agent channels.
//!
//! Every message is a JSON value inside a length-delimited frame. Requests
//! and replies are wrapped in [`RequestFrame`] / [`ReplyFrame`] so a reply
//! can be matched to its request by id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cluster::identity::NodeIdentity;
use crate::error::{ErrorCode, GovernorError};
use crate::state::job::ActiveJob;
use crate::state::locks::{LockRequest, LockStatus, ReleaseStatus, SharedLockState};

/// Frame id reserved for the connection hello.
pub const HELLO_FRAME_ID: u64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Governor,
    Agent,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Governor => write!(f, "governor"),
            Channel::Agent => write!(f, "agent"),
        }
    }
}

/// First frame on every connection, selecting the channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    pub channel: Channel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame<T> {
    pub id: u64,
    pub body: T,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyFrame {
    pub id: u64,
    pub body: Reply,
}

/// Governor to governor requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum GovernorRequest {
    Identify(NodeIdentity),
    Elected {
        node_name: String,
    },
    MasterDemote {
        requesting_node: String,
    },
    NotifyMasterDemoted {
        node_name: String,
    },
    NotifyMasterPromoted {
        node_name: String,
    },
    ClusterPlaceLocks {
        #[serde(default)]
        lock_data: Vec<LockRequest>,
        date: DateTime<Utc>,
        agent_name: String,
        version: u64,
    },
    ClusterStartJob(ActiveJob),
    ClusterEndJob {
        id: Uuid,
        date: DateTime<Utc>,
        /// Owner of the job. Only keys it still holds are released.
        agent_name: String,
        #[serde(default)]
        lock_data: Vec<LockRequest>,
        version: u64,
        is_timeout: bool,
    },
    SendSharedState,
    ClusterIdentifyAgent {
        agent_name: String,
    },
    ClusterRegisterJob {
        agent_name: String,
        job_type: String,
    },
    ClusterClearAgentLocks {
        agent_name: String,
        version: u64,
    },
}

impl GovernorRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            GovernorRequest::Identify(_) => "identify",
            GovernorRequest::Elected { .. } => "elected",
            GovernorRequest::MasterDemote { .. } => "master-demote",
            GovernorRequest::NotifyMasterDemoted { .. } => "notify-master-demoted",
            GovernorRequest::NotifyMasterPromoted { .. } => "notify-master-promoted",
            GovernorRequest::ClusterPlaceLocks { .. } => "cluster-place-locks",
            GovernorRequest::ClusterStartJob(_) => "cluster-start-job",
            GovernorRequest::ClusterEndJob { .. } => "cluster-end-job",
            GovernorRequest::SendSharedState => "send-shared-state",
            GovernorRequest::ClusterIdentifyAgent { .. } => "cluster-identify-agent",
            GovernorRequest::ClusterRegisterJob { .. } => "cluster-register-job",
            GovernorRequest::ClusterClearAgentLocks { .. } => "cluster-clear-agent-locks",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandleLocksRequest {
    pub agent_name: String,
    pub job_type: String,
    #[serde(default)]
    pub lock_data: Vec<LockRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEndRequest {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<DateTime<Utc>>,
    /// Keys to release. Defaults to the keys recorded when the job started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_data: Option<Vec<LockRequest>>,
}

/// Agent to governor requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum AgentRequest {
    Identify { agent_name: String },
    HandleLocks(HandleLocksRequest),
    RegisterJob { job_type: String, agent_name: String },
    JobEnd(JobEndRequest),
}

impl AgentRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            AgentRequest::Identify { .. } => "identify",
            AgentRequest::HandleLocks(_) => "handle-locks",
            AgentRequest::RegisterJob { .. } => "register-job",
            AgentRequest::JobEnd(_) => "job-end",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleLocksReply {
    #[serde(flatten)]
    pub status: LockStatus,
    /// Id of the started job, present when `ok` is true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub code: ErrorCode,
    pub message: String,
}

impl From<&GovernorError> for ErrorReply {
    fn from(err: &GovernorError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum Reply {
    Ack,
    Identity(NodeIdentity),
    SharedState(SharedLockState),
    Locks(HandleLocksReply),
    Released(ReleaseStatus),
    Error(ErrorReply),
}

impl Reply {
    pub fn error(err: &GovernorError) -> Self {
        Reply::Error(err.into())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Reply::Ack => "ack",
            Reply::Identity(_) => "identity",
            Reply::SharedState(_) => "shared-state",
            Reply::Locks(_) => "locks",
            Reply::Released(_) => "released",
            Reply::Error(_) => "error",
        }
    }

    /// Turn an error reply back into a `GovernorError`.
    pub fn into_result(self) -> Result<Reply, GovernorError> {
        match self {
            Reply::Error(ErrorReply { code, message }) => {
                Err(GovernorError::from_remote(code, message))
            }
            other => Ok(other),
        }
    }
}
