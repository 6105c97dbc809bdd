use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::NodeConfig;

const SERVER_ID_LEN: usize = 9;

/// Identity record exchanged in the `identify` handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeIdentity {
    pub node_name: String,
    pub node_hostname: String,
    pub node_port: u16,
    pub priority: u32,
    pub server_id: String,
    pub start_up_date: DateTime<Utc>,
    pub is_master: bool,
    /// Seconds since `start_up_date`, computed by the sender.
    #[serde(default)]
    pub uptime: f64,
}

impl NodeIdentity {
    /// A node may be chosen as leader if it already leads or has a non-zero
    /// priority.
    pub fn is_eligible(&self) -> bool {
        self.is_master || self.priority > 0
    }

    pub fn uptime_at(&self, now: DateTime<Utc>) -> f64 {
        (now - self.start_up_date).num_milliseconds().max(0) as f64 / 1000.0
    }
}

/// Total order used to pick a leader, most preferred first:
/// current leader, then higher priority, then earlier start, then smaller
/// server id. Node name breaks any remaining tie so the order is total.
pub fn election_order(a: &NodeIdentity, b: &NodeIdentity) -> Ordering {
    b.is_master
        .cmp(&a.is_master)
        .then_with(|| b.priority.cmp(&a.priority))
        .then_with(|| a.start_up_date.cmp(&b.start_up_date))
        .then_with(|| a.server_id.cmp(&b.server_id))
        .then_with(|| a.node_name.cmp(&b.node_name))
}

pub fn sort_candidates(candidates: &mut [NodeIdentity]) {
    candidates.sort_by(election_order);
}

/// First eligible candidate in election order.
pub fn pick_winner(candidates: &[NodeIdentity]) -> Option<&NodeIdentity> {
    let mut sorted: Vec<&NodeIdentity> = candidates.iter().collect();
    sorted.sort_by(|a, b| election_order(a, b));
    sorted.into_iter().find(|c| c.is_eligible())
}

pub fn generate_server_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SERVER_ID_LEN)
        .map(char::from)
        .collect()
}

/// Mutable view of the local governor: who it is and who it believes leads.
#[derive(Debug, Clone)]
pub struct LocalNode {
    pub node_name: String,
    pub node_hostname: String,
    pub node_port: u16,
    pub priority: u32,
    pub server_id: String,
    pub start_up_date: DateTime<Utc>,
    pub is_master: bool,
    pub current_master: Option<String>,
}

impl LocalNode {
    pub fn new(config: &NodeConfig) -> Self {
        Self {
            node_name: config.node_name.clone(),
            node_hostname: config.hostname.clone(),
            node_port: config.listen_addr.port(),
            priority: config.priority,
            server_id: generate_server_id(),
            start_up_date: Utc::now(),
            is_master: false,
            current_master: None,
        }
    }

    pub fn identify_me(&self) -> NodeIdentity {
        let mut identity = NodeIdentity {
            node_name: self.node_name.clone(),
            node_hostname: self.node_hostname.clone(),
            node_port: self.node_port,
            priority: self.priority,
            server_id: self.server_id.clone(),
            start_up_date: self.start_up_date,
            is_master: self.is_master,
            uptime: 0.0,
        };
        identity.uptime = identity.uptime_at(Utc::now());
        identity
    }

    pub fn become_leader(&mut self) {
        self.is_master = true;
        self.current_master = Some(self.node_name.clone());
    }

    /// Drop to priority 0 and give up leadership. Returns whether this node
    /// was leading.
    pub fn demote(&mut self) -> bool {
        let was_master = self.is_master;
        self.priority = 0;
        self.is_master = false;
        if self.current_master.as_deref() == Some(self.node_name.as_str()) {
            self.current_master = None;
        }
        was_master
    }

    /// Raise priority above the highest priority seen among peers. Returns
    /// whether this node was already leading.
    pub fn promote(&mut self, highest_peer_priority: u32) -> bool {
        if highest_peer_priority >= self.priority {
            self.priority = highest_peer_priority.saturating_add(1);
        }
        self.is_master
    }
}
