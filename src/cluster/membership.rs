use std::sync::Arc;

use crate::cluster::identity::{sort_candidates, NodeIdentity};
use crate::cluster::link::PeerLink;
use crate::error::{GovernorError, Result};

/// One configured peer: its link and what we last learned about it.
#[derive(Clone)]
pub struct Peer {
    pub link: Arc<dyn PeerLink>,
    pub identity: Option<NodeIdentity>,
    /// Whether this node believes the peer is the current leader.
    pub is_master: bool,
}

impl Peer {
    pub fn name(&self) -> Option<&str> {
        self.identity.as_ref().map(|i| i.node_name.as_str())
    }

    fn advertised_addr(&self) -> Option<String> {
        self.identity
            .as_ref()
            .map(|i| format!("{}:{}", i.node_hostname, i.node_port))
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("addr", &self.link.addr())
            .field("connected", &self.link.is_connected())
            .field("identity", &self.identity)
            .field("is_master", &self.is_master)
            .finish()
    }
}

/// This node's private view of the cluster. Never shared with peers.
#[derive(Debug, Default)]
pub struct ClusterMembership {
    peers: Vec<Peer>,
}

impl ClusterMembership {
    pub fn new(links: Vec<Arc<dyn PeerLink>>) -> Self {
        Self {
            peers: links
                .into_iter()
                .map(|link| Peer {
                    link,
                    identity: None,
                    is_master: false,
                })
                .collect(),
        }
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    pub fn links(&self) -> Vec<Arc<dyn PeerLink>> {
        self.peers.iter().map(|p| p.link.clone()).collect()
    }

    pub fn connected_links(&self) -> Vec<Arc<dyn PeerLink>> {
        self.peers
            .iter()
            .filter(|p| p.link.is_connected())
            .map(|p| p.link.clone())
            .collect()
    }

    /// Store the identity a peer returned on the link dialled at `addr`.
    pub fn record_identity(&mut self, addr: &str, identity: NodeIdentity) -> bool {
        match self.peers.iter().position(|p| p.link.addr() == addr) {
            Some(index) => {
                self.store_identity(index, identity);
                true
            }
            None => false,
        }
    }

    /// Store an identity received on an inbound connection. The matching
    /// outbound peer is found by name, or by the address it advertises.
    pub fn record_inbound_identity(&mut self, identity: NodeIdentity) -> bool {
        let advertised = format!("{}:{}", identity.node_hostname, identity.node_port);
        let index = self
            .peers
            .iter()
            .position(|p| p.name() == Some(identity.node_name.as_str()))
            .or_else(|| {
                self.peers.iter().position(|p| {
                    p.link.addr() == advertised
                        || p.advertised_addr().as_deref() == Some(advertised.as_str())
                })
            });

        match index {
            Some(i) => {
                self.store_identity(i, identity);
                true
            }
            None => false,
        }
    }

    /// A leader claim flags that peer alone. Any other identity leaves the
    /// flags untouched: a reply sent before an `elected` announcement must
    /// not clear the flag that announcement set.
    fn store_identity(&mut self, index: usize, identity: NodeIdentity) {
        if identity.is_master {
            for (i, peer) in self.peers.iter_mut().enumerate() {
                peer.is_master = i == index;
            }
        }
        self.peers[index].identity = Some(identity);
    }

    /// Flag exactly the peer named `name` as leader.
    pub fn mark_master(&mut self, name: &str) {
        for peer in &mut self.peers {
            peer.is_master = peer.name() == Some(name);
        }
    }

    pub fn clear_master_flags(&mut self) {
        for peer in &mut self.peers {
            peer.is_master = false;
        }
    }

    pub fn flagged_masters(&self) -> usize {
        self.peers.iter().filter(|p| p.is_master).count()
    }

    /// Link to the peer flagged as leader. Zero or several flagged peers is
    /// an invariant violation.
    pub fn master_link(&self) -> Result<Arc<dyn PeerLink>> {
        let flagged: Vec<&Peer> = self.peers.iter().filter(|p| p.is_master).collect();
        match flagged.as_slice() {
            [peer] => Ok(peer.link.clone()),
            other => Err(GovernorError::InvariantViolation(format!(
                "expected exactly 1 leader peer, found {}",
                other.len()
            ))),
        }
    }

    /// Highest priority among identified peers, 0 when none is known.
    pub fn highest_priority(&self) -> u32 {
        self.peers
            .iter()
            .filter_map(|p| p.identity.as_ref())
            .map(|i| i.priority)
            .max()
            .unwrap_or(0)
    }

    /// Identities of connected peers plus `me`, in election order.
    pub fn node_list(&self, me: NodeIdentity) -> Vec<NodeIdentity> {
        let mut nodes: Vec<NodeIdentity> = self
            .peers
            .iter()
            .filter(|p| p.link.is_connected())
            .filter_map(|p| {
                p.identity.clone().map(|mut identity| {
                    identity.is_master = p.is_master;
                    identity
                })
            })
            .collect();
        nodes.push(me);
        sort_candidates(&mut nodes);
        nodes
    }
}
