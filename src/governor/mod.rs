//! The coordinating governor instance.
//!
//! A [`Governor`] owns this process's copy of the cluster view, the shared
//! lock state and the job registry. Requests from peers and agents arrive
//! through [`crate::rpc::server`]; mutations are applied locally first and
//! then broadcast to every connected peer, which re-applies them and pulls a
//! snapshot from the leader when its resulting version disagrees.

mod agent_service;
mod control;
mod peer_service;
mod reaper;

pub use control::{DemoteResult, PromoteResult};

use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::api::{run_api, ApiState};
use crate::cluster::election::{run_election, ElectionOutcome};
use crate::cluster::identity::{LocalNode, NodeIdentity};
use crate::cluster::link::PeerLink;
use crate::cluster::membership::ClusterMembership;
use crate::config::NodeConfig;
use crate::error::{GovernorError, Result};
use crate::rpc::client::TcpPeerClient;
use crate::rpc::messages::{GovernorRequest, Reply};
use crate::rpc::server::serve;
use crate::state::locks::SharedLockState;
use crate::state::registry::JobRegistry;

pub struct Governor {
    pub config: NodeConfig,
    pub local: RwLock<LocalNode>,
    pub membership: RwLock<ClusterMembership>,
    pub shared: RwLock<SharedLockState>,
    pub registry: RwLock<JobRegistry>,
    reaper_running: AtomicBool,
    /// Incremented on every received `elected` message.
    elected_epoch: AtomicU64,
    shutdown: CancellationToken,
}

impl Governor {
    /// Build a governor with one TCP link per configured peer.
    pub fn new(config: NodeConfig, shutdown: CancellationToken) -> Arc<Self> {
        let links: Vec<Arc<dyn PeerLink>> = config
            .peers
            .iter()
            .map(|peer| {
                Arc::new(TcpPeerClient::new(peer.addr.clone(), shutdown.clone()))
                    as Arc<dyn PeerLink>
            })
            .collect();
        Self::with_links(config, links, shutdown)
    }

    pub fn with_links(
        config: NodeConfig,
        links: Vec<Arc<dyn PeerLink>>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            local: RwLock::new(LocalNode::new(&config)),
            membership: RwLock::new(ClusterMembership::new(links)),
            shared: RwLock::new(SharedLockState::new()),
            registry: RwLock::new(JobRegistry::new()),
            reaper_running: AtomicBool::new(false),
            elected_epoch: AtomicU64::new(0),
            shutdown,
            config,
        })
    }

    pub fn node_name(&self) -> &str {
        &self.config.node_name
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn is_leader(&self) -> bool {
        self.local.read().await.is_master
    }

    pub async fn current_master(&self) -> Option<String> {
        self.local.read().await.current_master.clone()
    }

    pub async fn identify_me(&self) -> NodeIdentity {
        self.local.read().await.identify_me()
    }

    /// Run all governor subsystems until the shutdown token fires.
    ///
    /// 1. Serves peer and agent connections on `listener`
    /// 2. Starts the control surface if an API address is configured
    /// 3. Dials every peer once, then keeps each link alive in the background
    /// 4. Runs the first election after the settle delay
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        tracing::info!(
            node = %self.config.node_name,
            addr = %local_addr,
            priority = self.config.priority,
            peers = self.config.peers.len(),
            "Starting governor"
        );

        tokio::spawn(serve(listener, self.clone(), self.shutdown.clone()));

        if let Some(api_addr) = self.config.api_addr {
            let state = ApiState {
                governor: self.clone(),
            };
            tokio::spawn(run_api(api_addr, state, self.shutdown.clone()));
        }

        let links = self.membership.read().await.links();
        join_all(links.iter().map(|link| self.connect_link(link))).await;
        for link in links {
            tokio::spawn(self.clone().maintain_link(link));
        }

        let governor = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = governor.shutdown.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_millis(governor.config.election_settle_ms)) => {}
            }
            governor.begin_election().await;
        });

        self.shutdown.cancelled().await;
        tracing::info!(node = %self.config.node_name, "Governor stopped");
        Ok(())
    }

    /// Dial `link` if it is down and identify on a fresh connection.
    async fn connect_link(&self, link: &Arc<dyn PeerLink>) {
        match link.ensure_connected().await {
            Ok(true) => {
                if let Err(e) = self.identify_peer(link).await {
                    tracing::warn!(peer = %link.addr(), error = %e, "Identify after connect failed");
                }
            }
            Ok(false) => {}
            Err(e) => {
                tracing::debug!(peer = %link.addr(), error = %e, "Peer not reachable");
            }
        }
    }

    async fn maintain_link(self: Arc<Self>, link: Arc<dyn PeerLink>) {
        let interval = Duration::from_millis(self.config.reconnect_interval_ms);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            self.connect_link(&link).await;
        }
    }

    /// Exchange identities with one peer and store the reply.
    pub async fn identify_peer(&self, link: &Arc<dyn PeerLink>) -> Result<NodeIdentity> {
        let me = self.identify_me().await;
        match link.call(GovernorRequest::Identify(me)).await?.into_result()? {
            Reply::Identity(identity) if !identity.node_name.is_empty() => {
                tracing::debug!(peer = %link.addr(), node = %identity.node_name, "Peer identity refreshed");
                self.membership
                    .write()
                    .await
                    .record_identity(link.addr(), identity.clone());
                Ok(identity)
            }
            Reply::Identity(_) => Err(GovernorError::IdentityMismatch(format!(
                "{} sent no node name",
                link.addr()
            ))),
            other => Err(GovernorError::IdentityMismatch(format!(
                "identify answered with {}",
                other.kind()
            ))),
        }
    }

    /// Run one election round and act on its outcome.
    pub async fn begin_election(self: &Arc<Self>) -> ElectionOutcome {
        let me = self.identify_me().await;
        let links = self.membership.read().await.connected_links();
        tracing::info!(node = %me.node_name, peers = links.len(), "Beginning election");

        let round = run_election(me.clone(), &links, &self.elected_epoch).await;
        {
            let mut membership = self.membership.write().await;
            for (addr, identity) in round.identified {
                membership.record_identity(&addr, identity);
            }
        }

        match &round.outcome {
            ElectionOutcome::ExistingLeader(leader) => {
                tracing::info!(leader = %leader, "Found existing leader");
                self.local.write().await.current_master = Some(leader.clone());
                self.membership.write().await.mark_master(leader);
            }
            ElectionOutcome::Follower { winner } => {
                let mut local = self.local.write().await;
                if local.is_master {
                    tracing::warn!(winner = %winner, "Stepping down as leader");
                    local.is_master = false;
                    local.current_master = None;
                }
                tracing::info!(winner = %winner, "Not the leader, waiting for announcement");
            }
            ElectionOutcome::NoCandidate => {
                tracing::warn!("No eligible leader among known nodes");
            }
            ElectionOutcome::Superseded => {
                tracing::debug!("Leader announced during election, discarding round");
            }
            ElectionOutcome::Elected => {
                self.local.write().await.become_leader();
                self.membership.write().await.clear_master_flags();
                tracing::info!(node = %me.node_name, "Elected as leader, notifying cluster");
                self.broadcast(GovernorRequest::Elected {
                    node_name: me.node_name.clone(),
                })
                .await;
                self.start_reaper();
            }
        }

        round.outcome
    }

    /// Send `request` to every connected peer and wait for all replies.
    /// Failures are logged; returns how many peers acknowledged.
    pub async fn broadcast(&self, request: GovernorRequest) -> usize {
        let links = self.membership.read().await.connected_links();
        let kind = request.kind();

        let calls = links.iter().map(|link| {
            let request = request.clone();
            async move {
                let result = link.call(request).await.and_then(Reply::into_result);
                (link.addr(), result)
            }
        });

        let mut acknowledged = 0;
        for (addr, result) in join_all(calls).await {
            match result {
                Ok(_) => acknowledged += 1,
                Err(e) => {
                    tracing::warn!(peer = %addr, request = kind, error = %e, "Broadcast to peer failed");
                }
            }
        }
        tracing::trace!(request = kind, acknowledged, "Broadcast complete");
        acknowledged
    }

    /// Replace the local shared state with the leader's snapshot.
    pub async fn resync(&self, trigger: &str, expected: u64, local: u64) -> Result<()> {
        if self.is_leader().await {
            tracing::warn!(
                trigger,
                expected,
                local,
                "Leader state diverged from a peer broadcast, keeping own state"
            );
            return Ok(());
        }

        tracing::warn!(trigger, expected, local, "Shared state version mismatch, resyncing from leader");
        let link = self.membership.read().await.master_link()?;
        match link.call(GovernorRequest::SendSharedState).await?.into_result()? {
            Reply::SharedState(snapshot) => {
                tracing::info!(leader = %link.addr(), version = snapshot.version, "Shared state resynced");
                self.shared.write().await.replace(snapshot);
                Ok(())
            }
            other => Err(GovernorError::UnexpectedReply(format!(
                "send-shared-state answered with {}",
                other.kind()
            ))),
        }
    }

    /// Called when an inbound governor connection closes.
    pub async fn on_peer_disconnect(self: &Arc<Self>, peer_name: Option<String>) {
        let Some(peer_name) = peer_name else {
            return;
        };

        let was_master = {
            let mut local = self.local.write().await;
            if local.current_master.as_deref() == Some(peer_name.as_str()) {
                local.current_master = None;
                true
            } else {
                false
            }
        };
        tracing::info!(node = %peer_name, new_election = was_master, "Peer disconnected");

        if !was_master {
            return;
        }

        self.membership.write().await.clear_master_flags();
        let governor = self.clone();
        let delay = Duration::from_millis(self.config.reelection_delay_ms);
        tokio::spawn(async move {
            tokio::select! {
                _ = governor.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            tracing::info!("Beginning new election after leader loss");
            governor.begin_election().await;
        });
    }
}
