//! Test harness for multi-governor integration tests.
//!
//! Boots governors on ephemeral loopback ports, wires every node to every
//! other one and exposes polling helpers for asserting on converging state.

use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use governor_lite::config::NodeConfig;
use governor_lite::governor::Governor;
use governor_lite::rpc::AgentClient;

/// Node configuration with short timings for faster tests
pub fn test_node_config(node_id: u64, addr: SocketAddr, peers: &[SocketAddr]) -> NodeConfig {
    let mut config = NodeConfig::new(format!("gov-{node_id}"), addr);
    for peer in peers.iter().filter(|p| **p != addr) {
        config = config.with_peer(peer.to_string());
    }
    config.election_settle_ms = 150;
    config.reelection_delay_ms = 200;
    config.reconnect_interval_ms = 100;
    config
}

/// Handle to a running governor
pub struct TestNode {
    pub node_id: u64,
    pub addr: SocketAddr,
    pub governor: Arc<Governor>,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl TestNode {
    pub fn name(&self) -> &str {
        self.governor.node_name()
    }

    pub async fn is_leader(&self) -> bool {
        self.governor.is_leader().await
    }

    pub async fn current_master(&self) -> Option<String> {
        self.governor.current_master().await
    }

    pub async fn version(&self) -> u64 {
        self.governor.shared.read().await.version
    }

    pub async fn is_locked(&self, key: &str) -> bool {
        self.governor.shared.read().await.is_locked(key)
    }

    /// Open an agent connection to this governor.
    pub async fn agent(&self, agent_name: &str) -> AgentClient {
        AgentClient::connect(&self.addr.to_string(), agent_name)
            .await
            .expect("agent should connect")
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.handle.abort();
    }
}

/// Test cluster managing multiple governors
pub struct TestCluster {
    pub nodes: BTreeMap<u64, TestNode>,
}

impl TestCluster {
    /// Create and start a cluster of `num_nodes` governors at priority 1
    pub async fn new(num_nodes: usize) -> Self {
        Self::with_configs(vec![1; num_nodes], |config| config).await
    }

    /// Create a cluster with one governor per entry of `priorities`
    pub async fn with_priorities(priorities: &[u32]) -> Self {
        Self::with_configs(priorities.to_vec(), |config| config).await
    }

    /// Create a cluster, letting `customize` adjust every node's configuration
    /// before it starts.
    pub async fn with_configs<F>(priorities: Vec<u32>, customize: F) -> Self
    where
        F: Fn(NodeConfig) -> NodeConfig,
    {
        // Bind every listener first so all peer addresses are known up front
        let mut listeners = Vec::with_capacity(priorities.len());
        for _ in &priorities {
            let listener = TcpListener::bind("127.0.0.1:0")
                .await
                .expect("bind test listener");
            listeners.push(listener);
        }
        let addrs: Vec<SocketAddr> = listeners
            .iter()
            .map(|l| l.local_addr().expect("listener address"))
            .collect();

        let mut nodes = BTreeMap::new();
        for (i, (listener, priority)) in listeners.into_iter().zip(priorities).enumerate() {
            let node_id = (i + 1) as u64;
            let addr = addrs[i];
            let config = customize(test_node_config(node_id, addr, &addrs).with_priority(priority));
            nodes.insert(node_id, Self::start_node(node_id, config, listener));
        }

        Self { nodes }
    }

    fn start_node(node_id: u64, config: NodeConfig, listener: TcpListener) -> TestNode {
        let addr = config.listen_addr;
        let shutdown = CancellationToken::new();
        let governor = Governor::new(config, shutdown.clone());

        let runner = governor.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = runner.run(listener).await {
                tracing::error!(error = %e, "Governor exited with error");
            }
        });

        TestNode {
            node_id,
            addr,
            governor,
            shutdown,
            handle,
        }
    }

    /// Get a reference to a specific node
    pub fn get_node(&self, node_id: u64) -> Option<&TestNode> {
        self.nodes.get(&node_id)
    }

    /// Get current leader ID
    pub async fn get_leader_id(&self) -> Option<u64> {
        for node in self.nodes.values() {
            if node.is_leader().await {
                return Some(node.node_id);
            }
        }
        None
    }

    pub async fn count_leaders(&self) -> usize {
        let mut count = 0;
        for node in self.nodes.values() {
            if node.is_leader().await {
                count += 1;
            }
        }
        count
    }

    /// Wait until exactly one node leads and every node agrees on it
    pub async fn wait_for_leader(&self, timeout_duration: Duration) -> Option<u64> {
        let settled = wait_for(
            || async {
                let Some(leader) = self.get_leader_id().await else {
                    return false;
                };
                let name = self.nodes[&leader].name().to_string();
                if self.count_leaders().await != 1 {
                    return false;
                }
                for node in self.nodes.values() {
                    if node.current_master().await.as_deref() != Some(name.as_str()) {
                        return false;
                    }
                }
                true
            },
            timeout_duration,
            Duration::from_millis(50),
        )
        .await;

        if settled {
            self.get_leader_id().await
        } else {
            None
        }
    }

    /// Any node other than the leader
    pub async fn follower_id(&self) -> Option<u64> {
        for node in self.nodes.values() {
            if !node.is_leader().await {
                return Some(node.node_id);
            }
        }
        None
    }

    /// Stop a node (simulates a crash). Its sockets close and peers see the
    /// disconnect.
    pub fn shutdown_node(&mut self, node_id: u64) -> bool {
        self.nodes.remove(&node_id).is_some()
    }

    /// Wait until every remaining node reports `version`
    pub async fn wait_for_version(&self, version: u64, timeout_duration: Duration) -> bool {
        wait_for(
            || async {
                for node in self.nodes.values() {
                    if node.version().await != version {
                        return false;
                    }
                }
                true
            },
            timeout_duration,
            Duration::from_millis(25),
        )
        .await
    }

    /// Wait until `key` has the given lock status on every remaining node
    pub async fn wait_for_lock(&self, key: &str, locked: bool, timeout_duration: Duration) -> bool {
        wait_for(
            || async {
                for node in self.nodes.values() {
                    if node.is_locked(key).await != locked {
                        return false;
                    }
                }
                true
            },
            timeout_duration,
            Duration::from_millis(25),
        )
        .await
    }
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
#[allow(dead_code)]
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(50)).await;
    assert!(result, "{}", message);
}
