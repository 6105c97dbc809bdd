use std::net::SocketAddr;

/// Settings for the leader-only sweep that force-ends stale jobs.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Age after which an active job is considered stale, unless the job
    /// carries its own override.
    pub job_max_age_ms: u64,
    /// Pause between two sweeps.
    pub interval_ms: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            job_max_age_ms: 300_000,
            interval_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Unique name of this governor within the cluster.
    pub node_name: String,
    /// Hostname advertised to peers in the identify handshake.
    pub hostname: String,
    pub listen_addr: SocketAddr,
    /// Address of the HTTP control surface. Disabled when `None`.
    pub api_addr: Option<SocketAddr>,
    pub peers: Vec<PeerConfig>,
    /// Election preference. Higher wins, 0 never leads.
    pub priority: u32,
    /// Delay between startup and the first election.
    pub election_settle_ms: u64,
    /// Debounce before re-electing after the leader disconnects.
    pub reelection_delay_ms: u64,
    /// Pause between reconnect attempts on a dropped peer link.
    pub reconnect_interval_ms: u64,
    pub reaper: ReaperConfig,
    /// Release every lock held by an agent when its connection closes.
    pub release_locks_on_agent_disconnect: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub addr: String, // host:port format, supports both IP and hostnames
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_name: "governor-1".to_string(),
            hostname: "127.0.0.1".to_string(),
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 7400)),
            api_addr: None,
            peers: Vec::new(),
            priority: 1,
            election_settle_ms: 100,
            reelection_delay_ms: 1000,
            reconnect_interval_ms: 500,
            reaper: ReaperConfig::default(),
            release_locks_on_agent_disconnect: true,
        }
    }
}

impl NodeConfig {
    pub fn new(node_name: impl Into<String>, listen_addr: SocketAddr) -> Self {
        Self {
            node_name: node_name.into(),
            hostname: listen_addr.ip().to_string(),
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_peer(mut self, addr: impl Into<String>) -> Self {
        self.peers.push(PeerConfig { addr: addr.into() });
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_api_addr(mut self, addr: SocketAddr) -> Self {
        self.api_addr = Some(addr);
        self
    }

    pub fn with_reaper(mut self, job_max_age_ms: u64, interval_ms: u64) -> Self {
        self.reaper = ReaperConfig {
            job_max_age_ms,
            interval_ms,
        };
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reaper_config_default() {
        let cfg = ReaperConfig::default();
        assert_eq!(cfg.job_max_age_ms, 300_000);
        assert_eq!(cfg.interval_ms, 60_000);
    }

    #[test]
    fn node_config_default() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.node_name, "governor-1");
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:7400");
        assert!(cfg.api_addr.is_none());
        assert!(cfg.peers.is_empty());
        assert_eq!(cfg.priority, 1);
        assert_eq!(cfg.election_settle_ms, 100);
        assert_eq!(cfg.reelection_delay_ms, 1000);
        assert!(cfg.release_locks_on_agent_disconnect);
    }

    #[test]
    fn node_config_new_advertises_listen_ip() {
        let addr: SocketAddr = "10.0.0.1:9000".parse().unwrap();
        let cfg = NodeConfig::new("east", addr);
        assert_eq!(cfg.node_name, "east");
        assert_eq!(cfg.hostname, "10.0.0.1");
        assert_eq!(cfg.listen_addr, addr);
        assert!(cfg.peers.is_empty());
    }

    #[test]
    fn node_config_builders() {
        let api: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let cfg = NodeConfig::default()
            .with_peer("127.0.0.1:7401")
            .with_peer("gov-3.internal:7400")
            .with_priority(5)
            .with_api_addr(api)
            .with_reaper(1_000, 250);

        assert_eq!(
            cfg.peers,
            vec![
                PeerConfig {
                    addr: "127.0.0.1:7401".to_string()
                },
                PeerConfig {
                    addr: "gov-3.internal:7400".to_string()
                },
            ]
        );
        assert_eq!(cfg.priority, 5);
        assert_eq!(cfg.api_addr, Some(api));
        assert_eq!(cfg.reaper.job_max_age_ms, 1_000);
        assert_eq!(cfg.reaper.interval_ms, 250);
    }
}
