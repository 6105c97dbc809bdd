//! Agent-facing lock handling and its replication across governors.

mod test_harness;

use std::time::Duration;

use governor_lite::state::{KeyState, LockRequest};
use test_harness::{assert_eventually, TestCluster};
use uuid::Uuid;

const TIMEOUT: Duration = Duration::from_secs(5);

async fn settled_cluster(n: usize) -> (TestCluster, u64, u64) {
    let cluster = TestCluster::new(n).await;
    let leader = cluster.wait_for_leader(TIMEOUT).await.expect("leader");
    let follower = cluster.follower_id().await.expect("follower");
    (cluster, leader, follower)
}

#[tokio::test]
async fn test_second_agent_is_refused_on_another_governor() {
    let (cluster, leader, follower) = settled_cluster(3).await;

    let a1 = cluster.get_node(leader).unwrap().agent("a1").await;
    let first = a1
        .handle_locks("build", vec![LockRequest::lock("k")])
        .await
        .unwrap();
    assert!(first.status.ok);
    assert!(first.status.updated);
    assert_eq!(first.status.per_key_state, vec![KeyState::Ok]);
    assert_eq!(first.status.version, 1);
    assert!(first.id.is_some());

    assert!(cluster.wait_for_lock("k", true, TIMEOUT).await);

    let a2 = cluster.get_node(follower).unwrap().agent("a2").await;
    let second = a2
        .handle_locks("build", vec![LockRequest::lock("k")])
        .await
        .unwrap();
    assert!(!second.status.ok);
    assert!(!second.status.updated);
    assert_eq!(second.status.per_key_state, vec![KeyState::Locked]);
    assert_eq!(second.status.version, 1);
    assert!(second.id.is_none());
}

#[tokio::test]
async fn test_probe_sees_lock_without_taking_it() {
    let (cluster, leader, _) = settled_cluster(2).await;
    let node = cluster.get_node(leader).unwrap();

    let a1 = node.agent("a1").await;
    let probe = a1
        .handle_locks("build", vec![LockRequest::probe("k")])
        .await
        .unwrap();
    assert!(probe.status.ok);
    assert!(!probe.status.updated);
    assert_eq!(probe.status.version, 0);
    assert!(!node.is_locked("k").await);

    a1.handle_locks("build", vec![LockRequest::lock("k")])
        .await
        .unwrap();

    let a2 = node.agent("a2").await;
    let blocked = a2
        .handle_locks("build", vec![LockRequest::probe("k")])
        .await
        .unwrap();
    assert!(!blocked.status.ok);
    assert_eq!(blocked.status.per_key_state, vec![KeyState::Locked]);
}

#[tokio::test]
async fn test_job_end_releases_everywhere_and_records_stats() {
    let (cluster, _, follower) = settled_cluster(3).await;

    let a1 = cluster.get_node(follower).unwrap().agent("a1").await;
    let reply = a1
        .handle_locks("build", vec![LockRequest::lock("k1"), LockRequest::lock("k2")])
        .await
        .unwrap();
    let id = reply.id.expect("job id");
    assert!(cluster.wait_for_version(1, TIMEOUT).await);

    let status = a1.job_end(id, None).await.unwrap();
    assert!(status.updated);
    assert_eq!(status.version, 2);

    assert!(cluster.wait_for_version(2, TIMEOUT).await);
    assert!(cluster.wait_for_lock("k1", false, TIMEOUT).await);
    assert!(cluster.wait_for_lock("k2", false, TIMEOUT).await);

    assert_eventually(
        || async {
            for node in cluster.nodes.values() {
                let registry = node.governor.registry.read().await;
                let done = registry.active_len() == 0
                    && registry
                        .job_type("build")
                        .map(|s| s.completion.count() == 1 && s.timeouts.count() == 0)
                        .unwrap_or(false)
                    && registry
                        .agent("a1")
                        .map(|a| a.jobs.get("build").map(|j| j.completions.count()) == Some(1))
                        .unwrap_or(false);
                if !done {
                    return false;
                }
            }
            true
        },
        TIMEOUT,
        "job end should be recorded on every governor",
    )
    .await;
}

#[tokio::test]
async fn test_unknown_job_end_is_not_found() {
    let (cluster, leader, _) = settled_cluster(2).await;

    let a1 = cluster.get_node(leader).unwrap().agent("a1").await;
    let err = a1.job_end(Uuid::new_v4(), None).await.unwrap_err();
    assert!(err.is_not_found(), "unexpected error {err}");
}

#[tokio::test]
async fn test_diverged_follower_resyncs_from_leader() {
    let (cluster, leader, _) = settled_cluster(3).await;
    let leader_node = cluster.get_node(leader).unwrap();

    leader_node.governor.shared.write().await.version = 10;

    let a1 = leader_node.agent("a1").await;
    let reply = a1
        .handle_locks("build", vec![LockRequest::lock("k")])
        .await
        .unwrap();
    assert_eq!(reply.status.version, 11);

    assert!(
        cluster.wait_for_version(11, TIMEOUT).await,
        "followers should adopt the leader's snapshot"
    );
    assert!(cluster.wait_for_lock("k", true, TIMEOUT).await);
}

#[tokio::test]
async fn test_agent_disconnect_releases_its_locks() {
    let (cluster, _, follower) = settled_cluster(3).await;

    let a1 = cluster.get_node(follower).unwrap().agent("a1").await;
    a1.handle_locks("build", vec![LockRequest::lock("k")])
        .await
        .unwrap();
    assert!(cluster.wait_for_lock("k", true, TIMEOUT).await);

    a1.close();

    assert!(
        cluster.wait_for_lock("k", false, TIMEOUT).await,
        "locks of a departed agent should be released cluster-wide"
    );
    assert!(cluster.wait_for_version(2, TIMEOUT).await);
}

#[tokio::test]
async fn test_ending_departed_agents_job_keeps_new_holder() {
    let (cluster, leader, follower) = settled_cluster(3).await;

    let a1 = cluster.get_node(follower).unwrap().agent("a1").await;
    let orphan = a1
        .handle_locks("build", vec![LockRequest::lock("k")])
        .await
        .unwrap()
        .id
        .expect("job id");
    a1.close();
    assert!(cluster.wait_for_lock("k", false, TIMEOUT).await);
    assert!(cluster.wait_for_version(2, TIMEOUT).await);

    let a2 = cluster.get_node(leader).unwrap().agent("a2").await;
    let taken = a2
        .handle_locks("build", vec![LockRequest::lock("k")])
        .await
        .unwrap();
    assert!(taken.status.ok);
    assert!(cluster.wait_for_version(3, TIMEOUT).await);

    // The departed agent's job is still registered and can be ended
    // through any agent connection.
    let a3 = cluster.get_node(follower).unwrap().agent("a3").await;
    let status = a3.job_end(orphan, None).await.unwrap();
    assert!(!status.updated);
    assert_eq!(status.version, 3);

    assert_eventually(
        || async {
            for node in cluster.nodes.values() {
                let held_by_a2 = node
                    .governor
                    .shared
                    .read()
                    .await
                    .locks
                    .get("k")
                    .map(|entry| entry.agent == "a2")
                    .unwrap_or(false);
                if !held_by_a2 || node.governor.registry.read().await.get_job(&orphan).is_some() {
                    return false;
                }
            }
            true
        },
        TIMEOUT,
        "the key should stay with a2 on every governor",
    )
    .await;

    let refused = a3
        .handle_locks("build", vec![LockRequest::lock("k")])
        .await
        .unwrap();
    assert!(!refused.status.ok);
    assert_eq!(refused.status.per_key_state, vec![KeyState::Locked]);
}

#[tokio::test]
async fn test_concurrent_requests_on_two_governors_converge() {
    let (cluster, leader, follower) = settled_cluster(2).await;

    let a1 = cluster.get_node(leader).unwrap().agent("a1").await;
    let a2 = cluster.get_node(follower).unwrap().agent("a2").await;

    let (first, second) = tokio::join!(
        a1.handle_locks("build", vec![LockRequest::lock("k")]),
        a2.handle_locks("build", vec![LockRequest::lock("k")]),
    );
    let first = first.unwrap();
    let second = second.unwrap();
    assert!(
        first.status.ok || second.status.ok,
        "at least one agent gets the key"
    );

    // Each governor checks its own copy before the other's broadcast lands,
    // so both requests may succeed. Either way a single placement bumps the
    // version on every copy: the replicated one is refused locally.
    let winners: Vec<&str> = [("a1", &first), ("a2", &second)]
        .iter()
        .filter(|(_, reply)| reply.status.ok)
        .map(|(name, _)| *name)
        .collect();
    assert_eq!(first.status.version, 1);
    assert_eq!(second.status.version, 1);
    assert!(cluster.wait_for_version(1, TIMEOUT).await);
    assert!(cluster.wait_for_lock("k", true, TIMEOUT).await);

    // With two winners each copy keeps its own agent as owner, and every
    // governor registers both jobs.
    assert_eventually(
        || async {
            for node in cluster.nodes.values() {
                let owner = node.governor.shared.read().await.locks["k"].agent.clone();
                if !winners.contains(&owner.as_str())
                    || node.governor.registry.read().await.active_len() != winners.len()
                {
                    return false;
                }
            }
            true
        },
        TIMEOUT,
        "every governor should hold a winner's lock and every started job",
    )
    .await;
}

#[tokio::test]
async fn test_register_job_is_replicated() {
    let (cluster, leader, _) = settled_cluster(3).await;

    let a1 = cluster.get_node(leader).unwrap().agent("a1").await;
    a1.register_job("deploy").await.unwrap();

    assert_eventually(
        || async {
            for node in cluster.nodes.values() {
                let registry = node.governor.registry.read().await;
                let known = registry.job_type("deploy").is_some()
                    && registry
                        .agent("a1")
                        .map(|a| a.jobs.contains_key("deploy"))
                        .unwrap_or(false);
                if !known {
                    return false;
                }
            }
            true
        },
        TIMEOUT,
        "job registration should reach every governor",
    )
    .await;
}
