use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::governor::Governor;
use crate::rpc::messages::GovernorRequest;

impl Governor {
    /// Start the stale-job sweep unless one is already running.
    pub(crate) fn start_reaper(self: &Arc<Self>) {
        if self.reaper_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let governor = self.clone();
        tokio::spawn(async move {
            loop {
                governor.reap_while_leader().await;
                governor.reaper_running.store(false, Ordering::SeqCst);

                // Leadership may have come back between the last check and
                // clearing the flag, in which case nobody else restarted us.
                if governor.shutdown.is_cancelled()
                    || !governor.is_leader().await
                    || governor.reaper_running.swap(true, Ordering::SeqCst)
                {
                    break;
                }
            }
        });
    }

    async fn reap_while_leader(&self) {
        let interval = Duration::from_millis(self.config.reaper.interval_ms);
        tracing::info!(
            max_age_ms = self.config.reaper.job_max_age_ms,
            interval_ms = self.config.reaper.interval_ms,
            "Reaper started"
        );

        loop {
            if self.shutdown.is_cancelled() || !self.is_leader().await {
                tracing::info!("Reaper stopped");
                return;
            }

            let reaped = self.reap_expired().await;
            if !reaped.is_empty() {
                tracing::info!(count = reaped.len(), "Reaped stale jobs");
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => {}
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// One sweep: force-end every active job older than its maximum age and
    /// broadcast each end as a timeout. Returns the ids that were ended.
    pub async fn reap_expired(&self) -> Vec<Uuid> {
        let now = Utc::now();
        let expired = self
            .registry
            .read()
            .await
            .expired_jobs(now, self.config.reaper.job_max_age_ms);

        let mut reaped = Vec::with_capacity(expired.len());
        for job in expired {
            let finished = match self.finish_job(job.id, now, None, true).await {
                Ok(finished) => finished,
                Err(e) => {
                    // Ended by its agent since the scan.
                    tracing::debug!(job_id = %job.id, error = %e, "Skipping job");
                    continue;
                }
            };
            tracing::warn!(
                job_id = %job.id,
                agent = %finished.ended.job.agent_name,
                age_ms = finished.ended.duration_ms,
                "Job exceeded its maximum age"
            );

            self.broadcast(GovernorRequest::ClusterEndJob {
                id: job.id,
                date: now,
                agent_name: finished.ended.job.agent_name.clone(),
                lock_data: finished.released,
                version: finished.status.version,
                is_timeout: true,
            })
            .await;
            reaped.push(job.id);
        }
        reaped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::state::job::ActiveJob;
    use crate::state::locks::LockRequest;
    use chrono::Duration as ChronoDuration;
    use tokio_util::sync::CancellationToken;

    fn governor(max_age_ms: u64) -> Arc<Governor> {
        let addr = "127.0.0.1:7400".parse().unwrap();
        let config = NodeConfig::new("solo", addr).with_reaper(max_age_ms, 20);
        Governor::with_links(config, vec![], CancellationToken::new())
    }

    async fn start_old_job(governor: &Governor, age_ms: i64, max_age: Option<u64>) -> Uuid {
        let start = Utc::now() - ChronoDuration::milliseconds(age_ms);
        let keys = vec![LockRequest::lock(format!("key-{age_ms}"))];
        governor.shared.write().await.apply_locks(&keys, start, "a1");
        let job = ActiveJob::new("a1", "build", start, keys).with_max_age(max_age);
        governor.registry.write().await.start_job(job).0.id
    }

    #[tokio::test]
    async fn sweep_ends_only_stale_jobs_as_timeouts() {
        let governor = governor(1_000);
        let stale = start_old_job(&governor, 5_000, None).await;
        let fresh = start_old_job(&governor, 10, None).await;
        let patient = start_old_job(&governor, 6_000, Some(60_000)).await;

        let reaped = governor.reap_expired().await;
        assert_eq!(reaped, vec![stale]);

        let registry = governor.registry.read().await;
        assert!(registry.get_job(&fresh).is_some());
        assert!(registry.get_job(&patient).is_some());

        let stats = registry.job_type("build").unwrap();
        assert_eq!(stats.timeouts.count(), 1);
        assert_eq!(stats.completion.count(), 0);
        assert!(!governor.shared.read().await.is_locked("key-5000"));
    }

    #[tokio::test]
    async fn timing_out_an_orphaned_job_keeps_the_new_holder() {
        let governor = governor(1_000);
        let orphan = start_old_job(&governor, 5_000, None).await;
        governor.on_agent_disconnect(Some("a1".to_string())).await;
        governor
            .shared
            .write()
            .await
            .apply_locks(&[LockRequest::lock("key-5000")], Utc::now(), "a2");

        assert_eq!(governor.reap_expired().await, vec![orphan]);
        let shared = governor.shared.read().await;
        assert_eq!(shared.locks["key-5000"].agent, "a2");
        assert_eq!(shared.version, 3);
    }

    #[tokio::test]
    async fn reaper_runs_only_while_leader() {
        let governor = governor(50);
        governor.local.write().await.become_leader();
        let id = start_old_job(&governor, 1_000, None).await;

        governor.start_reaper();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while governor.registry.read().await.get_job(&id).is_some() {
            assert!(tokio::time::Instant::now() < deadline, "job was never reaped");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        governor.local.write().await.demote();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!governor.reaper_running.load(Ordering::SeqCst));

        let survivor = start_old_job(&governor, 1_000, None).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(governor.registry.read().await.get_job(&survivor).is_some());
    }
}
