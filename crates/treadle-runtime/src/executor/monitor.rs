use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use uuid::Uuid;

use treadle_core::{ProcessStore, Result};

use super::lock;

/// Crash recovery for the executor pool: clears job locks held longer
/// than `max_lock_time + lock_buffer`, making the rows re-acquirable
/// after a worker died mid-execution.
pub struct LockMonitor {
    store: Arc<dyn ProcessStore>,
    max_lock_time: Duration,
    lock_buffer: Duration,
    /// Jobs this executor is currently running; their locks are live.
    inflight: Arc<Mutex<HashMap<Uuid, String>>>,
}

impl LockMonitor {
    pub fn new(
        store: Arc<dyn ProcessStore>,
        max_lock_time: Duration,
        lock_buffer: Duration,
        inflight: Arc<Mutex<HashMap<Uuid, String>>>,
    ) -> Self {
        Self {
            store,
            max_lock_time,
            lock_buffer,
            inflight,
        }
    }

    /// One pass over stuck locks. Returns how many were reclaimed; a
    /// version conflict means another party got there first, which is
    /// fine.
    pub async fn sweep(&self) -> Result<usize> {
        let window = to_chrono(self.max_lock_time + self.lock_buffer);
        let threshold = Utc::now() - window;

        let mut uow = self.store.begin().await?;
        let stuck = uow.jobs_locked_before(threshold).await?;
        if stuck.is_empty() {
            uow.rollback().await?;
            return Ok(0);
        }

        let mut reclaimed = 0;
        for mut job in stuck {
            if lock(&self.inflight).contains_key(&job.id) {
                continue;
            }
            tracing::warn!(
                job = %job.id,
                owner = job.lock_owner.as_deref().unwrap_or("?"),
                "Reclaiming stuck job lock"
            );
            job.lock_owner = None;
            job.lock_time = None;
            uow.save_job(job).await?;
            reclaimed += 1;
        }

        match uow.commit().await {
            Ok(()) => Ok(reclaimed),
            Err(e) if e.is_conflict() => {
                tracing::debug!("Lock sweep lost a race; retrying next interval");
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }
}

fn to_chrono(d: Duration) -> ChronoDuration {
    ChronoDuration::milliseconds(d.as_millis() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use treadle_core::{DelegateRef, Job, JobPayload, DEFAULT_RETRIES};

    fn locked_job(owner: &str, locked_minutes_ago: i64) -> Job {
        let now = Utc::now();
        Job {
            id: Uuid::new_v4(),
            version: 0,
            instance_id: Uuid::new_v4(),
            token: None,
            payload: JobPayload::Action {
                action: DelegateRef::new("noop"),
            },
            due_at: now - ChronoDuration::hours(1),
            retries: DEFAULT_RETRIES,
            exclusive: false,
            exception: None,
            lock_owner: Some(owner.to_string()),
            lock_time: Some(now - ChronoDuration::minutes(locked_minutes_ago)),
            created_at: now,
        }
    }

    #[tokio::test]
    async fn test_sweep_reclaims_stuck_locks() {
        let store = Arc::new(MemoryStore::new());
        let stuck = locked_job("dead:0", 30);
        let fresh = locked_job("alive:1", 1);
        let stuck_id = stuck.id;
        let fresh_id = fresh.id;

        let mut uow = store.begin().await.unwrap();
        uow.save_job(stuck).await.unwrap();
        uow.save_job(fresh).await.unwrap();
        uow.commit().await.unwrap();

        let monitor = LockMonitor::new(
            store.clone(),
            Duration::from_secs(600),
            Duration::from_secs(5),
            Arc::new(Mutex::new(HashMap::new())),
        );
        assert_eq!(monitor.sweep().await.unwrap(), 1);

        let mut uow = store.begin().await.unwrap();
        let reclaimed = uow.load_job(stuck_id).await.unwrap().unwrap();
        assert!(reclaimed.lock_owner.is_none());
        assert!(reclaimed.lock_time.is_none());
        assert!(reclaimed.is_acquirable(Utc::now()));

        let untouched = uow.load_job(fresh_id).await.unwrap().unwrap();
        assert_eq!(untouched.lock_owner.as_deref(), Some("alive:1"));
    }

    #[tokio::test]
    async fn test_sweep_skips_jobs_still_in_flight() {
        let store = Arc::new(MemoryStore::new());
        let running = locked_job("self:0", 30);
        let abandoned = locked_job("dead:1", 30);
        let running_id = running.id;
        let abandoned_id = abandoned.id;

        let mut uow = store.begin().await.unwrap();
        uow.save_job(running).await.unwrap();
        uow.save_job(abandoned).await.unwrap();
        uow.commit().await.unwrap();

        let inflight = Arc::new(Mutex::new(HashMap::new()));
        inflight
            .lock()
            .unwrap()
            .insert(running_id, "self:0".to_string());

        let monitor = LockMonitor::new(
            store.clone(),
            Duration::from_secs(600),
            Duration::from_secs(5),
            inflight,
        );
        assert_eq!(monitor.sweep().await.unwrap(), 1);

        let mut uow = store.begin().await.unwrap();
        let still_running = uow.load_job(running_id).await.unwrap().unwrap();
        assert!(still_running.lock_owner.is_some());
        let freed = uow.load_job(abandoned_id).await.unwrap().unwrap();
        assert!(freed.lock_owner.is_none());
    }

    #[tokio::test]
    async fn test_sweep_with_nothing_stuck_is_a_noop() {
        let store = Arc::new(MemoryStore::new());
        let monitor = LockMonitor::new(
            store.clone(),
            Duration::from_secs(600),
            Duration::from_secs(5),
            Arc::new(Mutex::new(HashMap::new())),
        );
        assert_eq!(monitor.sweep().await.unwrap(), 0);
    }
}
