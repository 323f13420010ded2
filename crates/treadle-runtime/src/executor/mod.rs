//! Job executor: a pool of worker tasks draining due jobs from the store,
//! plus the lock monitor that recovers locks left behind by dead workers.

mod monitor;

pub use monitor::LockMonitor;

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use treadle_core::{error_chain, Enactment, EngineError, Job, ProcessStore, Result, Services};

use crate::config::ExecutorConfig;
use crate::service::apply_effects;

/// Worker pool executing persisted jobs. Acquisition is serialized across
/// one executor's workers; multiple executor instances coordinate purely
/// through the store's version checks.
pub struct JobExecutor {
    config: ExecutorConfig,
    store: Arc<dyn ProcessStore>,
    services: Arc<Services>,
    wakeup: Arc<Notify>,
    acquire_gate: Mutex<()>,
    /// Jobs currently being executed by this pool, by lock owner.
    inflight: Arc<StdMutex<HashMap<Uuid, String>>>,
    cancel: CancellationToken,
    handles: StdMutex<Vec<JoinHandle<()>>>,
}

impl JobExecutor {
    pub fn new(
        config: ExecutorConfig,
        store: Arc<dyn ProcessStore>,
        services: Arc<Services>,
        wakeup: Arc<Notify>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            services,
            wakeup,
            acquire_gate: Mutex::new(()),
            inflight: Arc::new(StdMutex::new(HashMap::new())),
            cancel: CancellationToken::new(),
            handles: StdMutex::new(Vec::new()),
        })
    }

    /// Spawns the worker loops and the lock monitor loop. A second call is
    /// a no-op while the pool is running.
    pub fn start(self: &Arc<Self>) {
        let mut handles = lock(&self.handles);
        if !handles.is_empty() {
            tracing::debug!(name = %self.config.name, "Executor already started");
            return;
        }
        for idx in 0..self.config.workers {
            let this = Arc::clone(self);
            handles.push(tokio::spawn(async move { this.worker_loop(idx).await }));
        }
        let this = Arc::clone(self);
        handles.push(tokio::spawn(async move { this.monitor_loop().await }));
        tracing::info!(
            name = %self.config.name,
            workers = self.config.workers,
            "Job executor started"
        );
    }

    /// Cooperative shutdown: in-flight jobs finish, idle waits are broken,
    /// and every task is joined.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.wakeup.notify_waiters();
        let handles: Vec<JoinHandle<()>> = lock(&self.handles).drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        tracing::info!(name = %self.config.name, "Job executor stopped");
    }

    async fn worker_loop(&self, idx: usize) {
        let owner = format!("{}:{}", self.config.name, idx);
        let base = self.config.idle_interval();
        let max = self.config.max_idle_interval();
        let mut idle = base;
        tracing::debug!(owner = %owner, "Worker started");
        while !self.cancel.is_cancelled() {
            match self.run_cycle(&owner).await {
                Ok(true) => {
                    idle = base;
                    continue;
                }
                Ok(false) => {
                    idle = base;
                }
                Err(e) => {
                    tracing::warn!(
                        owner = %owner,
                        error = %e,
                        "Executor cycle failed; backing off"
                    );
                    idle = (idle * 2).min(max);
                }
            }
            self.idle_wait(idle).await;
        }
        tracing::debug!(owner = %owner, "Worker stopped");
    }

    async fn monitor_loop(&self) {
        let monitor = LockMonitor::new(
            Arc::clone(&self.store),
            self.config.max_lock_time(),
            self.config.lock_buffer(),
            Arc::clone(&self.inflight),
        );
        let interval = self.config.lock_monitor_interval();
        while !self.cancel.is_cancelled() {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            if let Err(e) = monitor.sweep().await {
                tracing::warn!(error = %e, "Lock monitor sweep failed");
            }
        }
    }

    /// One acquire-execute pass. `Ok(true)` means a batch was executed and
    /// the worker should poll again immediately.
    async fn run_cycle(&self, owner: &str) -> Result<bool> {
        let batch = self.acquire(owner).await?;
        if batch.is_empty() {
            return Ok(false);
        }
        for job in batch {
            let id = job.id;
            lock(&self.inflight).insert(id, owner.to_string());
            let outcome = self.try_execute(&job, owner).await;
            lock(&self.inflight).remove(&id);
            outcome?;
        }
        Ok(true)
    }

    /// Locks the earliest due job, or the whole exclusive batch of its
    /// instance, in one commit. A version conflict here is the expected
    /// race between executors and yields an empty batch.
    async fn acquire(&self, owner: &str) -> Result<Vec<Job>> {
        let _gate = self.acquire_gate.lock().await;
        let mut uow = self.store.begin().await?;
        let now = Utc::now();

        let Some(first) = uow.first_due_job(now).await? else {
            uow.rollback().await?;
            return Ok(Vec::new());
        };
        let mut batch = if first.exclusive {
            uow.exclusive_due_jobs(first.instance_id, now).await?
        } else {
            vec![first]
        };
        for job in &mut batch {
            job.lock_owner = Some(owner.to_string());
            job.lock_time = Some(now);
            uow.save_job(job.clone()).await?;
        }

        match uow.commit().await {
            Ok(()) => {
                tracing::debug!(owner = %owner, count = batch.len(), "Acquired job batch");
                Ok(batch)
            }
            Err(e) if e.is_conflict() => {
                tracing::debug!(owner = %owner, "Job batch already taken; next cycle");
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Runs one job in its own unit of work. A business failure is
    /// captured on the job row (exception text, retry decrement, lock
    /// release) and committed; a store-level failure rolls the whole unit
    /// back and leaves the lock for the monitor.
    async fn try_execute(&self, job: &Job, owner: &str) -> Result<()> {
        let mut uow = self.store.begin().await?;
        let Some(current) = uow.load_job(job.id).await? else {
            tracing::debug!(job = %job.id, "Job row gone; already handled");
            uow.rollback().await?;
            return Ok(());
        };
        if current.lock_owner.as_deref() != Some(owner) {
            tracing::debug!(job = %current.id, "Job lock no longer ours; skipping");
            uow.rollback().await?;
            return Ok(());
        }

        let mut instance = uow.load_instance(current.instance_id).await?;
        let definition = uow.load_definition(instance.definition_id).await?;
        let mut enactment = Enactment::new(&definition, &mut instance, &self.services);
        let outcome = current.execute(&mut enactment);
        let effects = enactment.into_effects();

        match outcome {
            Ok(consumed) => {
                if self.lock_expired(&current, Utc::now()) {
                    uow.rollback().await?;
                    return Err(EngineError::State(format!(
                        "Job {} exceeded the max lock time; rolled back",
                        current.id
                    )));
                }
                apply_effects(&mut *uow, &instance, &effects).await?;
                uow.save_instance(instance).await?;
                if consumed {
                    uow.delete_job(current.id).await?;
                } else {
                    let mut kept = current.clone();
                    kept.lock_owner = None;
                    kept.lock_time = None;
                    uow.save_job(kept).await?;
                }
                uow.commit().await?;
                tracing::debug!(job = %current.id, consumed, "Job executed");
                Ok(())
            }
            Err(e) if e.is_storage_related() => {
                uow.rollback().await?;
                Err(e)
            }
            Err(e) => {
                let mut failed = current.clone();
                failed.exception = Some(error_chain(&e));
                failed.retries = failed.retries.saturating_sub(1);
                failed.lock_owner = None;
                failed.lock_time = None;
                tracing::warn!(
                    job = %failed.id,
                    retries = failed.retries,
                    error = %e,
                    "Job failed; error captured on the row"
                );
                uow.save_job(failed).await?;
                uow.commit().await?;
                Ok(())
            }
        }
    }

    fn lock_expired(&self, job: &Job, now: DateTime<Utc>) -> bool {
        match job.lock_time {
            Some(t) => match (now - t).to_std() {
                Ok(age) => age > self.config.max_lock_time(),
                Err(_) => false,
            },
            None => false,
        }
    }

    /// Sleeps until the next due job or the idle interval, whichever comes
    /// first, woken early by job-creating commits or shutdown.
    async fn idle_wait(&self, idle: Duration) {
        let wait = match self.next_due_delay().await {
            Some(delay) => idle.min(delay),
            None => idle,
        };
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = self.wakeup.notified() => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }

    async fn next_due_delay(&self) -> Option<Duration> {
        let mut uow = self.store.begin().await.ok()?;
        let next = uow.next_due_at().await.ok().flatten();
        let _ = uow.rollback().await;
        let next = next?;
        Some((next - Utc::now()).to_std().unwrap_or(Duration::ZERO))
    }
}

pub(crate) fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
