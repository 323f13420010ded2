use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use treadle_core::{
    EngineError, Job, ProcessDefinition, ProcessInstance, ProcessStore, Result, TokenId,
    UnitOfWork,
};

/// In-memory store with optimistic versioning. Each unit of work buffers
/// its writes and applies them on commit under one exclusive lock, after
/// validating that every touched row is still at the version it was
/// loaded at. A failed validation applies nothing.
pub struct MemoryStore {
    shared: Arc<RwLock<Shared>>,
}

#[derive(Default)]
struct Shared {
    definitions: HashMap<Uuid, Arc<ProcessDefinition>>,
    instances: HashMap<Uuid, ProcessInstance>,
    jobs: HashMap<Uuid, Job>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(RwLock::new(Shared::default())),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>> {
        Ok(Box::new(MemoryUnitOfWork::new(Arc::clone(&self.shared))))
    }
}

/// One buffered transaction over the shared maps. Reads see the buffer
/// first, then the shared state, so a unit of work observes its own
/// uncommitted writes.
struct MemoryUnitOfWork {
    shared: Arc<RwLock<Shared>>,
    saved_definitions: HashMap<Uuid, Arc<ProcessDefinition>>,
    saved_instances: HashMap<Uuid, ProcessInstance>,
    deleted_instances: HashSet<Uuid>,
    saved_jobs: HashMap<Uuid, Job>,
    deleted_jobs: HashSet<Uuid>,
    job_purges: Vec<JobPurge>,
}

/// Bulk job deletion recorded for commit and replayed over reads.
enum JobPurge {
    TimersByName {
        instance_id: Uuid,
        token: TokenId,
        name: String,
    },
    TimersForToken {
        instance_id: Uuid,
        token: TokenId,
    },
    ForInstance {
        instance_id: Uuid,
    },
}

impl JobPurge {
    fn matches(&self, job: &Job) -> bool {
        match self {
            JobPurge::TimersByName {
                instance_id,
                token,
                name,
            } => {
                job.instance_id == *instance_id
                    && job.token == Some(*token)
                    && job.timer_name() == Some(name.as_str())
            }
            JobPurge::TimersForToken { instance_id, token } => {
                job.instance_id == *instance_id
                    && job.token == Some(*token)
                    && job.timer_name().is_some()
            }
            JobPurge::ForInstance { instance_id } => job.instance_id == *instance_id,
        }
    }
}

impl MemoryUnitOfWork {
    fn new(shared: Arc<RwLock<Shared>>) -> Self {
        Self {
            shared,
            saved_definitions: HashMap::new(),
            saved_instances: HashMap::new(),
            deleted_instances: HashSet::new(),
            saved_jobs: HashMap::new(),
            deleted_jobs: HashSet::new(),
            job_purges: Vec::new(),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Shared> {
        self.shared.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn purge(&mut self, purge: JobPurge) {
        self.saved_jobs.retain(|_, job| !purge.matches(job));
        self.job_purges.push(purge);
    }

    fn stored_job_hidden(&self, job: &Job) -> bool {
        self.deleted_jobs.contains(&job.id)
            || self.saved_jobs.contains_key(&job.id)
            || self.job_purges.iter().any(|p| p.matches(job))
    }

    /// Shared rows with the buffer overlaid, the view queries run over.
    fn visible_jobs(&self, state: &Shared) -> Vec<Job> {
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|job| !self.stored_job_hidden(job))
            .cloned()
            .collect();
        jobs.extend(self.saved_jobs.values().cloned());
        jobs
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn save_definition(&mut self, definition: ProcessDefinition) -> Result<()> {
        self.saved_definitions
            .insert(definition.id, Arc::new(definition));
        Ok(())
    }

    async fn load_definition(&mut self, id: Uuid) -> Result<Arc<ProcessDefinition>> {
        if let Some(definition) = self.saved_definitions.get(&id) {
            return Ok(definition.clone());
        }
        let state = self.read();
        state
            .definitions
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound {
                entity: "definition",
                id: id.to_string(),
            })
    }

    async fn latest_definition(&mut self, name: &str) -> Result<Option<Arc<ProcessDefinition>>> {
        let state = self.read();
        let mut best: Option<Arc<ProcessDefinition>> = None;
        for definition in state
            .definitions
            .values()
            .chain(self.saved_definitions.values())
        {
            if definition.name != name {
                continue;
            }
            if best
                .as_ref()
                .map(|b| definition.version > b.version)
                .unwrap_or(true)
            {
                best = Some(definition.clone());
            }
        }
        Ok(best)
    }

    async fn save_instance(&mut self, instance: ProcessInstance) -> Result<()> {
        self.deleted_instances.remove(&instance.id);
        self.saved_instances.insert(instance.id, instance);
        Ok(())
    }

    async fn load_instance(&mut self, id: Uuid) -> Result<ProcessInstance> {
        if self.deleted_instances.contains(&id) {
            return Err(EngineError::NotFound {
                entity: "instance",
                id: id.to_string(),
            });
        }
        if let Some(instance) = self.saved_instances.get(&id) {
            return Ok(instance.clone());
        }
        let state = self.read();
        state
            .instances
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound {
                entity: "instance",
                id: id.to_string(),
            })
    }

    async fn delete_instance(&mut self, id: Uuid) -> Result<()> {
        self.saved_instances.remove(&id);
        self.deleted_instances.insert(id);
        Ok(())
    }

    async fn save_job(&mut self, job: Job) -> Result<()> {
        self.deleted_jobs.remove(&job.id);
        self.saved_jobs.insert(job.id, job);
        Ok(())
    }

    async fn load_job(&mut self, id: Uuid) -> Result<Option<Job>> {
        if self.deleted_jobs.contains(&id) {
            return Ok(None);
        }
        if let Some(job) = self.saved_jobs.get(&id) {
            return Ok(Some(job.clone()));
        }
        let state = self.read();
        match state.jobs.get(&id) {
            Some(job) if !self.stored_job_hidden(job) => Ok(Some(job.clone())),
            _ => Ok(None),
        }
    }

    async fn delete_job(&mut self, id: Uuid) -> Result<()> {
        self.saved_jobs.remove(&id);
        self.deleted_jobs.insert(id);
        Ok(())
    }

    async fn first_due_job(&mut self, now: DateTime<Utc>) -> Result<Option<Job>> {
        let state = self.read();
        Ok(self
            .visible_jobs(&state)
            .into_iter()
            .filter(|job| job.is_acquirable(now))
            .min_by_key(|job| (job.due_at, job.id)))
    }

    async fn exclusive_due_jobs(
        &mut self,
        instance_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>> {
        let state = self.read();
        let mut jobs: Vec<Job> = self
            .visible_jobs(&state)
            .into_iter()
            .filter(|job| {
                job.exclusive && job.instance_id == instance_id && job.is_acquirable(now)
            })
            .collect();
        jobs.sort_by_key(|job| (job.due_at, job.id));
        Ok(jobs)
    }

    async fn jobs_locked_before(&mut self, threshold: DateTime<Utc>) -> Result<Vec<Job>> {
        let state = self.read();
        let mut jobs: Vec<Job> = self
            .visible_jobs(&state)
            .into_iter()
            .filter(|job| {
                job.is_locked() && job.lock_time.map(|t| t < threshold).unwrap_or(false)
            })
            .collect();
        jobs.sort_by_key(|job| (job.lock_time, job.id));
        Ok(jobs)
    }

    async fn next_due_at(&mut self) -> Result<Option<DateTime<Utc>>> {
        let state = self.read();
        Ok(self
            .visible_jobs(&state)
            .into_iter()
            .filter(|job| !job.is_locked() && job.retries > 0)
            .map(|job| job.due_at)
            .min())
    }

    async fn delete_timers_by_name(
        &mut self,
        instance_id: Uuid,
        token: TokenId,
        name: &str,
    ) -> Result<()> {
        self.purge(JobPurge::TimersByName {
            instance_id,
            token,
            name: name.to_string(),
        });
        Ok(())
    }

    async fn delete_timers_for_token(&mut self, instance_id: Uuid, token: TokenId) -> Result<()> {
        self.purge(JobPurge::TimersForToken { instance_id, token });
        Ok(())
    }

    async fn delete_jobs_for_instance(&mut self, instance_id: Uuid) -> Result<()> {
        self.purge(JobPurge::ForInstance { instance_id });
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryUnitOfWork {
            shared,
            saved_definitions,
            saved_instances,
            deleted_instances,
            saved_jobs,
            deleted_jobs,
            job_purges,
        } = *self;
        let mut state = shared.write().unwrap_or_else(PoisonError::into_inner);

        // Validate every buffered save before applying anything. Rows are
        // created at version 0 and commit always bumps, so a version 0 save
        // is an insert and anything else must match the stored version.
        for instance in saved_instances.values() {
            let stale = match state.instances.get(&instance.id) {
                Some(stored) => stored.version != instance.version,
                None => instance.version != 0,
            };
            if stale {
                return Err(EngineError::Conflict {
                    entity: "instance",
                    id: instance.id.to_string(),
                });
            }
        }
        for job in saved_jobs.values() {
            let stale = match state.jobs.get(&job.id) {
                Some(stored) => stored.version != job.version,
                None => job.version != 0,
            };
            if stale {
                return Err(EngineError::Conflict {
                    entity: "job",
                    id: job.id.to_string(),
                });
            }
        }

        for purge in &job_purges {
            state.jobs.retain(|_, job| !purge.matches(job));
        }
        for id in &deleted_jobs {
            state.jobs.remove(id);
        }
        for id in &deleted_instances {
            state.instances.remove(id);
        }
        for (id, definition) in saved_definitions {
            state.definitions.insert(id, definition);
        }
        for (id, mut instance) in saved_instances {
            instance.version += 1;
            state.instances.insert(id, instance);
        }
        for (id, mut job) in saved_jobs {
            job.version += 1;
            state.jobs.insert(id, job);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
