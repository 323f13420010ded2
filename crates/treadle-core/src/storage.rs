use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::exec::{ProcessInstance, TokenId};
use crate::graph::ProcessDefinition;
use crate::job::Job;

/// Transactional persistence boundary. Every engine step runs inside one
/// unit of work; its writes become visible to other units only at commit.
#[async_trait]
pub trait ProcessStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>>;
}

/// Buffered view over the store for one transaction.
///
/// `commit` applies the buffered writes atomically, bumping each saved
/// row's version; a stale version fails the whole commit with
/// [`crate::error::EngineError::Conflict`] and applies nothing.
#[async_trait]
pub trait UnitOfWork: Send {
    async fn save_definition(&mut self, definition: ProcessDefinition) -> Result<()>;
    async fn load_definition(&mut self, id: Uuid) -> Result<Arc<ProcessDefinition>>;
    /// Highest deployed version under this name, if any.
    async fn latest_definition(&mut self, name: &str) -> Result<Option<Arc<ProcessDefinition>>>;

    async fn save_instance(&mut self, instance: ProcessInstance) -> Result<()>;
    async fn load_instance(&mut self, id: Uuid) -> Result<ProcessInstance>;
    async fn delete_instance(&mut self, id: Uuid) -> Result<()>;

    async fn save_job(&mut self, job: Job) -> Result<()>;
    /// `None` when the row is gone, which callers treat as already done.
    async fn load_job(&mut self, id: Uuid) -> Result<Option<Job>>;
    async fn delete_job(&mut self, id: Uuid) -> Result<()>;

    /// Earliest due job an executor may lock right now.
    async fn first_due_job(&mut self, now: DateTime<Utc>) -> Result<Option<Job>>;
    /// Every exclusive, due, unlocked job of one instance, earliest first.
    async fn exclusive_due_jobs(
        &mut self,
        instance_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>>;
    /// Jobs still locked from before the threshold; the monitor's scan.
    async fn jobs_locked_before(&mut self, threshold: DateTime<Utc>) -> Result<Vec<Job>>;
    /// Due date of the next acquirable job, for idle-wait computation.
    async fn next_due_at(&mut self) -> Result<Option<DateTime<Utc>>>;

    /// Drops pending timers carrying this name on one token.
    async fn delete_timers_by_name(
        &mut self,
        instance_id: Uuid,
        token: TokenId,
        name: &str,
    ) -> Result<()>;
    /// Drops every pending timer owned by one token (token end).
    async fn delete_timers_for_token(&mut self, instance_id: Uuid, token: TokenId) -> Result<()>;
    /// Drops every job of one instance (instance end or cancellation).
    async fn delete_jobs_for_instance(&mut self, instance_id: Uuid) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;
    async fn rollback(self: Box<Self>) -> Result<()>;
}
