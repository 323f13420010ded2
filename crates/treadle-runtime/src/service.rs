//! Transactional facade over the core engine. Every operation runs inside
//! one unit of work: load the aggregate, enact, apply the gathered effects
//! to the same transaction, commit.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Notify;
use uuid::Uuid;

use treadle_core::{
    DelegateRef, Effects, Enactment, Job, ProcessDefinition, ProcessInstance, ProcessStore,
    Result, Services, TokenId, UnitOfWork,
};

/// Addresses a token inside one instance: the root, a raw id, or a
/// hierarchical path such as `/b2/c`.
#[derive(Debug, Clone)]
pub enum TokenRef {
    Root,
    Id(TokenId),
    Path(String),
}

impl TokenRef {
    fn resolve(&self, instance: &ProcessInstance) -> Result<TokenId> {
        match self {
            TokenRef::Root => Ok(instance.root),
            TokenRef::Id(id) => instance.token(*id).map(|_| *id),
            TokenRef::Path(path) => instance.resolve(instance.root, path),
        }
    }
}

impl From<TokenId> for TokenRef {
    fn from(id: TokenId) -> Self {
        TokenRef::Id(id)
    }
}

impl From<&str> for TokenRef {
    fn from(path: &str) -> Self {
        TokenRef::Path(path.to_string())
    }
}

/// The engine's public face. Shared happily across tasks; all state lives
/// in the store.
pub struct ProcessEngine {
    store: Arc<dyn ProcessStore>,
    services: Arc<Services>,
    wakeup: Arc<Notify>,
}

impl ProcessEngine {
    pub fn new(store: Arc<dyn ProcessStore>, services: Arc<Services>) -> Self {
        Self {
            store,
            services,
            wakeup: Arc::new(Notify::new()),
        }
    }

    pub fn store(&self) -> Arc<dyn ProcessStore> {
        Arc::clone(&self.store)
    }

    pub fn services(&self) -> Arc<Services> {
        Arc::clone(&self.services)
    }

    /// Wakeup shared with executors: pulsed whenever a commit creates jobs
    /// so idle workers re-check the queue early.
    pub fn wakeup(&self) -> Arc<Notify> {
        Arc::clone(&self.wakeup)
    }

    /// Stores a definition under the next version for its name.
    pub async fn deploy(&self, mut definition: ProcessDefinition) -> Result<Arc<ProcessDefinition>> {
        let mut uow = self.store.begin().await?;
        definition.version = match uow.latest_definition(&definition.name).await? {
            Some(latest) => latest.version + 1,
            None => 1,
        };
        let deployed = Arc::new(definition);
        uow.save_definition((*deployed).clone()).await?;
        uow.commit().await?;
        tracing::info!(
            name = %deployed.name,
            version = deployed.version,
            "Deployed process definition"
        );
        Ok(deployed)
    }

    /// Creates an instance of the definition with its root token placed at
    /// the start node. The first signal moves it.
    pub async fn start_process(&self, definition_id: Uuid) -> Result<Uuid> {
        self.start_process_with(definition_id, Vec::new()).await
    }

    /// As [`Self::start_process`], seeding root-scope variables first.
    pub async fn start_process_with(
        &self,
        definition_id: Uuid,
        variables: Vec<(String, Value)>,
    ) -> Result<Uuid> {
        let mut uow = self.store.begin().await?;
        let definition = uow.load_definition(definition_id).await?;

        let mut instance = ProcessInstance::new(&definition);
        let root = instance.root;
        for (name, value) in variables {
            instance.set_variable(root, &name, value)?;
        }

        let mut enactment = Enactment::new(&definition, &mut instance, &self.services);
        enactment.begin()?;
        let effects = enactment.into_effects();

        let instance_id = instance.id;
        let created_jobs = apply_effects(&mut *uow, &instance, &effects).await?;
        uow.save_instance(instance).await?;
        uow.commit().await?;
        if created_jobs {
            self.wakeup.notify_one();
        }
        tracing::info!(
            instance = %instance_id,
            definition = %definition.name,
            "Started process instance"
        );
        Ok(instance_id)
    }

    /// Starts an instance of the highest deployed version under `name`.
    pub async fn start_latest(&self, name: &str) -> Result<Uuid> {
        let mut uow = self.store.begin().await?;
        let definition =
            uow.latest_definition(name)
                .await?
                .ok_or_else(|| treadle_core::EngineError::NotFound {
                    entity: "definition",
                    id: name.to_string(),
                })?;
        let definition_id = definition.id;
        uow.rollback().await?;
        self.start_process(definition_id).await
    }

    pub async fn signal(&self, instance_id: Uuid, token: impl Into<TokenRef>) -> Result<()> {
        let token = token.into();
        self.with_instance(instance_id, move |enactment| {
            let token_id = token.resolve(enactment.instance())?;
            enactment.signal(token_id)
        })
        .await
    }

    pub async fn signal_named(
        &self,
        instance_id: Uuid,
        token: impl Into<TokenRef>,
        transition: &str,
    ) -> Result<()> {
        let token = token.into();
        self.with_instance(instance_id, move |enactment| {
            let token_id = token.resolve(enactment.instance())?;
            enactment.signal_named(token_id, transition)
        })
        .await
    }

    /// Transitions the token could take right now, in declaration order.
    pub async fn available_transitions(
        &self,
        instance_id: Uuid,
        token: impl Into<TokenRef>,
    ) -> Result<Vec<String>> {
        let token = token.into();
        let mut uow = self.store.begin().await?;
        let mut instance = uow.load_instance(instance_id).await?;
        let definition = uow.load_definition(instance.definition_id).await?;
        let enactment = Enactment::new(&definition, &mut instance, &self.services);
        let token_id = token.resolve(enactment.instance())?;
        let transitions = enactment.available_transitions(token_id)?;
        uow.rollback().await?;
        Ok(transitions)
    }

    pub async fn lock_token(
        &self,
        instance_id: Uuid,
        token: impl Into<TokenRef>,
        owner: &str,
    ) -> Result<()> {
        let token = token.into();
        self.with_instance(instance_id, move |enactment| {
            let token_id = token.resolve(enactment.instance())?;
            enactment.lock(token_id, owner)
        })
        .await
    }

    pub async fn unlock_token(
        &self,
        instance_id: Uuid,
        token: impl Into<TokenRef>,
        owner: &str,
    ) -> Result<()> {
        let token = token.into();
        self.with_instance(instance_id, move |enactment| {
            let token_id = token.resolve(enactment.instance())?;
            enactment.unlock(token_id, owner)
        })
        .await
    }

    /// Ends a token along the natural completion path, auto-completing
    /// ancestors left without live children.
    pub async fn end_token(&self, instance_id: Uuid, token: impl Into<TokenRef>) -> Result<()> {
        let token = token.into();
        self.with_instance(instance_id, move |enactment| {
            let token_id = token.resolve(enactment.instance())?;
            enactment.end_token(token_id)
        })
        .await
    }

    /// Cancels a token and its subtree without arriving at any join.
    pub async fn cancel_token(&self, instance_id: Uuid, token: impl Into<TokenRef>) -> Result<()> {
        let token = token.into();
        self.with_instance(instance_id, move |enactment| {
            let token_id = token.resolve(enactment.instance())?;
            enactment.cancel_token(token_id)
        })
        .await
    }

    pub async fn suspend(&self, instance_id: Uuid) -> Result<()> {
        self.with_instance(instance_id, |enactment| enactment.suspend())
            .await
    }

    pub async fn resume(&self, instance_id: Uuid) -> Result<()> {
        self.with_instance(instance_id, |enactment| enactment.resume())
            .await
    }

    /// Force-ends the whole instance; outstanding jobs are deleted in the
    /// same transaction.
    pub async fn cancel_instance(&self, instance_id: Uuid) -> Result<()> {
        self.with_instance(instance_id, |enactment| enactment.cancel_instance())
            .await
    }

    /// Removes the instance and every job it still owns.
    pub async fn delete_instance(&self, instance_id: Uuid) -> Result<()> {
        let mut uow = self.store.begin().await?;
        uow.load_instance(instance_id).await?;
        uow.delete_jobs_for_instance(instance_id).await?;
        uow.delete_instance(instance_id).await?;
        uow.commit().await?;
        tracing::info!(instance = %instance_id, "Deleted process instance");
        Ok(())
    }

    /// Writes a variable into the closest declaring scope of the token,
    /// falling back to the root scope.
    pub async fn set_variable(
        &self,
        instance_id: Uuid,
        token: impl Into<TokenRef>,
        name: &str,
        value: Value,
    ) -> Result<()> {
        let token = token.into();
        let mut uow = self.store.begin().await?;
        let mut instance = uow.load_instance(instance_id).await?;
        let token_id = token.resolve(&instance)?;
        instance.set_variable(token_id, name, value)?;
        uow.save_instance(instance).await?;
        uow.commit().await?;
        Ok(())
    }

    /// Persists a deferred delegate invocation for the executor to run.
    pub async fn schedule_action(
        &self,
        instance_id: Uuid,
        token: Option<TokenRef>,
        action: DelegateRef,
        delay: Option<std::time::Duration>,
        exclusive: bool,
    ) -> Result<Uuid> {
        let mut uow = self.store.begin().await?;
        let instance = uow.load_instance(instance_id).await?;
        let token_id = match token {
            Some(r) => Some(r.resolve(&instance)?),
            None => None,
        };
        let job = Job::action(&instance, token_id, action, delay, exclusive);
        let job_id = job.id;
        uow.save_job(job).await?;
        uow.commit().await?;
        self.wakeup.notify_one();
        Ok(job_id)
    }

    pub async fn instance(&self, instance_id: Uuid) -> Result<ProcessInstance> {
        let mut uow = self.store.begin().await?;
        let instance = uow.load_instance(instance_id).await?;
        uow.rollback().await?;
        Ok(instance)
    }

    pub async fn definition(&self, definition_id: Uuid) -> Result<Arc<ProcessDefinition>> {
        let mut uow = self.store.begin().await?;
        let definition = uow.load_definition(definition_id).await?;
        uow.rollback().await?;
        Ok(definition)
    }

    /// Shared load-enact-commit skeleton for token and instance operations.
    /// A business failure drops the unit of work with nothing applied.
    async fn with_instance<F>(&self, instance_id: Uuid, op: F) -> Result<()>
    where
        F: FnOnce(&mut Enactment<'_>) -> Result<()>,
    {
        let mut uow = self.store.begin().await?;
        let mut instance = uow.load_instance(instance_id).await?;
        let definition = uow.load_definition(instance.definition_id).await?;

        let mut enactment = Enactment::new(&definition, &mut instance, &self.services);
        op(&mut enactment)?;
        let effects = enactment.into_effects();

        let created_jobs = apply_effects(&mut *uow, &instance, &effects).await?;
        uow.save_instance(instance).await?;
        uow.commit().await?;
        if created_jobs {
            self.wakeup.notify_one();
        }
        Ok(())
    }
}

/// Turns gathered effects into store writes on the open unit of work.
/// Returns whether any job rows were inserted.
pub(crate) async fn apply_effects(
    uow: &mut dyn UnitOfWork,
    instance: &ProcessInstance,
    effects: &Effects,
) -> Result<bool> {
    for (token, name) in &effects.cancelled_timers {
        uow.delete_timers_by_name(instance.id, *token, name).await?;
    }
    for token in &effects.ended_tokens {
        uow.delete_timers_for_token(instance.id, *token).await?;
    }
    if effects.instance_ended {
        uow.delete_jobs_for_instance(instance.id).await?;
        return Ok(false);
    }
    for job in &effects.created_jobs {
        uow.save_job(job.clone()).await?;
    }
    Ok(!effects.created_jobs.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::Utc;
    use serde_json::json;
    use std::time::Duration;
    use treadle_core::{EngineError, ProcessDefinitionBuilder, TimerDef};

    fn engine() -> (ProcessEngine, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let engine = ProcessEngine::new(store.clone(), Arc::new(Services::default()));
        (engine, store)
    }

    fn linear() -> ProcessDefinition {
        ProcessDefinitionBuilder::new("linear")
            .start_node("start")
            .transition_to("one")
            .state("one")
            .transition_to("two")
            .state("two")
            .transition_to("end")
            .end("end")
            .build()
            .unwrap()
    }

    fn forked() -> ProcessDefinition {
        ProcessDefinitionBuilder::new("forked")
            .start_node("start")
            .transition_to("split")
            .fork("split")
            .transition("b", "left")
            .transition("c", "right")
            .state("left")
            .transition_to("meet")
            .state("right")
            .transition_to("meet")
            .join("meet")
            .transition_to("end")
            .end("end")
            .build()
            .unwrap()
    }

    fn timed() -> ProcessDefinition {
        ProcessDefinitionBuilder::new("timed")
            .start_node("start")
            .transition_to("waiting")
            .state("waiting")
            .with_timer(
                TimerDef::new("remind", Duration::from_secs(60)).with_transition("done"),
            )
            .transition("done", "end")
            .end("end")
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_deploy_assigns_increasing_versions() {
        let (engine, _store) = engine();
        let first = engine.deploy(linear()).await.unwrap();
        let second = engine.deploy(linear()).await.unwrap();
        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);

        let started = engine.start_latest("linear").await.unwrap();
        let instance = engine.instance(started).await.unwrap();
        assert_eq!(instance.definition_id, second.id);
    }

    #[tokio::test]
    async fn test_signal_runs_a_linear_instance_to_completion() {
        let (engine, _store) = engine();
        let definition = engine.deploy(linear()).await.unwrap();
        let id = engine.start_process(definition.id).await.unwrap();

        engine.signal(id, TokenRef::Root).await.unwrap();
        engine.signal(id, TokenRef::Root).await.unwrap();
        engine.signal(id, TokenRef::Root).await.unwrap();

        let instance = engine.instance(id).await.unwrap();
        assert!(instance.has_ended());
        // one commit per start + three signals
        assert_eq!(instance.version, 4);

        let err = engine.signal(id, TokenRef::Root).await.unwrap_err();
        assert!(matches!(err, EngineError::State(_)));
    }

    #[tokio::test]
    async fn test_fork_children_are_addressable_by_path() {
        let (engine, _store) = engine();
        let definition = engine.deploy(forked()).await.unwrap();
        let id = engine.start_process(definition.id).await.unwrap();

        engine.signal(id, TokenRef::Root).await.unwrap();

        let offered = engine.available_transitions(id, "/b").await.unwrap();
        assert_eq!(offered.len(), 1);

        engine.signal(id, "/b").await.unwrap();
        engine.signal(id, "/c").await.unwrap();

        let instance = engine.instance(id).await.unwrap();
        assert!(instance.has_ended());
    }

    #[tokio::test]
    async fn test_lock_owner_discipline() {
        let (engine, _store) = engine();
        let definition = engine.deploy(linear()).await.unwrap();
        let id = engine.start_process(definition.id).await.unwrap();
        engine.signal(id, TokenRef::Root).await.unwrap();

        engine.lock_token(id, TokenRef::Root, "alice").await.unwrap();

        let err = engine.signal(id, TokenRef::Root).await.unwrap_err();
        assert!(matches!(err, EngineError::State(_)));
        let err = engine
            .unlock_token(id, TokenRef::Root, "bob")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::State(_)));

        engine.unlock_token(id, TokenRef::Root, "alice").await.unwrap();
        engine.signal(id, TokenRef::Root).await.unwrap();
    }

    #[tokio::test]
    async fn test_suspend_blocks_signals_until_resume() {
        let (engine, _store) = engine();
        let definition = engine.deploy(linear()).await.unwrap();
        let id = engine.start_process(definition.id).await.unwrap();

        engine.suspend(id).await.unwrap();
        let err = engine.signal(id, TokenRef::Root).await.unwrap_err();
        assert!(matches!(err, EngineError::State(_)));

        engine.resume(id).await.unwrap();
        engine.signal(id, TokenRef::Root).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_instance_deletes_outstanding_jobs() {
        let (engine, store) = engine();
        let definition = engine.deploy(timed()).await.unwrap();
        let id = engine.start_process(definition.id).await.unwrap();

        // entering the timed state schedules the reminder job
        engine.signal(id, TokenRef::Root).await.unwrap();
        let mut uow = store.begin().await.unwrap();
        assert!(uow.next_due_at().await.unwrap().is_some());
        uow.rollback().await.unwrap();

        engine.cancel_instance(id).await.unwrap();

        let instance = engine.instance(id).await.unwrap();
        assert!(instance.has_ended());
        let mut uow = store.begin().await.unwrap();
        assert!(uow.next_due_at().await.unwrap().is_none());
        uow.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_instance_removes_rows() {
        let (engine, store) = engine();
        let definition = engine.deploy(timed()).await.unwrap();
        let id = engine.start_process(definition.id).await.unwrap();
        engine.signal(id, TokenRef::Root).await.unwrap();

        engine.delete_instance(id).await.unwrap();

        let err = engine.instance(id).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
        let mut uow = store.begin().await.unwrap();
        assert!(uow.next_due_at().await.unwrap().is_none());
        uow.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_set_variable_is_visible_afterwards() {
        let (engine, _store) = engine();
        let definition = engine.deploy(linear()).await.unwrap();
        let id = engine
            .start_process_with(definition.id, vec![("a".to_string(), json!(1))])
            .await
            .unwrap();

        engine
            .set_variable(id, TokenRef::Root, "a", json!(5))
            .await
            .unwrap();

        let instance = engine.instance(id).await.unwrap();
        assert_eq!(instance.variable(instance.root, "a"), Some(&json!(5)));
    }

    #[tokio::test]
    async fn test_schedule_action_creates_a_due_job() {
        let (engine, store) = engine();
        let definition = engine.deploy(linear()).await.unwrap();
        let id = engine.start_process(definition.id).await.unwrap();

        let job_id = engine
            .schedule_action(id, None, DelegateRef::new("notify"), None, true)
            .await
            .unwrap();

        let mut uow = store.begin().await.unwrap();
        let due = uow.first_due_job(Utc::now()).await.unwrap().unwrap();
        assert_eq!(due.id, job_id);
        assert!(due.exclusive);
        assert_eq!(due.instance_id, id);
        uow.rollback().await.unwrap();
    }
}
