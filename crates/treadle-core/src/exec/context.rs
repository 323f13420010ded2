use serde_json::Value;
use uuid::Uuid;

use crate::error::Result;
use crate::graph::{EventType, ProcessDefinition, TimerDef};
use crate::job::Job;

use super::instance::ProcessInstance;
use super::token::TokenId;

/// Side effects gathered while executing in-memory graph logic. The
/// caller turns them into store writes inside the same unit of work.
#[derive(Debug, Default)]
pub struct Effects {
    /// Jobs to insert on commit (timers scheduled by actions or node entry).
    pub created_jobs: Vec<Job>,
    /// Timer names to delete, scoped to a token.
    pub cancelled_timers: Vec<(TokenId, String)>,
    /// Tokens that ended during this step; their timer jobs must go too.
    pub ended_tokens: Vec<TokenId>,
    /// The whole instance finished; all of its jobs must be deleted.
    pub instance_ended: bool,
}

impl Effects {
    pub(crate) fn schedule(&mut self, job: Job) {
        self.created_jobs.push(job);
    }

    /// Cancels a named timer for a token. Jobs scheduled earlier in the
    /// same step are dropped in memory; persisted ones via the store.
    pub(crate) fn cancel_timer(&mut self, token: TokenId, name: &str) {
        self.created_jobs
            .retain(|j| !(j.token == Some(token) && j.timer_name() == Some(name)));
        self.cancelled_timers.push((token, name.to_string()));
    }

    pub(crate) fn cancel_token_timers(&mut self, token: TokenId) {
        self.created_jobs
            .retain(|j| !(j.token == Some(token) && j.timer_name().is_some()));
        self.ended_tokens.push(token);
    }
}

/// What a delegate sees while it runs: variable access scoped to the
/// executing token, plus timer scheduling against the current step.
pub struct ExecutionContext<'e> {
    pub(crate) definition: &'e ProcessDefinition,
    pub(crate) instance: &'e mut ProcessInstance,
    pub(crate) effects: &'e mut Effects,
    pub(crate) token: TokenId,
    pub(crate) event: Option<EventType>,
    pub(crate) transition: Option<String>,
}

impl ExecutionContext<'_> {
    pub fn instance_id(&self) -> Uuid {
        self.instance.id
    }

    pub fn definition(&self) -> &ProcessDefinition {
        self.definition
    }

    pub fn token(&self) -> TokenId {
        self.token
    }

    pub fn token_path(&self) -> String {
        self.instance
            .token_path(self.token)
            .unwrap_or_else(|_| "?".to_string())
    }

    /// Event that triggered this action, if it runs off an event binding.
    pub fn event(&self) -> Option<EventType> {
        self.event
    }

    /// Name of the transition being taken, for transition-bound actions.
    pub fn transition(&self) -> Option<&str> {
        self.transition.as_deref()
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.instance.variable(self.token, name).cloned()
    }

    /// Writes through to the closest scope declaring the name.
    pub fn set(&mut self, name: &str, value: Value) -> Result<()> {
        self.instance.set_variable(self.token, name, value)
    }

    /// Declares the variable on the executing token, shadowing outer scopes.
    pub fn set_local(&mut self, name: &str, value: Value) -> Result<()> {
        self.instance.set_variable_local(self.token, name, value)
    }

    /// Schedules a timer job owned by the executing token.
    pub fn schedule_timer(&mut self, timer: &TimerDef) {
        self.effects
            .schedule(Job::timer(self.instance, self.token, timer));
    }

    /// Cancels every pending timer with this name on the executing token.
    pub fn cancel_timer(&mut self, name: &str) {
        self.effects.cancel_timer(self.token, name);
    }
}
