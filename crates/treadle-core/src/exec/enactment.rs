use chrono::Utc;
use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::eval::{stringify, truthy};
use crate::graph::{
    ActionSpec, DecisionSelector, DelegateRef, EventType, Node, NodeId, NodeKind,
    ProcessDefinition, Transition,
};
use crate::job::{Job, TimerJob};
use crate::services::Services;

use super::context::{Effects, ExecutionContext};
use super::instance::{ProcessInstance, TokenVariables};
use super::token::TokenId;

/// One engine step over a loaded instance. Borrows the immutable graph and
/// the in-memory instance for the duration of a unit of work, mutates the
/// token tree, and gathers the store side effects of the step. The engine
/// itself never touches the store.
pub struct Enactment<'a> {
    definition: &'a ProcessDefinition,
    instance: &'a mut ProcessInstance,
    services: &'a Services,
    effects: Effects,
    current_transition: Option<String>,
}

impl<'a> Enactment<'a> {
    pub fn new(
        definition: &'a ProcessDefinition,
        instance: &'a mut ProcessInstance,
        services: &'a Services,
    ) -> Self {
        Self {
            definition,
            instance,
            services,
            effects: Effects::default(),
            current_transition: None,
        }
    }

    pub fn instance(&self) -> &ProcessInstance {
        self.instance
    }

    pub fn effects(&self) -> &Effects {
        &self.effects
    }

    pub fn into_effects(self) -> Effects {
        self.effects
    }

    pub(crate) fn schedule(&mut self, job: Job) {
        self.effects.schedule(job);
    }

    /// Fires the process-start event for a freshly created instance. The
    /// root token stays parked at the start node until the first signal.
    pub fn begin(&mut self) -> Result<()> {
        tracing::info!(
            instance = %self.instance.id,
            definition = %self.definition.name,
            "Process instance started"
        );
        let root = self.instance.root;
        self.fire_definition_event(root, EventType::ProcessStart)
    }

    /// Moves a parked token along its single leaving transition.
    pub fn signal(&mut self, token: TokenId) -> Result<()> {
        self.signal_impl(token, None)
    }

    /// Moves a parked token along a named transition, resolved through the
    /// node's enclosing super-states when the node itself does not declare it.
    pub fn signal_named(&mut self, token: TokenId, transition: &str) -> Result<()> {
        self.signal_impl(token, Some(transition))
    }

    fn signal_impl(&mut self, token: TokenId, name: Option<&str>) -> Result<()> {
        let node = self.check_signalable(token)?;
        let (from, index) = self.resolve_signal(node, name)?;
        let definition = self.definition;
        let transition = transition_at(definition, from, index)?;
        if !self.guard_allows(token, transition, index)? {
            return Err(EngineError::State(format!(
                "Transition '{}' out of node '{}' is not available: its guard evaluated false",
                transition.label(index),
                definition.node(node)?.name
            )));
        }
        tracing::debug!(
            instance = %self.instance.id,
            token = %token,
            node = %definition.node(node)?.name,
            transition = %transition.label(index),
            "Signalling token"
        );
        self.leave_via(token, from, index)
    }

    fn check_signalable(&self, token: TokenId) -> Result<NodeId> {
        let t = self.instance.token(token)?;
        if t.has_ended() {
            return Err(EngineError::State(format!(
                "Token '{}' has ended",
                self.path(token)
            )));
        }
        if self.instance.suspended || t.suspended {
            return Err(EngineError::State(format!(
                "Token '{}' is suspended",
                self.path(token)
            )));
        }
        if let Some(owner) = &t.lock_owner {
            return Err(EngineError::State(format!(
                "Token '{}' is locked by '{}'",
                self.path(token),
                owner
            )));
        }
        t.node.ok_or_else(|| {
            EngineError::Configuration(format!(
                "Token '{}' is not positioned in a node",
                self.path(token)
            ))
        })
    }

    /// Finds the transition a signal refers to: the token's node first,
    /// then each enclosing super-state. Unnamed signals require exactly one
    /// leaving transition at the first level that declares any.
    fn resolve_signal(&self, node: NodeId, name: Option<&str>) -> Result<(NodeId, usize)> {
        let definition = self.definition;
        let node_name = &definition.node(node)?.name;
        let mut chain = vec![node];
        chain.extend(definition.ancestry(node)?);

        match name {
            Some(wanted) => {
                for id in chain {
                    if let Some((index, _)) = definition.node(id)?.transition(wanted) {
                        return Ok((id, index));
                    }
                }
                Err(EngineError::Configuration(format!(
                    "No transition named '{}' leaves node '{}' or its enclosing super-states",
                    wanted, node_name
                )))
            }
            None => {
                for id in chain {
                    let n = definition.node(id)?;
                    match n.leaving.len() {
                        0 => continue,
                        1 => return Ok((id, 0)),
                        count => {
                            return Err(EngineError::Configuration(format!(
                                "Node '{}' has {} leaving transitions; the signal must name one",
                                n.name, count
                            )))
                        }
                    }
                }
                Err(EngineError::Configuration(format!(
                    "Node '{}' has no leaving transitions",
                    node_name
                )))
            }
        }
    }

    /// Names of the transitions the token can take right now: unguarded and
    /// guard-satisfied transitions of its node, unioned with those of each
    /// enclosing super-state, in declaration order without duplicates.
    pub fn available_transitions(&self, token: TokenId) -> Result<Vec<String>> {
        let t = self.instance.token(token)?;
        if t.has_ended() {
            return Ok(Vec::new());
        }
        let Some(node) = t.node else {
            return Ok(Vec::new());
        };
        let definition = self.definition;
        let mut chain = vec![node];
        chain.extend(definition.ancestry(node)?);

        let mut out: Vec<String> = Vec::new();
        for id in chain {
            for (index, transition) in definition.node(id)?.leaving.iter().enumerate() {
                if self.guard_allows(token, transition, index)? {
                    let label = transition.label(index);
                    if !out.contains(&label) {
                        out.push(label);
                    }
                }
            }
        }
        Ok(out)
    }

    /// Advisory reservation against concurrent signalling.
    pub fn lock(&mut self, token: TokenId, owner: &str) -> Result<()> {
        let now = Utc::now();
        self.instance.token_mut(token)?.lock(owner, now)
    }

    pub fn unlock(&mut self, token: TokenId, owner: &str) -> Result<()> {
        self.instance.token_mut(token)?.unlock(owner)
    }

    /// Ends a token and its subtree; an ancestor left with no live children
    /// is completed too, recursively (the natural completion path).
    pub fn end_token(&mut self, token: TokenId) -> Result<()> {
        self.instance.token(token)?;
        self.end_token_internal(token, true)
    }

    /// Cancellation: ends the subtree without parent auto-completion, so a
    /// pending join never mistakes the cancellation for an arrival.
    pub fn cancel_token(&mut self, token: TokenId) -> Result<()> {
        self.instance.token(token)?;
        self.end_token_internal(token, false)
    }

    /// Cancels the whole instance; its outstanding jobs are deleted when
    /// the effects are applied.
    pub fn cancel_instance(&mut self) -> Result<()> {
        self.end_instance()
    }

    /// Suspends the instance: live tokens stop accepting signals and firing
    /// timers record a failure on their job row until resume.
    pub fn suspend(&mut self) -> Result<()> {
        if self.instance.has_ended() {
            return Err(EngineError::State(format!(
                "Instance {} has ended",
                self.instance.id
            )));
        }
        self.instance.set_suspended(true);
        tracing::info!(instance = %self.instance.id, "Process instance suspended");
        Ok(())
    }

    pub fn resume(&mut self) -> Result<()> {
        if self.instance.has_ended() {
            return Err(EngineError::State(format!(
                "Instance {} has ended",
                self.instance.id
            )));
        }
        self.instance.set_suspended(false);
        tracing::info!(instance = %self.instance.id, "Process instance resumed");
        Ok(())
    }

    /// Applies a firing timer to its owning token: the timer event on the
    /// node chain, the bound action, then the optional transition. The
    /// transition is skipped silently when the token's current position no
    /// longer offers it.
    pub(crate) fn fire_timer(&mut self, token: TokenId, timer: &TimerJob) -> Result<()> {
        let t = self.instance.token(token)?;
        if t.has_ended() {
            return Err(EngineError::State(format!(
                "Timer '{}' fired on ended token '{}'",
                timer.name,
                self.path(token)
            )));
        }
        if self.instance.suspended || t.suspended {
            return Err(EngineError::State(format!(
                "Timer '{}' fired on suspended token '{}'",
                timer.name,
                self.path(token)
            )));
        }
        let node = t.node.ok_or_else(|| {
            EngineError::Configuration(format!(
                "Token '{}' is not positioned in a node",
                self.path(token)
            ))
        })?;

        self.fire_event(token, node, EventType::Timer)?;
        if let Some(action) = &timer.action {
            self.run_action(token, action, Some(EventType::Timer))?;
        }

        if let Some(name) = &timer.transition {
            // the timer event may have moved the token already
            let offered = match self.instance.token(token)?.node {
                Some(current) => self.resolve_signal(current, Some(name)).is_ok(),
                None => false,
            };
            if offered {
                self.signal_named(token, name)?;
            } else {
                tracing::debug!(
                    instance = %self.instance.id,
                    token = %token,
                    timer = %timer.name,
                    transition = %name,
                    "Timer transition not offered by the current node; staying put"
                );
            }
        }
        Ok(())
    }

    fn leave_via(&mut self, token: TokenId, from: NodeId, index: usize) -> Result<()> {
        let label = transition_at(self.definition, from, index)?.label(index);
        self.current_transition = Some(label);
        let result = self.take_transition(token, from, index);
        self.current_transition = None;
        result
    }

    fn take_transition(&mut self, token: TokenId, from: NodeId, index: usize) -> Result<()> {
        let definition = self.definition;
        let current = self.instance.token(token)?.node.ok_or_else(|| {
            EngineError::Configuration(format!(
                "Token '{}' is not positioned in a node",
                self.path(token)
            ))
        })?;
        let transition = transition_at(definition, from, index)?;
        let destination = transition.to;

        self.fire_event(token, current, EventType::NodeLeave)?;
        self.instance.token_mut(token)?.node = None;

        // super-state boundaries crossed by this transition
        let from_chain = definition.ancestry(current)?;
        let to_chain = definition.ancestry(destination)?;
        let left: Vec<NodeId> = from_chain
            .iter()
            .copied()
            .take_while(|s| !to_chain.contains(s))
            .collect();
        let entered: Vec<NodeId> = to_chain
            .iter()
            .copied()
            .take_while(|s| !from_chain.contains(s))
            .collect();

        for s in &left {
            self.fire_event(token, *s, EventType::SuperStateLeave)?;
        }

        for action in &transition.actions {
            self.run_action_spec(token, action, Some(EventType::Transition))?;
        }
        self.fire_event(token, from, EventType::Transition)?;

        for s in entered.iter().rev() {
            self.fire_event(token, *s, EventType::SuperStateEnter)?;
        }

        self.enter_node(token, destination)
    }

    fn enter_node(&mut self, token: TokenId, node: NodeId) -> Result<()> {
        let definition = self.definition;
        let n = definition.node(node)?;
        tracing::debug!(
            instance = %self.instance.id,
            token = %token,
            node = %n.name,
            kind = n.kind.kind_name(),
            "Entering node"
        );
        {
            let t = self.instance.token_mut(token)?;
            t.node = Some(node);
            t.node_entered_at = Some(Utc::now());
        }
        self.fire_event(token, node, EventType::NodeEnter)?;

        match &n.kind {
            NodeKind::State => Ok(()),
            NodeKind::Start => self.take_default(token, node),
            NodeKind::Task { handler } => {
                if let Some(delegate) = handler {
                    self.run_action(token, delegate, None)?;
                }
                Ok(())
            }
            NodeKind::Decision { selector } => {
                let index = self.select_decision(token, node, selector)?;
                self.leave_via(token, node, index)
            }
            NodeKind::Fork => self.fork(token, node),
            NodeKind::Join => self.join(token, node),
            NodeKind::End { ends_instance } => {
                if *ends_instance {
                    self.end_instance()
                } else {
                    self.end_token_internal(token, true)
                }
            }
            NodeKind::SuperState { children } => {
                self.fire_event(token, node, EventType::SuperStateEnter)?;
                let first = children.first().copied().ok_or_else(|| {
                    EngineError::Configuration(format!(
                        "Super-state '{}' has no child nodes",
                        n.name
                    ))
                })?;
                self.enter_node(token, first)
            }
        }
    }

    /// Automatic nodes proceed along their first declared transition.
    fn take_default(&mut self, token: TokenId, node: NodeId) -> Result<()> {
        let n = self.definition.node(node)?;
        if n.leaving.is_empty() {
            return Err(EngineError::Configuration(format!(
                "Node '{}' has no leaving transitions",
                n.name
            )));
        }
        self.leave_via(token, node, 0)
    }

    fn select_decision(
        &mut self,
        token: TokenId,
        node: NodeId,
        selector: &DecisionSelector,
    ) -> Result<usize> {
        let definition = self.definition;
        let n = definition.node(node)?;
        match selector {
            DecisionSelector::ByGuards => {
                for (index, transition) in n.leaving.iter().enumerate() {
                    if transition.guard.is_some() && self.guard_allows(token, transition, index)? {
                        return Ok(index);
                    }
                }
                n.leaving
                    .iter()
                    .position(|t| t.guard.is_none())
                    .ok_or_else(|| {
                        EngineError::Configuration(format!(
                            "Decision '{}' matched no guard and declares no unguarded default",
                            n.name
                        ))
                    })
            }
            DecisionSelector::Expression(expr) => {
                let value = self.evaluate(
                    token,
                    expr,
                    &format!("decision expression on '{}'", n.name),
                )?;
                self.match_decision_result(n, &stringify(&value))
            }
            DecisionSelector::Handler(delegate) => {
                let handler = self
                    .services
                    .delegates
                    .decision(&delegate.name)
                    .ok_or_else(|| {
                        EngineError::delegation(
                            format!("decision '{}'", delegate.name),
                            "no handler registered under this name",
                        )
                    })?;
                let result = {
                    let mut ctx = self.context(token, None);
                    handler.decide(&mut ctx, &delegate.config)
                }
                .map_err(|source| {
                    EngineError::delegation(format!("decision '{}'", delegate.name), source)
                })?;
                self.match_decision_result(n, &result)
            }
        }
    }

    fn match_decision_result(&self, n: &Node, result: &str) -> Result<usize> {
        n.transition(result).map(|(index, _)| index).ok_or_else(|| {
            EngineError::Configuration(format!(
                "Decision '{}' produced '{}', which matches no leaving transition",
                n.name, result
            ))
        })
    }

    /// Splits the arriving token into one child per leaving transition,
    /// each child named after its transition label. Names already taken by
    /// earlier generations get a numeric suffix starting at 2.
    fn fork(&mut self, parent: TokenId, node: NodeId) -> Result<()> {
        let definition = self.definition;
        let n = definition.node(node)?;
        if n.leaving.is_empty() {
            return Err(EngineError::Configuration(format!(
                "Fork '{}' has no leaving transitions",
                n.name
            )));
        }

        let labels: Vec<String> = n
            .leaving
            .iter()
            .enumerate()
            .map(|(index, t)| t.label(index))
            .collect();
        let mut spawned: Vec<(TokenId, usize)> = Vec::new();
        for (index, label) in labels.iter().enumerate() {
            let name = self.instance.token(parent)?.next_child_name(label);
            let child = self.instance.new_child(parent, name)?;
            let now = Utc::now();
            let t = self.instance.token_mut(child)?;
            t.node = Some(node);
            t.node_entered_at = Some(now);
            t.expects_join = true;
            spawned.push((child, index));
        }
        tracing::debug!(
            instance = %self.instance.id,
            fork = %n.name,
            children = spawned.len(),
            "Fork spawned child tokens"
        );
        for (child, index) in spawned {
            self.leave_via(child, node, index)?;
        }
        Ok(())
    }

    /// Ends the arriving child; once no sibling still expects this join,
    /// the parent resumes by leaving through the join's first transition.
    fn join(&mut self, arriving: TokenId, node: NodeId) -> Result<()> {
        let Some(parent) = self.instance.token(arriving)?.parent else {
            // the root walked straight into the join
            return self.take_default(arriving, node);
        };

        let arrived = self.instance.token(arriving)?.expects_join;
        self.end_token_internal(arriving, false)?;
        if !arrived {
            return Ok(());
        }

        let blocked = self
            .instance
            .token(parent)?
            .children
            .values()
            .any(|c| {
                self.instance
                    .token(*c)
                    .map(|t| t.expects_join)
                    .unwrap_or(false)
            });
        if blocked {
            return Ok(());
        }

        tracing::debug!(
            instance = %self.instance.id,
            join = %self.definition.node(node)?.name,
            "Join complete; resuming parent token"
        );
        {
            let t = self.instance.token_mut(parent)?;
            t.node = Some(node);
            t.node_entered_at = Some(Utc::now());
        }
        self.take_default(parent, node)
    }

    fn end_token_internal(&mut self, token: TokenId, verify_parent: bool) -> Result<()> {
        if self.instance.token(token)?.has_ended() {
            tracing::debug!(instance = %self.instance.id, token = %token, "Token already ended");
            return Ok(());
        }
        {
            let t = self.instance.token_mut(token)?;
            t.ended_at = Some(Utc::now());
            t.expects_join = false;
        }
        self.effects.cancel_token_timers(token);

        let children: Vec<TokenId> = self
            .instance
            .token(token)?
            .children
            .values()
            .copied()
            .collect();
        for child in children {
            self.end_token_internal(child, false)?;
        }

        if verify_parent {
            match self.instance.token(token)?.parent {
                None => self.end_instance()?,
                Some(parent) => {
                    let completes_parent = !self.instance.token(parent)?.has_ended()
                        && self.instance.live_children(parent).is_empty();
                    if completes_parent {
                        self.end_token_internal(parent, true)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn end_instance(&mut self) -> Result<()> {
        if self.instance.has_ended() {
            return Ok(());
        }
        let root = self.instance.root;
        self.end_token_internal(root, false)?;
        self.instance.ended_at = Some(Utc::now());
        self.effects.instance_ended = true;
        self.fire_definition_event(root, EventType::ProcessEnd)?;
        tracing::info!(instance = %self.instance.id, "Process instance ended");
        Ok(())
    }

    /// Runs the actions bound to `event` on a node, then on each enclosing
    /// super-state, then on the definition itself.
    fn fire_event(&mut self, token: TokenId, node: NodeId, event: EventType) -> Result<()> {
        let definition = self.definition;
        let mut element = Some(node);
        while let Some(id) = element {
            let n = definition.node(id)?;
            for action in n.actions_for(event) {
                self.run_action_spec(token, action, Some(event))?;
            }
            element = n.parent;
        }
        for action in definition.actions_for(event) {
            self.run_action_spec(token, action, Some(event))?;
        }
        Ok(())
    }

    fn fire_definition_event(&mut self, token: TokenId, event: EventType) -> Result<()> {
        let definition = self.definition;
        for action in definition.actions_for(event) {
            self.run_action_spec(token, action, Some(event))?;
        }
        Ok(())
    }

    fn run_action_spec(
        &mut self,
        token: TokenId,
        action: &ActionSpec,
        event: Option<EventType>,
    ) -> Result<()> {
        match action {
            ActionSpec::Delegate(delegate) => self.run_action(token, delegate, event),
            ActionSpec::Script(script) => self.run_script(token, script),
            ActionSpec::CreateTimer(def) => {
                let job = Job::timer(&*self.instance, token, def);
                tracing::debug!(
                    instance = %self.instance.id,
                    token = %token,
                    timer = %def.name,
                    due_at = %job.due_at,
                    "Scheduling timer"
                );
                self.effects.schedule(job);
                Ok(())
            }
            ActionSpec::CancelTimer { name } => {
                self.effects.cancel_timer(token, name);
                Ok(())
            }
        }
    }

    /// Resolves and runs a registered action handler; its failure wraps as
    /// a delegation error with the cause preserved.
    pub(crate) fn run_action(
        &mut self,
        token: TokenId,
        delegate: &DelegateRef,
        event: Option<EventType>,
    ) -> Result<()> {
        let handler = self
            .services
            .delegates
            .action(&delegate.name)
            .ok_or_else(|| {
                EngineError::delegation(
                    format!("action '{}'", delegate.name),
                    "no handler registered under this name",
                )
            })?;
        let mut ctx = self.context(token, event);
        handler
            .execute(&mut ctx, &delegate.config)
            .map_err(|source| {
                EngineError::delegation(format!("action '{}'", delegate.name), source)
            })
    }

    fn run_script(&mut self, token: TokenId, script: &str) -> Result<()> {
        let changed = {
            let resolver = TokenVariables {
                instance: &*self.instance,
                token,
            };
            self.services.evaluator.run_script(script, &resolver)
        }
        .map_err(|source| EngineError::delegation("script action", source))?;
        for (name, value) in changed {
            self.instance.set_variable(token, &name, value)?;
        }
        Ok(())
    }

    fn evaluate(&self, token: TokenId, expr: &str, what: &str) -> Result<Value> {
        let resolver = TokenVariables {
            instance: &*self.instance,
            token,
        };
        self.services
            .evaluator
            .evaluate(expr, &resolver)
            .map_err(|source| EngineError::delegation(what.to_string(), source))
    }

    fn guard_allows(&self, token: TokenId, transition: &Transition, index: usize) -> Result<bool> {
        match &transition.guard {
            None => Ok(true),
            Some(expr) => {
                let value = self.evaluate(
                    token,
                    expr,
                    &format!("guard on transition '{}'", transition.label(index)),
                )?;
                Ok(truthy(&value))
            }
        }
    }

    fn context(&mut self, token: TokenId, event: Option<EventType>) -> ExecutionContext<'_> {
        ExecutionContext {
            definition: self.definition,
            instance: &mut *self.instance,
            effects: &mut self.effects,
            token,
            event,
            transition: self.current_transition.clone(),
        }
    }

    fn path(&self, token: TokenId) -> String {
        self.instance
            .token_path(token)
            .unwrap_or_else(|_| token.to_string())
    }
}

fn transition_at<'d>(
    definition: &'d ProcessDefinition,
    node: NodeId,
    index: usize,
) -> Result<&'d Transition> {
    let n = definition.node(node)?;
    n.leaving.get(index).ok_or_else(|| {
        EngineError::Configuration(format!(
            "Node '{}' has no transition at position {}",
            n.name, index
        ))
    })
}
