use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::Value;

use crate::error::BoxedError;
use crate::eval::RhaiEvaluator;
use crate::exec::ExecutionContext;

/// User-supplied handler bound to a Task node, a node event or an action
/// job. `config` is the JSON blob attached at the binding site.
pub trait ActionHandler: Send + Sync {
    fn execute(
        &self,
        ctx: &mut ExecutionContext<'_>,
        config: &Value,
    ) -> std::result::Result<(), BoxedError>;
}

/// User-supplied handler bound to a Decision node. Returns the name of the
/// leaving transition to take.
pub trait DecisionHandler: Send + Sync {
    fn decide(
        &self,
        ctx: &mut ExecutionContext<'_>,
        config: &Value,
    ) -> std::result::Result<String, BoxedError>;
}

/// Read view of the variables visible at an evaluation site.
pub trait VariableResolver {
    fn get(&self, name: &str) -> Option<Value>;
    fn names(&self) -> Vec<String>;
}

/// Guard and decision expressions, plus inline script actions.
pub trait ExpressionEvaluator: Send + Sync {
    fn evaluate(
        &self,
        expr: &str,
        vars: &dyn VariableResolver,
    ) -> std::result::Result<Value, BoxedError>;

    /// Runs a script and reports the variables it changed or introduced.
    /// Evaluators without statement support may run the text as a bare
    /// expression and report nothing.
    fn run_script(
        &self,
        script: &str,
        vars: &dyn VariableResolver,
    ) -> std::result::Result<BTreeMap<String, Value>, BoxedError> {
        self.evaluate(script, vars)?;
        Ok(BTreeMap::new())
    }
}

struct FnAction<F>(F);

impl<F> ActionHandler for FnAction<F>
where
    F: Fn(&mut ExecutionContext<'_>, &Value) -> std::result::Result<(), BoxedError> + Send + Sync,
{
    fn execute(
        &self,
        ctx: &mut ExecutionContext<'_>,
        config: &Value,
    ) -> std::result::Result<(), BoxedError> {
        (self.0)(ctx, config)
    }
}

struct FnDecision<F>(F);

impl<F> DecisionHandler for FnDecision<F>
where
    F: Fn(&mut ExecutionContext<'_>, &Value) -> std::result::Result<String, BoxedError>
        + Send
        + Sync,
{
    fn decide(
        &self,
        ctx: &mut ExecutionContext<'_>,
        config: &Value,
    ) -> std::result::Result<String, BoxedError> {
        (self.0)(ctx, config)
    }
}

/// Name-keyed lookup of the handlers a deployment may reference.
#[derive(Default)]
pub struct DelegateRegistry {
    actions: HashMap<String, Arc<dyn ActionHandler>>,
    decisions: HashMap<String, Arc<dyn DecisionHandler>>,
}

impl DelegateRegistry {
    pub fn register_action(&mut self, name: impl Into<String>, handler: impl ActionHandler + 'static) {
        self.actions.insert(name.into(), Arc::new(handler));
    }

    pub fn register_action_fn<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&mut ExecutionContext<'_>, &Value) -> std::result::Result<(), BoxedError>
            + Send
            + Sync
            + 'static,
    {
        self.register_action(name, FnAction(f));
    }

    pub fn register_decision(
        &mut self,
        name: impl Into<String>,
        handler: impl DecisionHandler + 'static,
    ) {
        self.decisions.insert(name.into(), Arc::new(handler));
    }

    pub fn register_decision_fn<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&mut ExecutionContext<'_>, &Value) -> std::result::Result<String, BoxedError>
            + Send
            + Sync
            + 'static,
    {
        self.register_decision(name, FnDecision(f));
    }

    pub fn action(&self, name: &str) -> Option<Arc<dyn ActionHandler>> {
        self.actions.get(name).cloned()
    }

    pub fn decision(&self, name: &str) -> Option<Arc<dyn DecisionHandler>> {
        self.decisions.get(name).cloned()
    }
}

/// Everything an enactment needs besides the graph and the instance.
pub struct Services {
    pub delegates: DelegateRegistry,
    pub evaluator: Arc<dyn ExpressionEvaluator>,
}

impl Default for Services {
    fn default() -> Self {
        Self {
            delegates: DelegateRegistry::default(),
            evaluator: Arc::new(RhaiEvaluator::new()),
        }
    }
}

impl Services {
    pub fn new() -> Self {
        Self::default()
    }
}
