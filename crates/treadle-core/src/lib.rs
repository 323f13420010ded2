pub mod error;
pub mod eval;
pub mod exec;
pub mod graph;
pub mod job;
pub mod services;
pub mod storage;

pub use error::{error_chain, BoxedError, EngineError, Result};
pub use eval::RhaiEvaluator;
pub use exec::{Effects, Enactment, ExecutionContext, ProcessInstance, Token, TokenId};
pub use graph::{
    ActionSpec, DecisionSelector, DelegateRef, EventType, Node, NodeId, NodeKind,
    ProcessDefinition, ProcessDefinitionBuilder, TimerDef, Transition,
};
pub use job::{Job, JobPayload, TimerJob, DEFAULT_RETRIES};
pub use services::{
    ActionHandler, DecisionHandler, DelegateRegistry, ExpressionEvaluator, Services,
    VariableResolver,
};
pub use storage::{ProcessStore, UnitOfWork};
