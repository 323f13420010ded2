mod action;
mod builder;
mod definition;
mod node;
mod transition;

pub use action::{ActionSpec, DelegateRef, EventType, TimerDef};
pub use builder::ProcessDefinitionBuilder;
pub use definition::ProcessDefinition;
pub use node::{DecisionSelector, Node, NodeId, NodeKind};
pub use transition::Transition;
