use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::action::{ActionSpec, DelegateRef, EventType};
use super::transition::Transition;

/// Index of a node in its definition's node arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How a decision node picks its leaving transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DecisionSelector {
    /// Expression whose stringified result must exactly match a
    /// leaving-transition name.
    Expression(String),
    /// Registered decision handler returning the transition name.
    Handler(DelegateRef),
    /// First guard-satisfied transition wins, else the first unguarded one.
    ByGuards,
}

/// Entry behavior of a node. Decision, Fork, Join and End complete
/// synchronously; State and Task park the token until an external signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NodeKind {
    /// Entry point; the root token is placed here at instance creation.
    Start,
    /// Wait state.
    State,
    /// Automatic routing to one leaving transition.
    Decision { selector: DecisionSelector },
    /// Splits the arriving token into one child per leaving transition.
    Fork,
    /// Collects fork children and resumes their parent.
    Join,
    /// Runs its handler on entry (work-item creation, notification),
    /// then waits like a state.
    Task { handler: Option<DelegateRef> },
    /// Terminus; `ends_instance` forces the whole instance down from any
    /// branch instead of ending only the arriving token.
    End { ends_instance: bool },
    /// Named composite; entering it descends into its first child.
    SuperState { children: Vec<NodeId> },
}

impl NodeKind {
    pub fn kind_name(&self) -> &'static str {
        match self {
            NodeKind::Start => "start",
            NodeKind::State => "state",
            NodeKind::Decision { .. } => "decision",
            NodeKind::Fork => "fork",
            NodeKind::Join => "join",
            NodeKind::Task { .. } => "task",
            NodeKind::End { .. } => "end",
            NodeKind::SuperState { .. } => "super-state",
        }
    }
}

/// A vertex of the process graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub kind: NodeKind,
    /// Leaving transitions in declaration order.
    pub leaving: Vec<Transition>,
    /// Nodes holding a transition into this one.
    pub entering: Vec<NodeId>,
    /// Actions keyed by the event that fires them.
    pub events: BTreeMap<EventType, Vec<ActionSpec>>,
    /// Enclosing super-state, when nested.
    pub parent: Option<NodeId>,
}

impl Node {
    pub(crate) fn new(name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            leaving: Vec::new(),
            entering: Vec::new(),
            events: BTreeMap::new(),
            parent: None,
        }
    }

    /// Leaving transition by name, with its declaration index.
    pub fn transition(&self, name: &str) -> Option<(usize, &Transition)> {
        self.leaving
            .iter()
            .enumerate()
            .find(|(_, t)| t.matches(name))
    }

    pub fn actions_for(&self, event: EventType) -> &[ActionSpec] {
        self.events.get(&event).map(Vec::as_slice).unwrap_or(&[])
    }
}
