use serde::{Deserialize, Serialize};

use super::action::ActionSpec;
use super::node::NodeId;

/// Directed edge between two nodes of a process graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    /// Unnamed transitions are addressed by their declaration position.
    pub name: Option<String>,
    pub to: NodeId,
    /// Guard expression; the transition is only available while it
    /// evaluates truthy.
    pub guard: Option<String>,
    /// Actions fired while the transition is being taken.
    pub actions: Vec<ActionSpec>,
}

impl Transition {
    pub fn new(to: NodeId) -> Self {
        Self {
            name: None,
            to,
            guard: None,
            actions: Vec::new(),
        }
    }

    /// Label used for fork-child naming, availability lists and diagnostics.
    pub fn label(&self, index: usize) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => index.to_string(),
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        self.name.as_deref() == Some(name)
    }
}
