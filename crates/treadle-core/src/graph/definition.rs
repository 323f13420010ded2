use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, Result};

use super::action::{ActionSpec, EventType};
use super::node::{Node, NodeId};

/// Immutable, validated process graph. Built once through
/// [`super::ProcessDefinitionBuilder`], then shared read-only by every
/// instance enacting it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub id: Uuid,
    pub name: String,
    /// Deployment version, assigned when the definition is deployed.
    pub version: i32,
    pub(crate) nodes: Vec<Node>,
    pub(crate) start: NodeId,
    pub(crate) by_name: HashMap<String, NodeId>,
    /// Definition-level actions (process-start, process-end, bubbled events).
    pub(crate) events: BTreeMap<EventType, Vec<ActionSpec>>,
}

impl ProcessDefinition {
    pub fn start(&self) -> NodeId {
        self.start
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes.get(id.index()).ok_or_else(|| {
            EngineError::Configuration(format!(
                "Unknown node {} in definition '{}'",
                id, self.name
            ))
        })
    }

    pub fn node_by_name(&self, name: &str) -> Option<NodeId> {
        self.by_name.get(name).copied()
    }

    pub fn actions_for(&self, event: EventType) -> &[ActionSpec] {
        self.events.get(&event).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Chain of enclosing super-states, innermost first.
    pub fn ancestry(&self, id: NodeId) -> Result<Vec<NodeId>> {
        let mut out = Vec::new();
        let mut cur = self.node(id)?.parent;
        while let Some(p) = cur {
            out.push(p);
            cur = self.node(p)?.parent;
        }
        Ok(out)
    }
}
