use std::collections::{BTreeMap, HashMap};

use uuid::Uuid;

use crate::error::{EngineError, Result};

use super::action::{ActionSpec, DelegateRef, EventType, TimerDef};
use super::definition::ProcessDefinition;
use super::node::{DecisionSelector, Node, NodeId, NodeKind};
use super::transition::Transition;

/// Fluent builder for process definitions. Node-level calls apply to the
/// most recently added node; transitions name their target node, resolved
/// when `build` validates the whole graph.
pub struct ProcessDefinitionBuilder {
    name: String,
    nodes: Vec<NodeDraft>,
    events: BTreeMap<EventType, Vec<ActionSpec>>,
    open_super_states: Vec<usize>,
    error: Option<String>,
}

struct NodeDraft {
    name: String,
    kind: NodeKind,
    leaving: Vec<TransitionDraft>,
    events: BTreeMap<EventType, Vec<ActionSpec>>,
    parent: Option<usize>,
}

struct TransitionDraft {
    name: Option<String>,
    to: String,
    guard: Option<String>,
    actions: Vec<ActionSpec>,
}

impl ProcessDefinitionBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            events: BTreeMap::new(),
            open_super_states: Vec::new(),
            error: None,
        }
    }

    pub fn start_node(self, name: impl Into<String>) -> Self {
        self.add_node(name, NodeKind::Start)
    }

    pub fn state(self, name: impl Into<String>) -> Self {
        self.add_node(name, NodeKind::State)
    }

    pub fn decision(self, name: impl Into<String>, selector: DecisionSelector) -> Self {
        self.add_node(name, NodeKind::Decision { selector })
    }

    pub fn fork(self, name: impl Into<String>) -> Self {
        self.add_node(name, NodeKind::Fork)
    }

    pub fn join(self, name: impl Into<String>) -> Self {
        self.add_node(name, NodeKind::Join)
    }

    pub fn task(self, name: impl Into<String>, handler: Option<DelegateRef>) -> Self {
        self.add_node(name, NodeKind::Task { handler })
    }

    pub fn end(self, name: impl Into<String>) -> Self {
        self.add_node(
            name,
            NodeKind::End {
                ends_instance: false,
            },
        )
    }

    /// End node that forces the whole instance down from any branch.
    pub fn end_all(self, name: impl Into<String>) -> Self {
        self.add_node(name, NodeKind::End { ends_instance: true })
    }

    /// Open a super-state; nodes added until `end_super_state` nest inside it.
    pub fn super_state(mut self, name: impl Into<String>) -> Self {
        self = self.add_node(
            name,
            NodeKind::SuperState {
                children: Vec::new(),
            },
        );
        let idx = self.nodes.len() - 1;
        self.open_super_states.push(idx);
        self
    }

    pub fn end_super_state(mut self) -> Self {
        if self.open_super_states.pop().is_none() {
            self.fail("end_super_state without a matching super_state");
        }
        self
    }

    /// Unnamed transition from the current node.
    pub fn transition_to(mut self, target: impl Into<String>) -> Self {
        self.add_transition(None, target.into(), None);
        self
    }

    /// Named transition from the current node.
    pub fn transition(mut self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.add_transition(Some(name.into()), target.into(), None);
        self
    }

    /// Named transition only available while the guard evaluates truthy.
    pub fn guarded(
        mut self,
        name: impl Into<String>,
        target: impl Into<String>,
        guard: impl Into<String>,
    ) -> Self {
        self.add_transition(Some(name.into()), target.into(), Some(guard.into()));
        self
    }

    /// Attach an action to the most recently added transition.
    pub fn transition_action(mut self, action: ActionSpec) -> Self {
        match self.nodes.last_mut().and_then(|n| n.leaving.last_mut()) {
            Some(t) => t.actions.push(action),
            None => self.fail("transition_action called before any transition"),
        }
        self
    }

    /// Bind an action to an event on the current node.
    pub fn on(mut self, event: EventType, action: ActionSpec) -> Self {
        match self.nodes.last_mut() {
            Some(n) => n.events.entry(event).or_default().push(action),
            None => self.fail("on called before any node"),
        }
        self
    }

    /// Bind an action to a definition-level event.
    pub fn on_process(mut self, event: EventType, action: ActionSpec) -> Self {
        self.events.entry(event).or_default().push(action);
        self
    }

    /// Attach a timer to the current node: scheduled on node-enter,
    /// cancelled on node-leave.
    pub fn with_timer(mut self, timer: TimerDef) -> Self {
        let cancel = ActionSpec::CancelTimer {
            name: timer.name.clone(),
        };
        match self.nodes.last_mut() {
            Some(n) => {
                n.events
                    .entry(EventType::NodeEnter)
                    .or_default()
                    .push(ActionSpec::CreateTimer(timer));
                n.events.entry(EventType::NodeLeave).or_default().push(cancel);
            }
            None => self.fail("with_timer called before any node"),
        }
        self
    }

    pub fn build(self) -> Result<ProcessDefinition> {
        if let Some(msg) = self.error {
            return Err(EngineError::Configuration(msg));
        }
        if !self.open_super_states.is_empty() {
            return Err(EngineError::Configuration(format!(
                "Definition '{}' has an unclosed super-state",
                self.name
            )));
        }

        for actions in self.events.values() {
            check_timers(actions)?;
        }
        for draft in &self.nodes {
            for actions in draft.events.values() {
                check_timers(actions)?;
            }
            for t in &draft.leaving {
                check_timers(&t.actions)?;
            }
        }

        let mut by_name: HashMap<String, NodeId> = HashMap::new();
        for (idx, draft) in self.nodes.iter().enumerate() {
            let id = NodeId(idx as u32);
            if by_name.insert(draft.name.clone(), id).is_some() {
                return Err(EngineError::Configuration(format!(
                    "Duplicate node name '{}' in definition '{}'",
                    draft.name, self.name
                )));
            }
        }

        let starts: Vec<usize> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, d)| matches!(d.kind, NodeKind::Start))
            .map(|(i, _)| i)
            .collect();
        let start = match starts.as_slice() {
            [single] => {
                if self.nodes[*single].parent.is_some() {
                    return Err(EngineError::Configuration(format!(
                        "Start node of '{}' must not be nested in a super-state",
                        self.name
                    )));
                }
                NodeId(*single as u32)
            }
            [] => {
                return Err(EngineError::Configuration(format!(
                    "Definition '{}' has no start node",
                    self.name
                )))
            }
            _ => {
                return Err(EngineError::Configuration(format!(
                    "Definition '{}' has {} start nodes",
                    self.name,
                    starts.len()
                )))
            }
        };

        // super-state membership, in declaration order
        let mut children: HashMap<usize, Vec<NodeId>> = HashMap::new();
        for (idx, draft) in self.nodes.iter().enumerate() {
            if let Some(p) = draft.parent {
                children.entry(p).or_default().push(NodeId(idx as u32));
            }
        }

        let mut nodes = Vec::with_capacity(self.nodes.len());
        for (idx, draft) in self.nodes.into_iter().enumerate() {
            let kind = match draft.kind {
                NodeKind::SuperState { .. } => {
                    let members = children.remove(&idx).unwrap_or_default();
                    if members.is_empty() {
                        return Err(EngineError::Configuration(format!(
                            "Super-state '{}' has no child nodes",
                            draft.name
                        )));
                    }
                    NodeKind::SuperState { children: members }
                }
                other => other,
            };
            let mut node = Node::new(draft.name.clone(), kind);
            node.parent = draft.parent.map(|p| NodeId(p as u32));
            node.events = draft.events;
            for t in draft.leaving {
                let to = by_name.get(&t.to).copied().ok_or_else(|| {
                    EngineError::Configuration(format!(
                        "Transition from '{}' targets unknown node '{}'",
                        draft.name, t.to
                    ))
                })?;
                node.leaving.push(Transition {
                    name: t.name,
                    to,
                    guard: t.guard,
                    actions: t.actions,
                });
            }
            nodes.push(node);
        }

        // entering lists
        let targets: Vec<(NodeId, NodeId)> = nodes
            .iter()
            .enumerate()
            .flat_map(|(from, n)| {
                n.leaving
                    .iter()
                    .map(move |t| (NodeId(from as u32), t.to))
            })
            .collect();
        for (from, to) in targets {
            nodes[to.index()].entering.push(from);
        }

        Ok(ProcessDefinition {
            id: Uuid::new_v4(),
            name: self.name,
            version: 0,
            nodes,
            start,
            by_name,
            events: self.events,
        })
    }

    fn add_node(mut self, name: impl Into<String>, kind: NodeKind) -> Self {
        let parent = self.open_super_states.last().copied();
        self.nodes.push(NodeDraft {
            name: name.into(),
            kind,
            leaving: Vec::new(),
            events: BTreeMap::new(),
            parent,
        });
        self
    }

    fn add_transition(&mut self, name: Option<String>, to: String, guard: Option<String>) {
        match self.nodes.last_mut() {
            Some(n) => n.leaving.push(TransitionDraft {
                name,
                to,
                guard,
                actions: Vec::new(),
            }),
            None => self.fail("transition added before any node"),
        }
    }

    fn fail(&mut self, msg: &str) {
        if self.error.is_none() {
            self.error = Some(format!("{} (definition '{}')", msg, self.name));
        }
    }
}

fn check_timers(actions: &[ActionSpec]) -> Result<()> {
    for action in actions {
        if let ActionSpec::CreateTimer(timer) = action {
            timer.validate()?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_definition() {
        let def = ProcessDefinitionBuilder::new("order")
            .start_node("start")
            .transition_to("one")
            .state("one")
            .transition_to("end")
            .end("end")
            .build()
            .unwrap();

        assert_eq!(def.name, "order");
        assert_eq!(def.nodes().len(), 3);
        let start = def.node(def.start()).unwrap();
        assert_eq!(start.name, "start");
        assert_eq!(start.leaving.len(), 1);
        let one = def.node_by_name("one").unwrap();
        assert_eq!(start.leaving[0].to, one);
        assert_eq!(def.node(one).unwrap().entering, vec![def.start()]);
    }

    #[test]
    fn test_duplicate_node_name_rejected() {
        let err = ProcessDefinitionBuilder::new("dup")
            .start_node("start")
            .state("a")
            .state("a")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("Duplicate node name 'a'"));
    }

    #[test]
    fn test_unknown_target_rejected() {
        let err = ProcessDefinitionBuilder::new("bad")
            .start_node("start")
            .transition_to("nowhere")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("unknown node 'nowhere'"));
    }

    #[test]
    fn test_exactly_one_start_required() {
        let err = ProcessDefinitionBuilder::new("empty")
            .state("a")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("no start node"));

        let err = ProcessDefinitionBuilder::new("twice")
            .start_node("s1")
            .start_node("s2")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("2 start nodes"));
    }

    #[test]
    fn test_super_state_membership() {
        let def = ProcessDefinitionBuilder::new("phased")
            .start_node("start")
            .transition_to("a")
            .super_state("phase")
            .transition("escalate", "done")
            .state("a")
            .transition_to("b")
            .state("b")
            .transition_to("done")
            .end_super_state()
            .end("done")
            .build()
            .unwrap();

        let phase = def.node_by_name("phase").unwrap();
        let a = def.node_by_name("a").unwrap();
        let b = def.node_by_name("b").unwrap();
        assert_eq!(def.node(a).unwrap().parent, Some(phase));
        assert_eq!(def.ancestry(b).unwrap(), vec![phase]);
        match &def.node(phase).unwrap().kind {
            NodeKind::SuperState { children } => assert_eq!(children, &vec![a, b]),
            other => panic!("expected super-state, got {}", other.kind_name()),
        }
    }

    #[test]
    fn test_empty_super_state_rejected() {
        let err = ProcessDefinitionBuilder::new("hollow")
            .start_node("start")
            .super_state("phase")
            .end_super_state()
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("no child nodes"));
    }

    #[test]
    fn test_zero_repeat_timer_rejected() {
        let timer = TimerDef::new("tick", std::time::Duration::from_secs(1))
            .with_repeat(std::time::Duration::ZERO);
        let err = ProcessDefinitionBuilder::new("ticking")
            .start_node("start")
            .transition_to("wait")
            .state("wait")
            .with_timer(timer)
            .transition_to("end")
            .end("end")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("zero repeat"));
    }

    #[test]
    fn test_out_of_range_timer_delay_rejected() {
        let err = ProcessDefinitionBuilder::new("overflowing")
            .start_node("start")
            .transition_to("end")
            .end("end")
            .on_process(
                EventType::ProcessStart,
                ActionSpec::CreateTimer(TimerDef::new("never", std::time::Duration::MAX)),
            )
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("out-of-range delay"));
    }

    #[test]
    fn test_with_timer_installs_enter_and_leave_actions() {
        let timer = TimerDef::new("reminder", std::time::Duration::from_secs(60))
            .with_transition("timeout");
        let def = ProcessDefinitionBuilder::new("timed")
            .start_node("start")
            .transition_to("wait")
            .state("wait")
            .with_timer(timer)
            .transition("timeout", "end")
            .end("end")
            .build()
            .unwrap();

        let wait = def.node(def.node_by_name("wait").unwrap()).unwrap();
        let enter = wait.actions_for(EventType::NodeEnter);
        let leave = wait.actions_for(EventType::NodeLeave);
        assert!(matches!(enter[0], ActionSpec::CreateTimer(ref t) if t.name == "reminder"));
        assert!(matches!(leave[0], ActionSpec::CancelTimer { ref name } if name == "reminder"));
    }
}
