use std::time::Duration;

use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Graph events an action can be bound to. Events fired on a node propagate
/// up through its enclosing super-states to the process definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    ProcessStart,
    ProcessEnd,
    NodeEnter,
    NodeLeave,
    Transition,
    SuperStateEnter,
    SuperStateLeave,
    Timer,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ProcessStart => "process-start",
            EventType::ProcessEnd => "process-end",
            EventType::NodeEnter => "node-enter",
            EventType::NodeLeave => "node-leave",
            EventType::Transition => "transition",
            EventType::SuperStateEnter => "superstate-enter",
            EventType::SuperStateLeave => "superstate-leave",
            EventType::Timer => "timer",
        }
    }
}

/// Reference to a registered delegate plus its static configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegateRef {
    pub name: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

impl DelegateRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: serde_json::Value::Null,
        }
    }

    pub fn with_config(name: impl Into<String>, config: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }
}

/// Timer template attached to a node or scheduled by an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerDef {
    /// Name used for cancellation; unique per token by convention.
    pub name: String,
    pub delay: Duration,
    /// Re-fires at this interval until the token leaves the node.
    pub repeat: Option<Duration>,
    /// Transition to take when the timer fires; stays in the node when absent.
    pub transition: Option<String>,
    /// Delegate to run when the timer fires.
    pub action: Option<DelegateRef>,
}

impl TimerDef {
    pub fn new(name: impl Into<String>, delay: Duration) -> Self {
        Self {
            name: name.into(),
            delay,
            repeat: None,
            transition: None,
            action: None,
        }
    }

    pub fn with_transition(mut self, transition: impl Into<String>) -> Self {
        self.transition = Some(transition.into());
        self
    }

    pub fn with_repeat(mut self, repeat: Duration) -> Self {
        self.repeat = Some(repeat);
        self
    }

    pub fn with_action(mut self, action: DelegateRef) -> Self {
        self.action = Some(action);
        self
    }

    /// Checks the durations are usable: representable in chrono and, for a
    /// repeating timer, a strictly positive interval. A zero repeat would
    /// re-fire without ever advancing the due date.
    pub fn validate(&self) -> Result<()> {
        if ChronoDuration::from_std(self.delay).is_err() {
            return Err(EngineError::Configuration(format!(
                "Timer '{}' has an out-of-range delay",
                self.name
            )));
        }
        match self.repeat {
            Some(repeat) if repeat.is_zero() => Err(EngineError::Configuration(format!(
                "Timer '{}' has a zero repeat interval",
                self.name
            ))),
            Some(repeat) if ChronoDuration::from_std(repeat).is_err() => {
                Err(EngineError::Configuration(format!(
                    "Timer '{}' has an out-of-range repeat interval",
                    self.name
                )))
            }
            _ => Ok(()),
        }
    }
}

/// A unit of behavior bound to a graph event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ActionSpec {
    /// Run a registered action handler.
    Delegate(DelegateRef),
    /// Evaluate a script for its side effects on process variables.
    Script(String),
    /// Schedule a timer against the current token.
    CreateTimer(TimerDef),
    /// Cancel pending timers with this name on the current token.
    CancelTimer { name: String },
}
