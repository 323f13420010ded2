use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::graph::NodeId;

/// Index of a token in its instance's arena. Tokens are never removed from
/// the arena, so ids stay stable for the life of the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TokenId(pub u32);

impl TokenId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for TokenId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// One locus of control in a process instance's execution tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub id: TokenId,
    /// Path segment; empty for the root token.
    pub name: String,
    /// Lookup only; ownership flows parent to children via the child map.
    pub parent: Option<TokenId>,
    /// Children by name. Ended children stay listed, which is what makes
    /// repeated fork entries pick suffixed names.
    pub children: BTreeMap<String, TokenId>,
    /// Node the token currently sits at; None only for unstarted fork
    /// children mid-creation.
    pub node: Option<NodeId>,
    pub node_entered_at: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub suspended: bool,
    /// Set when a fork creates this token; cleared when the token ends.
    /// A join completes once no sibling carries the flag.
    pub expects_join: bool,
    pub lock_owner: Option<String>,
    pub lock_time: Option<DateTime<Utc>>,
}

impl Token {
    pub(crate) fn root(node: NodeId, now: DateTime<Utc>) -> Self {
        Self {
            id: TokenId(0),
            name: String::new(),
            parent: None,
            children: BTreeMap::new(),
            node: Some(node),
            node_entered_at: Some(now),
            started_at: now,
            ended_at: None,
            suspended: false,
            expects_join: false,
            lock_owner: None,
            lock_time: None,
        }
    }

    pub(crate) fn child(
        id: TokenId,
        name: String,
        parent: TokenId,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            name,
            parent: Some(parent),
            children: BTreeMap::new(),
            node: None,
            node_entered_at: None,
            started_at: now,
            ended_at: None,
            suspended: false,
            expects_join: false,
            lock_owner: None,
            lock_time: None,
        }
    }

    pub fn has_ended(&self) -> bool {
        self.ended_at.is_some()
    }

    pub fn is_locked(&self) -> bool {
        self.lock_owner.is_some()
    }

    /// First free child name: `base`, then `base2`, `base3`, ...
    /// The scan covers all children, ended included.
    pub(crate) fn next_child_name(&self, base: &str) -> String {
        if !self.children.contains_key(base) {
            return base.to_string();
        }
        let mut n = 2u32;
        loop {
            let candidate = format!("{}{}", base, n);
            if !self.children.contains_key(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    /// Advisory reservation. Relocking with the same owner is a no-op.
    pub(crate) fn lock(&mut self, owner: &str, now: DateTime<Utc>) -> Result<()> {
        match &self.lock_owner {
            Some(current) if current == owner => Ok(()),
            Some(current) => Err(EngineError::State(format!(
                "Token {} is locked by '{}'",
                self.id, current
            ))),
            None => {
                self.lock_owner = Some(owner.to_string());
                self.lock_time = Some(now);
                Ok(())
            }
        }
    }

    /// Releasing requires the matching owner; unlocking an unlocked token
    /// is a no-op.
    pub(crate) fn unlock(&mut self, owner: &str) -> Result<()> {
        match &self.lock_owner {
            None => Ok(()),
            Some(current) if current == owner => {
                self.lock_owner = None;
                self.lock_time = None;
                Ok(())
            }
            Some(current) => Err(EngineError::State(format!(
                "Token {} is locked by '{}', not by '{}'",
                self.id, current, owner
            ))),
        }
    }
}
