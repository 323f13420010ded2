use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::graph::ProcessDefinition;
use crate::services::VariableResolver;

use super::token::{Token, TokenId};

/// One enactment of a process definition: the token tree, its variables,
/// and the instance-level lifecycle stamps. Persisted as a single aggregate
/// with one optimistic version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessInstance {
    pub id: Uuid,
    pub definition_id: Uuid,
    /// Optimistic concurrency stamp; bumped by the store on commit.
    pub version: i64,
    pub root: TokenId,
    tokens: Vec<Token>,
    variables: VariableScope,
    pub suspended: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl ProcessInstance {
    /// Creates the instance with its root token placed at the start node.
    /// The first signal moves it; nothing is executed here.
    pub fn new(definition: &ProcessDefinition) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            definition_id: definition.id,
            version: 0,
            root: TokenId(0),
            tokens: vec![Token::root(definition.start(), now)],
            variables: VariableScope::default(),
            suspended: false,
            started_at: now,
            ended_at: None,
        }
    }

    pub fn has_ended(&self) -> bool {
        self.ended_at.is_some()
    }

    pub fn token(&self, id: TokenId) -> Result<&Token> {
        self.tokens.get(id.index()).ok_or_else(|| EngineError::State(format!(
            "Unknown token {} in instance {}",
            id, self.id
        )))
    }

    pub fn token_mut(&mut self, id: TokenId) -> Result<&mut Token> {
        let instance = self.id;
        self.tokens.get_mut(id.index()).ok_or_else(|| {
            EngineError::State(format!("Unknown token {} in instance {}", id, instance))
        })
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    /// Live (un-ended) children of a token, in child-map order.
    pub fn live_children(&self, parent: TokenId) -> Vec<TokenId> {
        let Ok(p) = self.token(parent) else {
            return Vec::new();
        };
        p.children
            .values()
            .copied()
            .filter(|id| self.token(*id).map(|t| !t.has_ended()).unwrap_or(false))
            .collect()
    }

    pub(crate) fn new_child(&mut self, parent: TokenId, name: String) -> Result<TokenId> {
        let id = TokenId(self.tokens.len() as u32);
        let now = Utc::now();
        self.token(parent)?;
        self.tokens.push(Token::child(id, name.clone(), parent, now));
        self.token_mut(parent)?.children.insert(name, id);
        Ok(id)
    }

    /// Hierarchical address of a token, `/` for the root, `/b2/c` for
    /// nested fork children.
    pub fn token_path(&self, id: TokenId) -> Result<String> {
        let mut parts = Vec::new();
        let mut cur = self.token(id)?;
        while let Some(parent) = cur.parent {
            parts.push(cur.name.clone());
            cur = self.token(parent)?;
        }
        if parts.is_empty() {
            return Ok("/".to_string());
        }
        parts.reverse();
        Ok(format!("/{}", parts.join("/")))
    }

    /// Address lookup: `/` anchors at the root, `.` and `..` are honored,
    /// other segments name children (fork-loop suffixes included).
    pub fn resolve(&self, base: TokenId, path: &str) -> Result<TokenId> {
        let mut cur = if path.starts_with('/') { self.root } else { base };
        for seg in path.split('/').filter(|s| !s.is_empty()) {
            match seg {
                "." => {}
                ".." => {
                    cur = self.token(cur)?.parent.ok_or_else(|| {
                        EngineError::State(format!(
                            "Token '{}' has no parent",
                            self.token_path(cur).unwrap_or_default()
                        ))
                    })?;
                }
                name => {
                    cur = self
                        .token(cur)?
                        .children
                        .get(name)
                        .copied()
                        .ok_or_else(|| {
                            EngineError::State(format!(
                                "No child token '{}' under '{}'",
                                name,
                                self.token_path(cur).unwrap_or_default()
                            ))
                        })?;
                }
            }
        }
        Ok(cur)
    }

    /// Read a variable visible from a token, walking up its ancestry.
    pub fn variable(&self, token: TokenId, name: &str) -> Option<&Value> {
        let mut cur = Some(token);
        while let Some(id) = cur {
            if let Some(v) = self.variables.get(id, name) {
                return Some(v);
            }
            cur = self.token(id).ok().and_then(|t| t.parent);
        }
        None
    }

    /// Write through to the closest ancestor scope already declaring the
    /// name, else the root scope.
    pub fn set_variable(&mut self, token: TokenId, name: &str, value: Value) -> Result<()> {
        let mut cur = token;
        loop {
            if self.variables.get(cur, name).is_some() {
                self.variables.set(cur, name, value);
                return Ok(());
            }
            match self.token(cur)?.parent {
                Some(p) => cur = p,
                None => {
                    self.variables.set(cur, name, value);
                    return Ok(());
                }
            }
        }
    }

    /// Declare a variable on this token, shadowing outer scopes.
    pub fn set_variable_local(&mut self, token: TokenId, name: &str, value: Value) -> Result<()> {
        self.token(token)?;
        self.variables.set(token, name, value);
        Ok(())
    }

    /// Flips the instance-level flag and cascades it to every live token.
    pub(crate) fn set_suspended(&mut self, suspended: bool) {
        self.suspended = suspended;
        for t in &mut self.tokens {
            if !t.has_ended() {
                t.suspended = suspended;
            }
        }
    }

    /// All variables visible from a token; inner scopes shadow outer ones.
    pub fn visible_variables(&self, token: TokenId) -> BTreeMap<String, Value> {
        let mut chain = Vec::new();
        let mut cur = Some(token);
        while let Some(id) = cur {
            chain.push(id);
            cur = self.token(id).ok().and_then(|t| t.parent);
        }
        let mut out = BTreeMap::new();
        // outermost first, so inner writes win
        for id in chain.into_iter().rev() {
            for (k, v) in self.variables.scope(id) {
                out.insert(k.clone(), v.clone());
            }
        }
        out
    }
}

/// Per-token variable maps. Plain storage; visibility rules live on
/// [`ProcessInstance`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct VariableScope {
    scopes: BTreeMap<TokenId, BTreeMap<String, Value>>,
}

impl VariableScope {
    fn get(&self, token: TokenId, name: &str) -> Option<&Value> {
        self.scopes.get(&token).and_then(|m| m.get(name))
    }

    fn set(&mut self, token: TokenId, name: &str, value: Value) {
        self.scopes
            .entry(token)
            .or_default()
            .insert(name.to_string(), value);
    }

    fn scope(&self, token: TokenId) -> impl Iterator<Item = (&String, &Value)> {
        self.scopes.get(&token).into_iter().flat_map(|m| m.iter())
    }
}

/// Variable view handed to expression evaluation, scoped to one token.
pub struct TokenVariables<'a> {
    pub instance: &'a ProcessInstance,
    pub token: TokenId,
}

impl VariableResolver for TokenVariables<'_> {
    fn get(&self, name: &str) -> Option<Value> {
        self.instance.variable(self.token, name).cloned()
    }

    fn names(&self) -> Vec<String> {
        self.instance
            .visible_variables(self.token)
            .into_keys()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ProcessDefinitionBuilder;
    use serde_json::json;

    fn two_level_instance() -> (ProcessInstance, TokenId) {
        let def = ProcessDefinitionBuilder::new("p")
            .start_node("start")
            .transition_to("end")
            .end("end")
            .build()
            .unwrap();
        let mut instance = ProcessInstance::new(&def);
        let child = instance.new_child(instance.root, "b".to_string()).unwrap();
        (instance, child)
    }

    #[test]
    fn test_variable_reads_walk_ancestry() {
        let (mut instance, child) = two_level_instance();
        let root = instance.root;
        instance.set_variable(root, "amount", json!(10)).unwrap();
        assert_eq!(instance.variable(child, "amount"), Some(&json!(10)));
    }

    #[test]
    fn test_writes_go_to_owning_scope() {
        let (mut instance, child) = two_level_instance();
        let root = instance.root;
        instance.set_variable(root, "amount", json!(10)).unwrap();
        // child write lands on the root scope that declares the name
        instance.set_variable(child, "amount", json!(20)).unwrap();
        assert_eq!(instance.variable(root, "amount"), Some(&json!(20)));
    }

    #[test]
    fn test_local_variables_shadow() {
        let (mut instance, child) = two_level_instance();
        let root = instance.root;
        instance.set_variable(root, "amount", json!(10)).unwrap();
        instance
            .set_variable_local(child, "amount", json!(99))
            .unwrap();
        assert_eq!(instance.variable(child, "amount"), Some(&json!(99)));
        assert_eq!(instance.variable(root, "amount"), Some(&json!(10)));
        let visible = instance.visible_variables(child);
        assert_eq!(visible.get("amount"), Some(&json!(99)));
    }

    #[test]
    fn test_resolve_paths() {
        let (mut instance, child) = two_level_instance();
        let grandchild = instance.new_child(child, "c".to_string()).unwrap();
        let root = instance.root;

        assert_eq!(instance.resolve(root, "/").unwrap(), root);
        assert_eq!(instance.resolve(root, "b").unwrap(), child);
        assert_eq!(instance.resolve(root, "/b/c").unwrap(), grandchild);
        assert_eq!(instance.resolve(grandchild, "..").unwrap(), child);
        assert_eq!(instance.resolve(grandchild, "../.").unwrap(), child);
        assert_eq!(instance.resolve(child, "/").unwrap(), root);
        assert!(instance.resolve(root, "missing").is_err());
        assert!(instance.resolve(root, "..").is_err());

        assert_eq!(instance.token_path(grandchild).unwrap(), "/b/c");
        assert_eq!(instance.token_path(root).unwrap(), "/");
    }
}
