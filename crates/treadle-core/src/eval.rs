use std::collections::BTreeMap;

use rhai::{Dynamic, Engine, Map, Scope};
use serde_json::{json, Value};

use crate::error::BoxedError;
use crate::services::{ExpressionEvaluator, VariableResolver};

/// Default expression engine. Guards, decision expressions and script
/// actions run through rhai with the token's visible variables pushed
/// into the scope.
pub struct RhaiEvaluator {
    engine: Engine,
}

impl RhaiEvaluator {
    pub fn new() -> Self {
        Self {
            engine: Engine::new(),
        }
    }

    fn scope_for(&self, vars: &dyn VariableResolver) -> Scope<'static> {
        let mut scope = Scope::new();
        for name in vars.names() {
            if let Some(value) = vars.get(&name) {
                scope.push_dynamic(name, json_to_dynamic(&value));
            }
        }
        scope
    }
}

impl Default for RhaiEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpressionEvaluator for RhaiEvaluator {
    fn evaluate(
        &self,
        expr: &str,
        vars: &dyn VariableResolver,
    ) -> std::result::Result<Value, BoxedError> {
        let mut scope = self.scope_for(vars);
        let result = self
            .engine
            .eval_with_scope::<Dynamic>(&mut scope, expr)
            .map_err(|e| -> BoxedError { e })?;
        Ok(dynamic_to_json(result))
    }

    fn run_script(
        &self,
        script: &str,
        vars: &dyn VariableResolver,
    ) -> std::result::Result<BTreeMap<String, Value>, BoxedError> {
        let mut before = BTreeMap::new();
        for name in vars.names() {
            if let Some(value) = vars.get(&name) {
                before.insert(name, value);
            }
        }
        let mut scope = self.scope_for(vars);
        let _ = self
            .engine
            .eval_with_scope::<Dynamic>(&mut scope, script)
            .map_err(|e| -> BoxedError { e })?;

        // top-level lets persist in the scope, so the diff sees both
        // updated and newly introduced variables
        let mut changed = BTreeMap::new();
        for (name, _, value) in scope.iter() {
            let after = dynamic_to_json(value);
            if before.get(name) != Some(&after) {
                changed.insert(name.to_string(), after);
            }
        }
        Ok(changed)
    }
}

/// Guard semantics over evaluation results: null and zero and empty are
/// false, everything else is true.
pub(crate) fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(_) => true,
    }
}

/// Decision results compare against transition names as bare text.
pub(crate) fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn json_to_dynamic(value: &Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => (*b).into(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Dynamic::from_int(i)
            } else if let Some(f) = n.as_f64() {
                Dynamic::from_float(f)
            } else {
                Dynamic::UNIT
            }
        }
        Value::String(s) => s.clone().into(),
        Value::Array(items) => {
            Dynamic::from_array(items.iter().map(json_to_dynamic).collect())
        }
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                out.insert(k.clone().into(), json_to_dynamic(v));
            }
            Dynamic::from_map(out)
        }
    }
}

fn dynamic_to_json(value: Dynamic) -> Value {
    if value.is_unit() {
        Value::Null
    } else if value.is_bool() {
        Value::Bool(value.as_bool().unwrap_or(false))
    } else if value.is_int() {
        Value::from(value.as_int().unwrap_or(0))
    } else if value.is_float() {
        json!(value.as_float().unwrap_or(0.0))
    } else if value.is_string() {
        Value::String(value.into_string().unwrap_or_default())
    } else if value.is_array() {
        Value::Array(
            value
                .into_array()
                .unwrap_or_default()
                .into_iter()
                .map(dynamic_to_json)
                .collect(),
        )
    } else if value.is_map() {
        match value.try_cast::<Map>() {
            Some(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k.to_string(), dynamic_to_json(v)))
                    .collect(),
            ),
            None => Value::Null,
        }
    } else {
        Value::String(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MapResolver(BTreeMap<String, Value>);

    impl VariableResolver for MapResolver {
        fn get(&self, name: &str) -> Option<Value> {
            self.0.get(name).cloned()
        }

        fn names(&self) -> Vec<String> {
            self.0.keys().cloned().collect()
        }
    }

    fn vars(pairs: &[(&str, Value)]) -> MapResolver {
        MapResolver(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        )
    }

    #[test]
    fn test_guard_expressions() {
        let eval = RhaiEvaluator::new();
        let v = vars(&[("a", json!(4))]);
        assert_eq!(eval.evaluate("a > 1", &v).unwrap(), json!(true));
        assert_eq!(eval.evaluate("a == 0", &v).unwrap(), json!(false));
        assert_eq!(eval.evaluate("a <= 0", &v).unwrap(), json!(false));
    }

    #[test]
    fn test_decision_expression_yields_transition_name() {
        let eval = RhaiEvaluator::new();
        let v = vars(&[("a", json!(4))]);
        let result = eval
            .evaluate(r#"if a > 1 { "high" } else { "low" }"#, &v)
            .unwrap();
        assert_eq!(stringify(&result), "high");
    }

    #[test]
    fn test_run_script_reports_changed_variables() {
        let eval = RhaiEvaluator::new();
        let v = vars(&[("a", json!(1)), ("kept", json!("x"))]);
        let changed = eval
            .run_script("a = a + 1; let fresh = 10;", &v)
            .unwrap();
        assert_eq!(changed.get("a"), Some(&json!(2)));
        assert_eq!(changed.get("fresh"), Some(&json!(10)));
        assert!(!changed.contains_key("kept"));
    }

    #[test]
    fn test_evaluation_error_surfaces() {
        let eval = RhaiEvaluator::new();
        let v = vars(&[]);
        assert!(eval.evaluate("no_such_variable + 1", &v).is_err());
    }

    #[test]
    fn test_truthiness() {
        assert!(!truthy(&Value::Null));
        assert!(!truthy(&json!(false)));
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!("")));
        assert!(!truthy(&json!([])));
        assert!(truthy(&json!(7)));
        assert!(truthy(&json!("x")));
        assert!(truthy(&json!([1])));
        assert!(truthy(&json!({"k": 1})));
    }

    #[test]
    fn test_round_trip_of_structured_values() {
        let eval = RhaiEvaluator::new();
        let v = vars(&[("order", json!({"lines": [1, 2], "open": true}))]);
        assert_eq!(eval.evaluate("order.lines[1]", &v).unwrap(), json!(2));
        assert_eq!(eval.evaluate("order.open", &v).unwrap(), json!(true));
    }
}
