use std::collections::HashMap;

use crate::channel::types::Bindings;

/// Saved top-level bindings, one table per scope name.
///
/// A scope is the only state a pod keeps between two executions.
#[derive(Debug, Default)]
pub struct ScopeTable {
    scopes: HashMap<String, Bindings>,
}

impl ScopeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Environment for one execution: the saved bindings of `scope`, overlaid by `inputs`.
    pub fn environment(&self, scope: Option<&str>, inputs: Bindings) -> Bindings {
        let mut env = scope
            .and_then(|name| self.scopes.get(name))
            .cloned()
            .unwrap_or_default();
        for (name, value) in inputs {
            env.insert(name, value);
        }
        env
    }

    /// Replaces the saved bindings of `scope`.
    pub fn save(&mut self, scope: &str, bindings: Bindings) {
        self.scopes.insert(scope.to_string(), bindings);
    }

    pub fn get(&self, scope: &str) -> Option<&Bindings> {
        self.scopes.get(scope)
    }

    /// Forgets a scope, returning whether it existed.
    pub fn clear(&mut self, scope: &str) -> bool {
        self.scopes.remove(scope).is_some()
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bindings(value: serde_json::Value) -> Bindings {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn inputs_override_saved_bindings() {
        let mut table = ScopeTable::new();
        table.save("notebook", bindings(json!({"x": 1, "y": 2})));

        let env = table.environment(Some("notebook"), bindings(json!({"y": 20, "z": 30})));
        assert_eq!(env.get("x"), Some(&json!(1)));
        assert_eq!(env.get("y"), Some(&json!(20)));
        assert_eq!(env.get("z"), Some(&json!(30)));
    }

    #[test]
    fn unscoped_or_unknown_scope_sees_only_inputs() {
        let mut table = ScopeTable::new();
        table.save("a", bindings(json!({"x": 1})));

        let env = table.environment(None, bindings(json!({"q": true})));
        assert_eq!(env.len(), 1);
        let env = table.environment(Some("b"), Bindings::new());
        assert!(env.is_empty());
    }

    #[test]
    fn save_replaces_and_clear_forgets() {
        let mut table = ScopeTable::new();
        table.save("a", bindings(json!({"x": 1})));
        table.save("a", bindings(json!({"y": 2})));
        assert_eq!(table.get("a"), Some(&bindings(json!({"y": 2}))));
        assert_eq!(table.len(), 1);

        assert!(table.clear("a"));
        assert!(!table.clear("a"));
        assert!(table.is_empty());
    }
}
