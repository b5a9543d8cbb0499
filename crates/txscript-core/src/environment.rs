//! Variable scopes.
//!
//! The global scope is shared by every task of a run and lives behind the
//! run's turn mutex. Local scopes (blocks, function calls, handler
//! activations) belong to a single task and are kept in that task's
//! [`Environment`] arena, addressed by [`ScopeId`]. A local scope whose
//! parent is `None` chains directly to the global scope.

use std::collections::HashMap;

use crate::value::RuntimeValue;

pub type ScopeId = usize;

/// The single global scope of a run.
#[derive(Debug, Default)]
pub struct GlobalScope {
    bindings: HashMap<String, RuntimeValue>,
}

impl GlobalScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&RuntimeValue> {
        self.bindings.get(name)
    }

    pub fn define(&mut self, name: impl Into<String>, value: RuntimeValue) {
        self.bindings.insert(name.into(), value);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }

    /// Sorted copy of every binding, for inspection after a run.
    pub fn snapshot(&self) -> Vec<(String, RuntimeValue)> {
        let mut vars: Vec<_> = self.bindings.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        vars
    }
}

#[derive(Debug)]
struct Scope {
    bindings: HashMap<String, RuntimeValue>,
    parent: Option<ScopeId>,
}

/// Per-task arena of local scopes.
///
/// Scopes are strictly nested: a scope is always popped before its parent,
/// so popping truncates the arena.
#[derive(Debug, Default)]
pub struct Environment {
    scopes: Vec<Scope>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depth(&self) -> usize {
        self.scopes.len()
    }

    /// Opens a scope. Pass the current scope for a block, `None` for a
    /// function call or handler activation.
    pub fn push_scope(&mut self, parent: Option<ScopeId>) -> ScopeId {
        self.scopes.push(Scope { bindings: HashMap::new(), parent });
        self.scopes.len() - 1
    }

    /// Discards `scope` and everything opened after it.
    pub fn pop_scope(&mut self, scope: ScopeId) {
        self.scopes.truncate(scope);
    }

    /// Binds `name` in `scope` (or the global scope for `None`), shadowing
    /// any outer binding.
    pub fn define(&mut self, scope: Option<ScopeId>, name: &str, value: RuntimeValue, globals: &mut GlobalScope) {
        match scope {
            Some(id) => {
                self.scopes[id].bindings.insert(name.to_string(), value);
            }
            None => globals.define(name, value),
        }
    }

    pub fn lookup(&self, scope: Option<ScopeId>, name: &str, globals: &GlobalScope) -> Option<RuntimeValue> {
        let mut current = scope;
        while let Some(id) = current {
            let s = &self.scopes[id];
            if let Some(v) = s.bindings.get(name) {
                return Some(v.clone());
            }
            current = s.parent;
        }
        globals.get(name).cloned()
    }

    /// Updates the nearest existing binding of `name`. Returns `false` if no
    /// scope on the chain defines it.
    pub fn assign(&mut self, scope: Option<ScopeId>, name: &str, value: RuntimeValue, globals: &mut GlobalScope) -> bool {
        let mut current = scope;
        while let Some(id) = current {
            if let Some(slot) = self.scopes[id].bindings.get_mut(name) {
                *slot = value;
                return true;
            }
            current = self.scopes[id].parent;
        }
        if globals.contains(name) {
            globals.define(name, value);
            return true;
        }
        false
    }
}
