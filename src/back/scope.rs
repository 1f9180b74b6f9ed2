//! The scope manager.
//!
//! Tracks the stack-offset model during code generation: a stack of
//! scopes (one per active checkpoint pair), the function's parameter
//! names, and the running total of slots reserved by every scope still in
//! effect.  Locals sit at negative offsets from the frame pointer;
//! parameters fall back to positive offsets (`index + 2`, past the saved
//! frame pointer and the return address).
//!
//! A variable only becomes visible to [ScopeManager::lookup] once its
//! declaring statement has run ([ScopeManager::mark_initialized]); until
//! then lookups fall through to outer scopes, which is how inner
//! shadowing resolves to the outer binding before the inner declaration
//! executes.

use crate::common::{id, Diagnostic, ErrorKind, Id, Map};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VariableInfo {
    /// Negative, in word slots below the frame pointer.
    pub offset: i64,
    /// Set when the declaring statement executes; invisible to lookups
    /// until then.
    pub initialized: bool,
    /// 1 for scalars and pointers, the struct size for struct values.
    pub size: usize,
}

/// Where a name resolved to: a local slot or a parameter slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VarLocation {
    pub offset: i64,
    pub size: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Scope {
    /// The checkpoint id this scope was entered with; verified against
    /// the end marker when the scope is left.
    pub id: Id,
    pub vars: Map<Id, VariableInfo>,
    /// `total_allocated` before this scope was entered; restored on exit.
    prev_allocated: i64,
}

/// A deep copy of the whole scope stack, used to pin the state a block
/// sees on entry.
pub type Snapshot = ScopeManager;

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct ScopeManager {
    scopes: Vec<Scope>,
    params: Vec<Id>,
    total_allocated: i64,
}

impl ScopeManager {
    pub fn new(params: Vec<Id>) -> Self {
        ScopeManager {
            scopes: Vec::new(),
            params,
            total_allocated: 0,
        }
    }

    /// Slots currently reserved by every active scope; this is the `N` of
    /// the cumulative `add sp, N` a return path must emit.
    pub fn total_allocated(&self) -> i64 {
        self.total_allocated
    }

    pub fn depth(&self) -> usize {
        self.scopes.len()
    }

    /// Enter a checkpoint scope, assigning consecutive downward offsets
    /// to its variables.  The first variable lands just below everything
    /// already allocated.
    pub fn enter_scope(&mut self, scope_id: Id, names: &[Id], sizes: &[usize]) {
        let prev_allocated = self.total_allocated;
        let mut vars = Map::new();
        for (name, size) in names.iter().zip(sizes) {
            self.total_allocated += *size as i64;
            vars.insert(
                *name,
                VariableInfo {
                    offset: -self.total_allocated,
                    initialized: false,
                    size: *size,
                },
            );
        }
        self.scopes.push(Scope {
            id: scope_id,
            vars,
            prev_allocated,
        });
    }

    /// Leave the innermost scope, verifying it matches the end marker.
    /// Returns how many slots the matching `add sp` must release; this is
    /// the delta against the scope's entry state, so dynamically declared
    /// slots (see [Self::declare_function_variable]) stay balanced.
    pub fn exit_scope(&mut self, expected_id: Id) -> Result<i64, Diagnostic> {
        let scope = self.scopes.pop().ok_or_else(|| {
            Diagnostic::new(
                ErrorKind::ScopeStackMismatch,
                format!("no open scope to close for checkpoint '{expected_id}'"),
            )
        })?;
        if scope.id != expected_id {
            return Err(Diagnostic::new(
                ErrorKind::ScopeStackMismatch,
                format!(
                    "checkpoint '{expected_id}' closes scope '{}'",
                    scope.id
                ),
            ));
        }
        let released = self.total_allocated - scope.prev_allocated;
        self.total_allocated = scope.prev_allocated;
        Ok(released)
    }

    /// Reserve one slot in the function's root scope, for declarations no
    /// checkpoint accounted for (the `for`-loop init is the usual case).
    /// Idempotent: re-declaring returns the existing slot.  The second
    /// element reports whether the slot is fresh (and so needs a `sub sp`
    /// at the declaration site).
    pub fn declare_function_variable(&mut self, name: Id) -> (i64, bool) {
        if self.scopes.is_empty() {
            self.enter_scope(id("root"), &[], &[]);
        }
        if let Some(info) = self.scopes[0].vars.get(&name) {
            return (info.offset, false);
        }
        self.total_allocated += 1;
        let offset = -self.total_allocated;
        self.scopes[0].vars.insert(
            name,
            VariableInfo {
                offset,
                initialized: false,
                size: 1,
            },
        );
        (offset, true)
    }

    /// Flip the first matching entry, innermost outward, to initialized.
    /// This is the point at which the variable becomes visible.
    pub fn mark_initialized(&mut self, name: Id) -> bool {
        for scope in self.scopes.iter_mut().rev() {
            if let Some(info) = scope.vars.get_mut(&name) {
                info.initialized = true;
                return true;
            }
        }
        false
    }

    /// Innermost-first search, skipping entries whose declaration has not
    /// executed; falls back to the parameter slots.
    pub fn lookup(&self, name: Id) -> Option<VarLocation> {
        for scope in self.scopes.iter().rev() {
            if let Some(info) = scope.vars.get(&name) {
                if info.initialized {
                    return Some(VarLocation {
                        offset: info.offset,
                        size: info.size,
                    });
                }
            }
        }
        // The call site leaves the return address at sp+0 and the saved
        // frame pointer below it, so parameter i sits at bp + 2 + i.
        self.params.iter().position(|p| *p == name).map(|index| {
            VarLocation {
                offset: index as i64 + 2,
                size: 1,
            }
        })
    }

    /// Like [Self::lookup] but including not-yet-initialized entries;
    /// declaration statements use this to find their own slot.
    pub fn lookup_declared(&self, name: Id) -> Option<VarLocation> {
        for scope in self.scopes.iter().rev() {
            if let Some(info) = scope.vars.get(&name) {
                return Some(VarLocation {
                    offset: info.offset,
                    size: info.size,
                });
            }
        }
        None
    }

    pub fn save_snapshot(&self) -> Snapshot {
        self.clone()
    }

    pub fn restore_snapshot(&mut self, snapshot: Snapshot) {
        *self = snapshot;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<Id> {
        names.iter().map(|n| id(n)).collect()
    }

    #[test]
    fn offsets_grow_downward_and_contiguously() {
        let mut sm = ScopeManager::new(Vec::new());
        sm.enter_scope(id("scope_0"), &ids(&["x", "y"]), &[1, 1]);
        sm.mark_initialized(id("x"));
        sm.mark_initialized(id("y"));
        assert_eq!(sm.lookup(id("x")).unwrap().offset, -1);
        assert_eq!(sm.lookup(id("y")).unwrap().offset, -2);
        assert_eq!(sm.total_allocated(), 2);
    }

    #[test]
    fn struct_values_take_their_size() {
        let mut sm = ScopeManager::new(Vec::new());
        sm.enter_scope(id("scope_0"), &ids(&["p", "q"]), &[3, 1]);
        sm.mark_initialized(id("p"));
        sm.mark_initialized(id("q"));
        assert_eq!(sm.lookup(id("p")).unwrap().offset, -3);
        assert_eq!(sm.lookup(id("p")).unwrap().size, 3);
        assert_eq!(sm.lookup(id("q")).unwrap().offset, -4);
    }

    #[test]
    fn uninitialized_shadow_resolves_to_outer() {
        let mut sm = ScopeManager::new(Vec::new());
        sm.enter_scope(id("scope_0"), &ids(&["x"]), &[1]);
        sm.mark_initialized(id("x"));
        sm.enter_scope(id("scope_1"), &ids(&["x"]), &[1]);
        // the inner x exists but has not executed its declaration yet
        assert_eq!(sm.lookup(id("x")).unwrap().offset, -1);
        sm.mark_initialized(id("x"));
        assert_eq!(sm.lookup(id("x")).unwrap().offset, -2);
    }

    #[test]
    fn parameters_fall_back_past_the_frame() {
        let mut sm = ScopeManager::new(ids(&["a", "b"]));
        sm.enter_scope(id("scope_0"), &[], &[]);
        assert_eq!(sm.lookup(id("a")).unwrap().offset, 2);
        assert_eq!(sm.lookup(id("b")).unwrap().offset, 3);
        assert_eq!(sm.lookup(id("nope")), None);
    }

    #[test]
    fn locals_shadow_parameters_only_once_initialized() {
        let mut sm = ScopeManager::new(ids(&["n"]));
        sm.enter_scope(id("scope_0"), &ids(&["n"]), &[1]);
        assert_eq!(sm.lookup(id("n")).unwrap().offset, 2);
        sm.mark_initialized(id("n"));
        assert_eq!(sm.lookup(id("n")).unwrap().offset, -1);
    }

    #[test]
    fn exit_restores_the_allocation_level() {
        let mut sm = ScopeManager::new(Vec::new());
        sm.enter_scope(id("scope_0"), &ids(&["x"]), &[1]);
        sm.enter_scope(id("scope_1"), &ids(&["y", "z"]), &[1, 1]);
        assert_eq!(sm.total_allocated(), 3);
        assert_eq!(sm.exit_scope(id("scope_1")).unwrap(), 2);
        assert_eq!(sm.total_allocated(), 1);
    }

    #[test]
    fn mismatched_checkpoint_is_fatal() {
        let mut sm = ScopeManager::new(Vec::new());
        sm.enter_scope(id("scope_0"), &[], &[]);
        let err = sm.exit_scope(id("scope_9")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ScopeStackMismatch);
    }

    #[test]
    fn function_variable_is_idempotent() {
        let mut sm = ScopeManager::new(Vec::new());
        sm.enter_scope(id("scope_0"), &ids(&["x"]), &[1]);
        sm.enter_scope(id("scope_1"), &[], &[]);
        let (offset, fresh) = sm.declare_function_variable(id("i"));
        assert_eq!(offset, -2);
        assert!(fresh);
        let (again, fresh) = sm.declare_function_variable(id("i"));
        assert_eq!(again, -2);
        assert!(!fresh);
        // the inner scope's exit releases the dynamic slot too
        assert_eq!(sm.exit_scope(id("scope_1")).unwrap(), 1);
    }

    #[test]
    fn snapshot_round_trip_is_bit_for_bit() {
        let mut sm = ScopeManager::new(ids(&["n"]));
        sm.enter_scope(id("scope_0"), &ids(&["x"]), &[1]);
        sm.mark_initialized(id("x"));
        let saved = sm.save_snapshot();
        sm.enter_scope(id("scope_1"), &ids(&["y"]), &[2]);
        sm.mark_initialized(id("y"));
        sm.exit_scope(id("scope_1")).unwrap();
        sm.restore_snapshot(saved.clone());
        assert_eq!(sm, saved);
    }
}
