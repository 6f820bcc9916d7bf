//! Per-kind monotonic identifier allocation.
//!
//! An [`IdScope`] mints ids that are unique within the scope for one
//! [`EntityKind`]. Cloning and merging pipeline fragments draws fresh ids from
//! the *destination's* scope, which is what keeps ids collision-free:
//!
//! ```
//! use vistrail::id_scope::{EntityKind, IdScope};
//!
//! let mut scope = IdScope::with_begin_id(10);
//! assert_eq!(scope.get_new_id(EntityKind::Function), 10);
//! assert_eq!(scope.get_new_id(EntityKind::Function), 11);
//! // kinds are independent
//! assert_eq!(scope.get_new_id(EntityKind::Module), 10);
//! ```
//!
//! A scope is plain data and is mutated through `&mut self`; sharing one
//! between threads means putting its owner behind a lock (see
//! [`SharedLog`](crate::log::SharedLog)).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The entity families that draw ids from a scope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKind {
    Module,
    Connection,
    Function,
    Parameter,
    Annotation,
    PortSpec,
    Location,
    Action,
    Operation,
    Machine,
    WorkflowExec,
    ItemExec,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdScope {
    begin_id: u64,
    next: HashMap<EntityKind, u64>,
}

impl IdScope {
    /// A scope whose ids start at zero for every kind.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A scope whose ids start at `begin_id` for every kind.
    #[must_use]
    pub fn with_begin_id(begin_id: u64) -> Self {
        Self {
            begin_id,
            next: HashMap::new(),
        }
    }

    /// Return a fresh id for `kind`, strictly greater than any issued before.
    pub fn get_new_id(&mut self, kind: EntityKind) -> u64 {
        let slot = self.next.entry(kind).or_insert(self.begin_id);
        let id = *slot;
        *slot += 1;
        id
    }

    /// Peek at the id the next call to [`get_new_id`](Self::get_new_id) returns.
    #[must_use]
    pub fn peek(&self, kind: EntityKind) -> u64 {
        self.next.get(&kind).copied().unwrap_or(self.begin_id)
    }

    /// Raise the next id for `kind` to at least `next_id`. Never lowers it.
    pub fn update_begin_id(&mut self, kind: EntityKind, next_id: u64) {
        let slot = self.next.entry(kind).or_insert(self.begin_id);
        if *slot < next_id {
            *slot = next_id;
        }
    }

    /// Make sure `existing` can never be returned again for `kind`.
    pub fn reserve(&mut self, kind: EntityKind, existing: u64) {
        self.update_begin_id(kind, existing + 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_strictly_increase_per_kind() {
        let mut scope = IdScope::new();
        let ids: Vec<u64> = (0..5).map(|_| scope.get_new_id(EntityKind::Annotation)).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
        assert_eq!(scope.get_new_id(EntityKind::Machine), 0);
    }

    #[test]
    fn update_never_lowers() {
        let mut scope = IdScope::with_begin_id(5);
        scope.update_begin_id(EntityKind::Module, 2);
        assert_eq!(scope.get_new_id(EntityKind::Module), 5);
        scope.reserve(EntityKind::Module, 40);
        assert_eq!(scope.get_new_id(EntityKind::Module), 41);
    }
}
