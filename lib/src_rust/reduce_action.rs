//! The set of distinct reductions available in a state, gathered when the
//! parser explores every reduction during error handling.

use crate::language::Symbol;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReduceAction {
    pub count: u32,
    pub symbol: Symbol,
    pub dynamic_precedence: i32,
    pub production_id: u16,
}

#[derive(Debug, Default)]
pub struct ReduceActionSet {
    actions: Vec<ReduceAction>,
}

impl ReduceActionSet {
    /// Add an action unless one with the same symbol and child count is
    /// already present.
    pub fn add(&mut self, new_action: ReduceAction) {
        let is_duplicate = self
            .actions
            .iter()
            .any(|action| action.symbol == new_action.symbol && action.count == new_action.count);
        if !is_duplicate {
            self.actions.push(new_action);
        }
    }

    pub fn clear(&mut self) {
        self.actions.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<ReduceAction> {
        self.actions.get(index).copied()
    }
}
