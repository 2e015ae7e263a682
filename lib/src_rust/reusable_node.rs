//! A cursor over the previous tree, pointing at the next subtree that the
//! parser may be able to reuse.

use crate::subtree::Subtree;

#[derive(Debug)]
struct StackEntry {
    tree: Subtree,
    child_index: usize,
    byte_offset: u32,
}

#[derive(Debug, Default)]
pub struct ReusableNode {
    stack: Vec<StackEntry>,
    last_external_token: Option<Subtree>,
}

impl ReusableNode {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            stack: Vec::new(),
            last_external_token: None,
        }
    }

    /// Point at the first child of `tree`. The root itself is never
    /// reused, because accepting a tree rewrites its children.
    pub fn reset(&mut self, tree: Subtree) {
        self.stack.clear();
        self.stack.push(StackEntry {
            tree,
            child_index: 0,
            byte_offset: 0,
        });
        if !self.descend() {
            self.clear();
        }
    }

    pub fn clear(&mut self) {
        self.stack.clear();
        self.last_external_token = None;
    }

    #[must_use]
    pub fn tree(&self) -> Option<&Subtree> {
        self.stack.last().map(|entry| &entry.tree)
    }

    /// The start of the current subtree, including its padding.
    #[must_use]
    pub fn byte_offset(&self) -> u32 {
        self.stack.last().map_or(u32::MAX, |entry| entry.byte_offset)
    }

    /// The last external token before the current subtree.
    #[must_use]
    pub const fn last_external_token(&self) -> Option<&Subtree> {
        self.last_external_token.as_ref()
    }

    /// Move to the next sibling, or to the next sibling of the nearest
    /// ancestor that has one.
    pub fn advance(&mut self) {
        let Some(last_entry) = self.stack.last() else {
            return;
        };
        let byte_offset = last_entry.byte_offset + last_entry.tree.total_bytes();
        if last_entry.tree.has_external_tokens() {
            self.last_external_token = last_entry.tree.last_external_token().cloned();
        }

        loop {
            let Some(popped) = self.stack.pop() else {
                return;
            };
            let next_index = popped.child_index + 1;
            let Some(parent) = self.stack.last() else {
                return;
            };
            if let Some(next) = parent.tree.children().get(next_index) {
                let tree = next.clone();
                self.stack.push(StackEntry {
                    tree,
                    child_index: next_index,
                    byte_offset,
                });
                return;
            }
        }
    }

    /// Move to the first child of the current subtree, if it has one.
    pub fn descend(&mut self) -> bool {
        let Some(last_entry) = self.stack.last() else {
            return false;
        };
        let Some(first_child) = last_entry.tree.children().first() else {
            return false;
        };
        let entry = StackEntry {
            tree: first_child.clone(),
            child_index: 0,
            byte_offset: last_entry.byte_offset,
        };
        self.stack.push(entry);
        true
    }

    pub fn advance_past_leaf(&mut self) {
        while self.descend() {}
        self.advance();
    }
}
