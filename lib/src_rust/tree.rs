//! A finished syntax tree: the root subtree together with the language and
//! the ranges it was parsed from.

use std::{fmt, io::Write, sync::Arc};

use crate::{
    get_changed_ranges::{changed_ranges, included_range_differences},
    language::Language,
    node::Node,
    point::{InputEdit, Range},
    subtree::Subtree,
    tree_cursor::{PreorderNodes, TreeCursor},
};

/// A syntax tree produced by a [`Parser`](crate::Parser).
///
/// Cloning a tree is cheap: the subtrees are shared, and are only copied
/// when one of the clones is edited.
#[derive(Clone)]
pub struct Tree {
    root: Subtree,
    language: Arc<Language>,
    included_ranges: Arc<[Range]>,
}

impl Tree {
    pub(crate) fn new(root: Subtree, language: Arc<Language>, included_ranges: Arc<[Range]>) -> Self {
        Self {
            root,
            language,
            included_ranges,
        }
    }

    pub(crate) const fn root(&self) -> &Subtree {
        &self.root
    }

    #[must_use]
    pub fn language(&self) -> &Language {
        &self.language
    }

    #[must_use]
    pub fn root_node(&self) -> Node<'_> {
        Node::new(self, &self.root, self.root.padding(), 0)
    }

    #[must_use]
    pub fn walk(&self) -> TreeCursor<'_> {
        self.root_node().walk()
    }

    /// Visit every visible node in document order.
    #[must_use]
    pub fn preorder(&self) -> PreorderNodes<'_> {
        PreorderNodes::new(self.walk())
    }

    /// Record an edit to the source text, so that this tree can be passed
    /// to the next parse as the old tree.
    pub fn edit(&mut self, edit: &InputEdit) {
        if self.included_ranges.iter().any(|range| range.end_byte > edit.start_byte) {
            let mut ranges = self.included_ranges.to_vec();
            for range in &mut ranges {
                range.edit(edit);
            }
            self.included_ranges = ranges.into();
        }
        self.root.edit(edit);
    }

    /// The ranges of the document whose syntactic structure differs between
    /// this tree, after editing, and `new_tree`, which was parsed from it.
    #[must_use]
    pub fn changed_ranges(&self, new_tree: &Self) -> impl ExactSizeIterator<Item = Range> {
        let differences =
            included_range_differences(&self.included_ranges, &new_tree.included_ranges);
        changed_ranges(&self.root, &new_tree.root, &self.language, &differences).into_iter()
    }

    #[must_use]
    pub fn included_ranges(&self) -> &[Range] {
        &self.included_ranges
    }

    /// The number of bytes covered by the tree, including leading padding.
    #[must_use]
    pub fn source_length(&self) -> u32 {
        self.root.total_bytes()
    }

    /// Write a graphviz DOT rendering of the tree.
    pub fn print_dot_graph(&self, f: &mut impl Write) -> std::io::Result<()> {
        self.root.print_dot_graph(&self.language, f)
    }

    /// Whether this tree can stand in for a parse of the same document
    /// with `language` and `included_ranges`, untouched.
    pub(crate) fn is_reusable_as_is(&self, language: &Arc<Language>, included_ranges: &[Range]) -> bool {
        Arc::ptr_eq(&self.language, language)
            && !self.root.has_changes()
            && *self.included_ranges == *included_ranges
    }
}

impl fmt::Debug for Tree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{Tree {:?}}}", self.root_node())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn trees_cross_threads() {
        assert_send_sync::<Tree>();
    }
}
