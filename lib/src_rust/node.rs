//! A read-only view of one syntax node within a [`Tree`].

use std::{fmt, ptr, str};

use crate::{
    language::{FieldId, Language, StateId, Symbol, BUILTIN_SYM_ERROR},
    length::Length,
    point::{Point, Range},
    subtree::{Subtree, TREE_STATE_NONE},
    tree::Tree,
    tree_cursor::TreeCursor,
};

/// A single node within a syntax [`Tree`].
///
/// Nodes are cheap to copy. Hidden nodes of the grammar are never exposed;
/// navigating passes through them to their visible descendants.
#[derive(Clone, Copy)]
pub struct Node<'tree> {
    tree: &'tree Tree,
    subtree: &'tree Subtree,
    position: Length,
    alias: Symbol,
}

/// Walks the children of a node, including hidden ones. `position` is the
/// end of the last child returned.
struct ChildIterator<'tree> {
    parent: Node<'tree>,
    position: Length,
    child_index: usize,
    structural_child_index: usize,
    alias_sequence: Option<&'tree [Symbol]>,
}

impl<'tree> Iterator for ChildIterator<'tree> {
    type Item = Node<'tree>;

    fn next(&mut self) -> Option<Self::Item> {
        let child = self.parent.subtree.children().get(self.child_index)?;
        let mut alias_symbol = 0;
        if !child.extra() {
            alias_symbol = self
                .alias_sequence
                .and_then(|sequence| sequence.get(self.structural_child_index))
                .copied()
                .unwrap_or(0);
            self.structural_child_index += 1;
        }
        if self.child_index > 0 {
            self.position += child.padding();
        }
        let node = Node::new(self.parent.tree, child, self.position, alias_symbol);
        self.position += child.size();
        self.child_index += 1;
        Some(node)
    }
}

impl<'tree> Node<'tree> {
    /// `position` is the start of the node's content, after its padding.
    pub(crate) const fn new(
        tree: &'tree Tree,
        subtree: &'tree Subtree,
        position: Length,
        alias: Symbol,
    ) -> Self {
        Self {
            tree,
            subtree,
            position,
            alias,
        }
    }

    pub(crate) const fn subtree(&self) -> &'tree Subtree {
        self.subtree
    }

    pub(crate) const fn position(&self) -> Length {
        self.position
    }

    pub(crate) const fn alias(&self) -> Symbol {
        self.alias
    }

    pub(crate) const fn tree(&self) -> &'tree Tree {
        self.tree
    }

    fn iterate_children(&self) -> ChildIterator<'tree> {
        ChildIterator {
            parent: *self,
            position: self.position,
            child_index: 0,
            structural_child_index: 0,
            alias_sequence: self
                .language()
                .alias_sequence(self.subtree.production_id()),
        }
    }

    fn is_relevant(&self, include_anonymous: bool) -> bool {
        if include_anonymous {
            self.subtree.visible() || self.alias != 0
        } else if self.alias != 0 {
            self.language().symbol_metadata(self.alias).named
        } else {
            self.subtree.visible() && self.subtree.named()
        }
    }

    fn relevant_child_count(&self, include_anonymous: bool) -> usize {
        if include_anonymous {
            self.child_count()
        } else {
            self.named_child_count()
        }
    }

    /// A numeric id for this node that is unique within its tree. Trees
    /// that share a subtree report the same id for it.
    #[must_use]
    pub fn id(&self) -> usize {
        self.subtree.id()
    }

    #[must_use]
    pub fn language(&self) -> &'tree Language {
        self.tree.language()
    }

    /// The node's type, as a numerical id. Aliased nodes report the alias.
    #[must_use]
    pub fn kind_id(&self) -> Symbol {
        if self.alias != 0 {
            self.alias
        } else {
            self.subtree.symbol()
        }
    }

    /// The node's type, as it appears in the grammar, ignoring aliases.
    #[must_use]
    pub fn grammar_id(&self) -> Symbol {
        self.subtree.symbol()
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        self.language().symbol_name(self.kind_id())
    }

    #[must_use]
    pub fn grammar_kind(&self) -> &'static str {
        self.language().symbol_name(self.grammar_id())
    }

    /// Named nodes correspond to named rules in the grammar; anonymous nodes
    /// correspond to string literals.
    #[must_use]
    pub fn is_named(&self) -> bool {
        if self.alias != 0 {
            self.language().symbol_metadata(self.alias).named
        } else {
            self.subtree.named()
        }
    }

    /// Extra nodes, like comments, may appear anywhere in the tree.
    #[must_use]
    pub fn is_extra(&self) -> bool {
        self.subtree.extra()
    }

    /// Missing nodes were inserted by the parser to recover from an error.
    #[must_use]
    pub fn is_missing(&self) -> bool {
        self.subtree.is_missing()
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.kind_id() == BUILTIN_SYM_ERROR
    }

    /// Whether this node or any of its descendants is a syntax error.
    #[must_use]
    pub fn has_error(&self) -> bool {
        self.subtree.error_cost() > 0
    }

    /// Whether this node has been edited since it was parsed.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.subtree.has_changes()
    }

    #[must_use]
    pub fn parse_state(&self) -> StateId {
        self.subtree.parse_state()
    }

    /// The parse state after this node, if it was parsed in a single state.
    #[must_use]
    pub fn next_parse_state(&self) -> Option<StateId> {
        let state = self.parse_state();
        (state != TREE_STATE_NONE)
            .then(|| self.language().next_state(state, self.grammar_id()))
    }

    #[must_use]
    pub const fn start_byte(&self) -> u32 {
        self.position.bytes
    }

    #[must_use]
    pub fn end_byte(&self) -> u32 {
        self.position.bytes + self.subtree.size().bytes
    }

    #[must_use]
    pub fn byte_range(&self) -> std::ops::Range<usize> {
        self.start_byte() as usize..self.end_byte() as usize
    }

    #[must_use]
    pub const fn start_position(&self) -> Point {
        self.position.extent
    }

    #[must_use]
    pub fn end_position(&self) -> Point {
        self.position.extent + self.subtree.size().extent
    }

    #[must_use]
    pub fn range(&self) -> Range {
        Range {
            start_byte: self.start_byte(),
            end_byte: self.end_byte(),
            start_point: self.start_position(),
            end_point: self.end_position(),
        }
    }

    /// The number of visible children.
    #[must_use]
    pub fn child_count(&self) -> usize {
        self.subtree.visible_child_count() as usize
    }

    #[must_use]
    pub fn named_child_count(&self) -> usize {
        self.subtree.named_child_count() as usize
    }

    /// The number of visible nodes in this subtree, including itself.
    #[must_use]
    pub fn descendant_count(&self) -> usize {
        self.subtree.visible_descendant_count() as usize + 1
    }

    fn child_impl(&self, mut child_index: usize, include_anonymous: bool) -> Option<Self> {
        let mut result = *self;
        let mut did_descend = true;

        while did_descend {
            did_descend = false;

            let mut index = 0;
            for child in result.iterate_children() {
                if child.is_relevant(include_anonymous) {
                    if index == child_index {
                        return Some(child);
                    }
                    index += 1;
                } else {
                    let grandchild_index = child_index - index;
                    let grandchild_count = child.relevant_child_count(include_anonymous);
                    if grandchild_index < grandchild_count {
                        did_descend = true;
                        result = child;
                        child_index = grandchild_index;
                        break;
                    }
                    index += grandchild_count;
                }
            }
        }

        None
    }

    /// The visible child at `index`, counting anonymous nodes.
    #[must_use]
    pub fn child(&self, index: usize) -> Option<Self> {
        self.child_impl(index, true)
    }

    #[must_use]
    pub fn named_child(&self, index: usize) -> Option<Self> {
        self.child_impl(index, false)
    }

    /// Iterate over the visible children, using `cursor` for the walk.
    pub fn children<'cursor>(
        &self,
        cursor: &'cursor mut TreeCursor<'tree>,
    ) -> impl ExactSizeIterator<Item = Node<'tree>> + 'cursor {
        cursor.reset(*self);
        cursor.goto_first_child();
        (0..self.child_count()).map(move |_| {
            let result = cursor.node();
            cursor.goto_next_sibling();
            result
        })
    }

    pub fn named_children<'cursor>(
        &self,
        cursor: &'cursor mut TreeCursor<'tree>,
    ) -> impl ExactSizeIterator<Item = Node<'tree>> + 'cursor {
        cursor.reset(*self);
        cursor.goto_first_child();
        (0..self.named_child_count()).map(move |_| {
            while !cursor.node().is_named() {
                if !cursor.goto_next_sibling() {
                    break;
                }
            }
            let result = cursor.node();
            cursor.goto_next_sibling();
            result
        })
    }

    #[must_use]
    pub fn child_by_field_name(&self, field_name: &str) -> Option<Self> {
        let field_id = self.language().field_id_for_name(field_name)?;
        self.child_by_field_id(field_id)
    }

    /// The first child stored in the given field. Fields inherited from
    /// hidden children are searched as well.
    #[must_use]
    pub fn child_by_field_id(&self, field_id: FieldId) -> Option<Self> {
        if field_id == 0 || self.child_count() == 0 {
            return None;
        }

        let mut field_map = self
            .language()
            .field_map(self.subtree.production_id())
            .iter()
            .filter(|entry| entry.field_id == field_id)
            .peekable();

        let mut structural_child_index = 0;
        for child in self.iterate_children() {
            if child.is_extra() {
                continue;
            }
            let index = structural_child_index;
            structural_child_index += 1;

            let entry = *field_map.peek()?;
            if index < usize::from(entry.child_index) {
                continue;
            }

            if entry.inherited {
                if let Some(result) = child.child_by_field_id(field_id) {
                    return Some(result);
                }
            } else if child.is_relevant(true) {
                return Some(child);
            } else if child.child_count() > 0 {
                return child.child(0);
            }
            field_map.next();
        }

        None
    }

    /// The name of the field holding the visible child at `index`.
    #[must_use]
    pub fn field_name_for_child(&self, index: usize) -> Option<&'static str> {
        let mut cursor = self.walk();
        if !cursor.goto_first_child() {
            return None;
        }
        for _ in 0..index {
            if !cursor.goto_next_sibling() {
                return None;
            }
        }
        cursor.field_name()
    }

    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        let mut node = self.tree.root_node();
        if node.id() == self.id() {
            return None;
        }

        while let Some(next_node) = node.child_with_descendant(*self) {
            if next_node.id() == self.id() {
                break;
            }
            node = next_node;
        }

        Some(node)
    }

    /// The child of this node that contains `descendant`, or `descendant`
    /// itself if it is a child.
    #[must_use]
    pub fn child_with_descendant(&self, descendant: Self) -> Option<Self> {
        let start_byte = descendant.start_byte();
        let end_byte = descendant.end_byte();
        let is_empty = start_byte == end_byte;

        let mut node = *self;
        loop {
            let mut iterator = node.iterate_children();
            loop {
                let child = iterator.next()?;
                if child.start_byte() > start_byte {
                    return None;
                }
                node = child;
                if node.id() == descendant.id() {
                    return Some(node);
                }

                // An empty descendant at the end of this child may still be
                // inside it.
                if is_empty && iterator.position.bytes >= end_byte && node.child_count() > 0 {
                    if let Some(child) = node.child_with_descendant(descendant) {
                        return Some(if node.is_relevant(true) { node } else { child });
                    }
                }

                let before_target = if is_empty {
                    iterator.position.bytes <= end_byte
                } else {
                    iterator.position.bytes < end_byte
                };
                if !before_target && node.child_count() > 0 {
                    break;
                }
            }

            if node.is_relevant(true) {
                return Some(node);
            }
        }
    }

    fn next_sibling_impl(&self, include_anonymous: bool) -> Option<Self> {
        let start_byte = self.start_byte();
        let target_end_byte = self.end_byte();
        let is_empty = start_byte == target_end_byte;

        let mut node = self.parent();
        let mut later_node: Option<Self> = None;
        let mut later_node_is_relevant = false;

        while let Some(current) = node {
            let mut later_child: Option<Self> = None;
            let mut later_child_is_relevant = false;
            let mut child_containing_target: Option<Self> = None;

            let mut iterator = current.iterate_children();
            while let Some(child) = iterator.next() {
                if iterator.position.bytes <= target_end_byte {
                    continue;
                }
                let child_start_byte = child.start_byte();
                let contains_target = if is_empty {
                    child_start_byte < start_byte
                } else {
                    child_start_byte <= start_byte
                };

                if contains_target {
                    if child.id() != self.id() {
                        child_containing_target = Some(child);
                    }
                } else if child.is_relevant(include_anonymous) {
                    later_child = Some(child);
                    later_child_is_relevant = true;
                    break;
                } else if child.relevant_child_count(include_anonymous) > 0 {
                    later_child = Some(child);
                    later_child_is_relevant = false;
                    break;
                }
            }

            if child_containing_target.is_some() {
                if later_child.is_some() {
                    later_node = later_child;
                    later_node_is_relevant = later_child_is_relevant;
                }
                node = child_containing_target;
            } else if later_child_is_relevant {
                return later_child;
            } else if later_child.is_some() {
                node = later_child;
            } else if later_node_is_relevant {
                return later_node;
            } else {
                node = later_node.take();
            }
        }

        None
    }

    /// Whether `other` is among the empty nodes at the end of `tree`.
    fn has_trailing_empty_descendant(tree: &Subtree, other: &Subtree) -> bool {
        for child in tree.children().iter().rev() {
            if child.total_bytes() > 0 {
                break;
            }
            if ptr::eq(child, other) || Self::has_trailing_empty_descendant(child, other) {
                return true;
            }
        }
        false
    }

    fn prev_sibling_impl(&self, include_anonymous: bool) -> Option<Self> {
        let self_is_empty = self.subtree.total_bytes() == 0;
        let target_end_byte = self.end_byte();

        let mut node = self.parent();
        let mut earlier_node: Option<Self> = None;
        let mut earlier_node_is_relevant = false;

        while let Some(current) = node {
            let mut earlier_child: Option<Self> = None;
            let mut earlier_child_is_relevant = false;
            let mut child_containing_target: Option<Self> = None;

            let mut iterator = current.iterate_children();
            while let Some(child) = iterator.next() {
                if child.id() == self.id() {
                    break;
                }
                if iterator.position.bytes > target_end_byte
                    || (iterator.position.bytes == target_end_byte
                        && (!self_is_empty
                            || Self::has_trailing_empty_descendant(child.subtree, self.subtree)))
                {
                    child_containing_target = Some(child);
                    break;
                }

                if child.is_relevant(include_anonymous) {
                    earlier_child = Some(child);
                    earlier_child_is_relevant = true;
                } else if child.relevant_child_count(include_anonymous) > 0 {
                    earlier_child = Some(child);
                    earlier_child_is_relevant = false;
                }
            }

            if child_containing_target.is_some() {
                if earlier_child.is_some() {
                    earlier_node = earlier_child;
                    earlier_node_is_relevant = earlier_child_is_relevant;
                }
                node = child_containing_target;
            } else if earlier_child_is_relevant {
                return earlier_child;
            } else if earlier_child.is_some() {
                node = earlier_child;
            } else if earlier_node_is_relevant {
                return earlier_node;
            } else {
                node = earlier_node.take();
                earlier_node_is_relevant = false;
            }
        }

        None
    }

    #[must_use]
    pub fn next_sibling(&self) -> Option<Self> {
        self.next_sibling_impl(true)
    }

    #[must_use]
    pub fn next_named_sibling(&self) -> Option<Self> {
        self.next_sibling_impl(false)
    }

    #[must_use]
    pub fn prev_sibling(&self) -> Option<Self> {
        self.prev_sibling_impl(true)
    }

    #[must_use]
    pub fn prev_named_sibling(&self) -> Option<Self> {
        self.prev_sibling_impl(false)
    }

    fn descendant_for_byte_range_impl(
        &self,
        range_start: u32,
        range_end: u32,
        include_anonymous: bool,
    ) -> Option<Self> {
        if range_start > range_end {
            return None;
        }
        let mut node = *self;
        let mut last_visible_node = *self;

        let mut did_descend = true;
        while did_descend {
            did_descend = false;

            let mut iterator = node.iterate_children();
            while let Some(child) = iterator.next() {
                let node_end = iterator.position.bytes;

                // The end of this node must extend far enough forward to
                // touch the end of the range.
                if node_end < range_end {
                    continue;
                }

                // ...and exceed the start of the range, unless the node is
                // empty.
                let is_empty = child.start_byte() == node_end;
                if if is_empty {
                    node_end < range_start
                } else {
                    node_end <= range_start
                } {
                    continue;
                }

                // The start of the node must not extend past the start of
                // the range.
                if range_start < child.start_byte() {
                    break;
                }

                node = child;
                if node.is_relevant(include_anonymous) {
                    last_visible_node = node;
                }
                did_descend = true;
                break;
            }
        }

        Some(last_visible_node)
    }

    /// The smallest node within this node that spans the given byte range.
    #[must_use]
    pub fn descendant_for_byte_range(&self, start: u32, end: u32) -> Option<Self> {
        self.descendant_for_byte_range_impl(start, end, true)
    }

    #[must_use]
    pub fn named_descendant_for_byte_range(&self, start: u32, end: u32) -> Option<Self> {
        self.descendant_for_byte_range_impl(start, end, false)
    }

    /// Render the node and its named descendants as an S-expression.
    #[must_use]
    pub fn to_sexp(&self) -> String {
        let language = self.language();
        self.subtree.to_sexp(
            self.alias,
            language.symbol_metadata(self.alias).visible,
            language,
            false,
        )
    }

    pub fn utf8_text<'a>(&self, source: &'a [u8]) -> Result<&'a str, str::Utf8Error> {
        str::from_utf8(&source[self.byte_range()])
    }

    #[must_use]
    pub fn walk(&self) -> TreeCursor<'tree> {
        TreeCursor::new(*self)
    }
}

impl PartialEq for Node<'_> {
    fn eq(&self, other: &Self) -> bool {
        ptr::eq(self.tree, other.tree) && self.id() == other.id()
    }
}

impl Eq for Node<'_> {}

impl fmt::Debug for Node<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{Node {} {} - {}}}",
            self.kind(),
            self.start_position(),
            self.end_position()
        )
    }
}

impl fmt::Display for Node<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_sexp())
    }
}
