//! A stateful cursor for walking a [`Tree`] without recomputing parents.

use streaming_iterator::StreamingIterator;

use crate::{
    language::{FieldId, Symbol},
    length::Length,
    node::Node,
    point::Point,
    subtree::Subtree,
    tree::Tree,
};

#[derive(Clone, Copy, Debug)]
struct CursorEntry<'tree> {
    subtree: &'tree Subtree,
    position: Length,
    child_index: usize,
    structural_child_index: usize,
}

/// The outcome of one navigation step. A hidden step lands on an invisible
/// node that still has visible descendants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Step {
    None,
    Hidden,
    Visible,
}

struct CursorChildIterator<'tree> {
    parent: &'tree Subtree,
    alias_sequence: Option<&'tree [Symbol]>,
    position: Length,
    child_index: usize,
    structural_child_index: usize,
}

impl<'tree> CursorChildIterator<'tree> {
    /// The next child, and whether it is visible.
    fn next(&mut self) -> Option<(CursorEntry<'tree>, bool)> {
        let children = self.parent.children();
        let child = children.get(self.child_index)?;
        let entry = CursorEntry {
            subtree: child,
            position: self.position,
            child_index: self.child_index,
            structural_child_index: self.structural_child_index,
        };
        let mut visible = child.visible();
        if !child.extra() {
            visible |= self
                .alias_sequence
                .and_then(|sequence| sequence.get(self.structural_child_index))
                .is_some_and(|&alias| alias != 0);
            self.structural_child_index += 1;
        }

        self.position += child.size();
        self.child_index += 1;
        if let Some(next_child) = children.get(self.child_index) {
            self.position += next_child.padding();
        }

        Some((entry, visible))
    }
}

/// A cursor over the visible nodes of a tree.
///
/// The cursor can only move within the node it was created from or last
/// [`reset`](TreeCursor::reset) to.
#[derive(Clone)]
pub struct TreeCursor<'tree> {
    tree: &'tree Tree,
    stack: Vec<CursorEntry<'tree>>,
    root_alias_symbol: Symbol,
}

impl<'tree> TreeCursor<'tree> {
    pub(crate) fn new(node: Node<'tree>) -> Self {
        let mut cursor = Self {
            tree: node.tree(),
            stack: Vec::with_capacity(8),
            root_alias_symbol: 0,
        };
        cursor.reset(node);
        cursor
    }

    /// Move the cursor back to `node`, discarding its path.
    pub fn reset(&mut self, node: Node<'tree>) {
        self.tree = node.tree();
        self.root_alias_symbol = node.alias();
        self.stack.clear();
        self.stack.push(CursorEntry {
            subtree: node.subtree(),
            position: node.position(),
            child_index: 0,
            structural_child_index: 0,
        });
    }

    fn last_entry(&self) -> &CursorEntry<'tree> {
        // The stack always holds the root entry.
        &self.stack[self.stack.len() - 1]
    }

    fn is_entry_visible(&self, index: usize) -> bool {
        let entry = &self.stack[index];
        if index == 0 || entry.subtree.visible() {
            true
        } else if !entry.subtree.extra() {
            let parent = &self.stack[index - 1];
            self.tree
                .language()
                .alias_at(parent.subtree.production_id(), entry.structural_child_index as u32)
                != 0
        } else {
            false
        }
    }

    fn iterate_children(&self) -> CursorChildIterator<'tree> {
        let last_entry = self.last_entry();
        let language: &'tree _ = self.tree.language();
        CursorChildIterator {
            parent: last_entry.subtree,
            alias_sequence: language.alias_sequence(last_entry.subtree.production_id()),
            position: last_entry.position,
            child_index: 0,
            structural_child_index: 0,
        }
    }

    #[must_use]
    pub fn node(&self) -> Node<'tree> {
        let last_entry = self.last_entry();
        let is_extra = last_entry.subtree.extra();
        let mut alias_symbol = if is_extra { 0 } else { self.root_alias_symbol };
        if self.stack.len() > 1 && !is_extra {
            let parent = &self.stack[self.stack.len() - 2];
            alias_symbol = self.tree.language().alias_at(
                parent.subtree.production_id(),
                last_entry.structural_child_index as u32,
            );
        }
        Node::new(self.tree, last_entry.subtree, last_entry.position, alias_symbol)
    }

    fn goto_first_child_step(&mut self) -> Step {
        let mut iterator = self.iterate_children();
        while let Some((entry, visible)) = iterator.next() {
            if visible {
                self.stack.push(entry);
                return Step::Visible;
            }
            if entry.subtree.visible_child_count() > 0 {
                self.stack.push(entry);
                return Step::Hidden;
            }
        }
        Step::None
    }

    /// Move to the first visible child. Returns `false` if there is none.
    pub fn goto_first_child(&mut self) -> bool {
        loop {
            match self.goto_first_child_step() {
                Step::Hidden => continue,
                Step::Visible => return true,
                Step::None => return false,
            }
        }
    }

    fn goto_last_child_step(&mut self) -> Step {
        let mut iterator = self.iterate_children();
        let mut last = None;
        while let Some((entry, visible)) = iterator.next() {
            if visible {
                last = Some((entry, Step::Visible));
            } else if entry.subtree.visible_child_count() > 0 {
                last = Some((entry, Step::Hidden));
            }
        }
        match last {
            Some((entry, step)) => {
                self.stack.push(entry);
                step
            }
            None => Step::None,
        }
    }

    pub fn goto_last_child(&mut self) -> bool {
        loop {
            match self.goto_last_child_step() {
                Step::Hidden => continue,
                Step::Visible => return true,
                Step::None => return false,
            }
        }
    }

    fn goto_next_sibling_step(&mut self) -> Step {
        let mut popped = Vec::new();

        while self.stack.len() > 1 {
            let Some(entry) = self.stack.pop() else {
                break;
            };
            popped.push(entry);
            let mut iterator = self.iterate_children();
            iterator.child_index = entry.child_index;
            iterator.structural_child_index = entry.structural_child_index;
            iterator.position = entry.position;

            // Step over the entry itself. A visible ancestor ends the search.
            let visible = iterator.next().is_some_and(|(_, visible)| visible);
            if visible && popped.len() > 1 {
                break;
            }

            while let Some((entry, visible)) = iterator.next() {
                if visible {
                    self.stack.push(entry);
                    return Step::Visible;
                }
                if entry.subtree.visible_child_count() > 0 {
                    self.stack.push(entry);
                    return Step::Hidden;
                }
            }
        }

        self.stack.extend(popped.into_iter().rev());
        Step::None
    }

    /// Move to the next visible sibling. Returns `false` if there is none.
    pub fn goto_next_sibling(&mut self) -> bool {
        match self.goto_next_sibling_step() {
            Step::Hidden => {
                self.goto_first_child();
                true
            }
            Step::Visible => true,
            Step::None => false,
        }
    }

    /// Move to the nearest visible ancestor. Returns `false` at the root.
    pub fn goto_parent(&mut self) -> bool {
        for index in (0..self.stack.len().saturating_sub(1)).rev() {
            if self.is_entry_visible(index) {
                self.stack.truncate(index + 1);
                return true;
            }
        }
        false
    }

    fn goto_first_child_for_byte_and_point(&mut self, goal_byte: u32, goal_point: Point) -> Option<usize> {
        let initial_len = self.stack.len();
        let mut visible_child_index = 0;

        loop {
            let mut did_descend = false;
            let mut iterator = self.iterate_children();
            while let Some((entry, visible)) = iterator.next() {
                let entry_end = entry.position + entry.subtree.size();
                let at_goal = entry_end.bytes > goal_byte && entry_end.extent > goal_point;
                let visible_child_count = entry.subtree.visible_child_count() as usize;
                if at_goal {
                    if visible {
                        self.stack.push(entry);
                        return Some(visible_child_index);
                    }
                    if visible_child_count > 0 {
                        self.stack.push(entry);
                        did_descend = true;
                        break;
                    }
                } else if visible {
                    visible_child_index += 1;
                } else {
                    visible_child_index += visible_child_count;
                }
            }
            if !did_descend {
                break;
            }
        }

        self.stack.truncate(initial_len);
        None
    }

    /// Move to the first child that extends beyond `goal_byte`, returning
    /// its index among the visible children.
    pub fn goto_first_child_for_byte(&mut self, goal_byte: u32) -> Option<usize> {
        self.goto_first_child_for_byte_and_point(goal_byte, Point::ZERO)
    }

    pub fn goto_first_child_for_point(&mut self, goal_point: Point) -> Option<usize> {
        self.goto_first_child_for_byte_and_point(0, goal_point)
    }

    /// The number of visible ancestors between the cursor and the node it
    /// started from.
    #[must_use]
    pub fn depth(&self) -> u32 {
        (1..self.stack.len())
            .filter(|&index| self.is_entry_visible(index))
            .count() as u32
    }

    /// The id of the field the current node is stored in, looking through
    /// hidden parents.
    #[must_use]
    pub fn field_id(&self) -> Option<FieldId> {
        let language = self.tree.language();
        for index in (1..self.stack.len()).rev() {
            let entry = &self.stack[index];
            let parent = &self.stack[index - 1];

            if index != self.stack.len() - 1 && self.is_entry_visible(index) {
                break;
            }
            if entry.subtree.extra() {
                break;
            }

            let field_id = language
                .field_map(parent.subtree.production_id())
                .iter()
                .find(|map| {
                    !map.inherited && usize::from(map.child_index) == entry.structural_child_index
                })
                .map(|map| map.field_id);
            if field_id.is_some() {
                return field_id;
            }
        }
        None
    }

    #[must_use]
    pub fn field_name(&self) -> Option<&'static str> {
        self.field_id()
            .and_then(|id| self.tree.language().field_name_for_id(id))
    }
}

/// Every visible node of a tree in document order, produced by a single
/// cursor.
pub struct PreorderNodes<'tree> {
    cursor: TreeCursor<'tree>,
    current: Option<Node<'tree>>,
    started: bool,
}

impl<'tree> PreorderNodes<'tree> {
    pub(crate) const fn new(cursor: TreeCursor<'tree>) -> Self {
        Self {
            cursor,
            current: None,
            started: false,
        }
    }
}

impl<'tree> StreamingIterator for PreorderNodes<'tree> {
    type Item = Node<'tree>;

    fn advance(&mut self) {
        if !self.started {
            self.started = true;
            self.current = Some(self.cursor.node());
            return;
        }
        if self.current.is_none() {
            return;
        }
        if self.cursor.goto_first_child() || self.cursor.goto_next_sibling() {
            self.current = Some(self.cursor.node());
            return;
        }
        loop {
            if !self.cursor.goto_parent() {
                self.current = None;
                return;
            }
            if self.cursor.goto_next_sibling() {
                self.current = Some(self.cursor.node());
                return;
            }
        }
    }

    fn get(&self) -> Option<&Self::Item> {
        self.current.as_ref()
    }
}
