//! Comparing two syntax trees to find the parts of the document whose
//! structure differs.

use crate::{
    error_costs::ERROR_STATE,
    language::{Language, Symbol, BUILTIN_SYM_ERROR},
    length::Length,
    point::Range,
    subtree::{external_scanner_state_eq, Subtree, TREE_STATE_NONE},
};

/// Append the span `start..end`, merging it into the last range when they
/// touch or overlap. Empty spans are ignored.
pub(crate) fn add_range(ranges: &mut Vec<Range>, start: Length, end: Length) {
    if let Some(last_range) = ranges.last_mut() {
        if start.bytes <= last_range.end_byte {
            if end.bytes > last_range.end_byte {
                last_range.end_byte = end.bytes;
                last_range.end_point = end.extent;
            }
            return;
        }
    }

    if start.bytes < end.bytes {
        ranges.push(Range {
            start_byte: start.bytes,
            end_byte: end.bytes,
            start_point: start.extent,
            end_point: end.extent,
        });
    }
}

/// Record a change that covers no text at `position`, keeping `ranges`
/// sorted. Positions already inside or at the edge of a range add nothing.
pub(crate) fn add_empty_range(ranges: &mut Vec<Range>, position: Length) {
    let index = ranges.partition_point(|range| range.end_byte < position.bytes);
    if ranges
        .get(index)
        .is_some_and(|range| range.start_byte <= position.bytes)
    {
        return;
    }
    ranges.insert(
        index,
        Range {
            start_byte: position.bytes,
            end_byte: position.bytes,
            start_point: position.extent,
            end_point: position.extent,
        },
    );
}

/// Whether any of `ranges`, from `start_index` on, overlaps
/// `start_byte..end_byte`.
pub(crate) fn ranges_intersect(
    ranges: &[Range],
    start_index: usize,
    start_byte: u32,
    end_byte: u32,
) -> bool {
    for range in ranges.iter().skip(start_index) {
        if range.end_byte > start_byte {
            return range.start_byte < end_byte;
        }
    }
    false
}

/// The spans of the document that are included in exactly one of two sets
/// of included ranges.
pub(crate) fn included_range_differences(old_ranges: &[Range], new_ranges: &[Range]) -> Vec<Range> {
    let mut differences = Vec::new();
    let mut old_index = 0;
    let mut new_index = 0;
    let mut current_position = Length::ZERO;
    let mut in_old_range = false;
    let mut in_new_range = false;

    let boundary = |ranges: &[Range], index: usize, at_end: bool| match ranges.get(index) {
        Some(range) if at_end => Length::new(range.end_byte, range.end_point),
        Some(range) => Length::new(range.start_byte, range.start_point),
        None => Length::MAX,
    };

    while old_index < old_ranges.len() || new_index < new_ranges.len() {
        let next_old_position = boundary(old_ranges, old_index, in_old_range);
        let next_new_position = boundary(new_ranges, new_index, in_new_range);

        if next_old_position.bytes < next_new_position.bytes {
            if in_old_range != in_new_range {
                add_range(&mut differences, current_position, next_old_position);
            }
            if in_old_range {
                old_index += 1;
            }
            current_position = next_old_position;
            in_old_range = !in_old_range;
        } else if next_new_position.bytes < next_old_position.bytes {
            if in_old_range != in_new_range {
                add_range(&mut differences, current_position, next_new_position);
            }
            if in_new_range {
                new_index += 1;
            }
            current_position = next_new_position;
            in_new_range = !in_new_range;
        } else {
            if in_old_range != in_new_range {
                add_range(&mut differences, current_position, next_new_position);
            }
            if in_old_range {
                old_index += 1;
            }
            if in_new_range {
                new_index += 1;
            }
            in_old_range = !in_old_range;
            in_new_range = !in_new_range;
            current_position = next_new_position;
        }
    }

    differences
}

#[derive(Clone, Copy, Debug)]
struct Entry<'a> {
    subtree: &'a Subtree,
    position: Length,
    child_index: usize,
    structural_child_index: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Comparison {
    Differs,
    MayDiffer,
    Matches,
}

/// A walk over one tree that stops at visible nodes, tracking how many
/// visible ancestors the current node has.
///
/// Between a node's start and its content, the iterator is "in padding":
/// it has entered the node's slot but not the node itself.
struct TreeIterator<'a> {
    stack: Vec<Entry<'a>>,
    language: &'a Language,
    visible_depth: u32,
    in_padding: bool,
    prev_external_token: Option<&'a Subtree>,
}

impl<'a> TreeIterator<'a> {
    fn new(tree: &'a Subtree, language: &'a Language) -> Self {
        Self {
            stack: vec![Entry {
                subtree: tree,
                position: Length::ZERO,
                child_index: 0,
                structural_child_index: 0,
            }],
            language,
            visible_depth: 1,
            in_padding: false,
            prev_external_token: None,
        }
    }

    fn done(&self) -> bool {
        self.stack.is_empty()
    }

    fn top(&self) -> Option<&Entry<'a>> {
        self.stack.last()
    }

    fn start_position(&self) -> Length {
        self.top().map_or(Length::ZERO, |entry| {
            if self.in_padding {
                entry.position
            } else {
                entry.position + entry.subtree.padding()
            }
        })
    }

    fn end_position(&self) -> Length {
        self.top().map_or(Length::ZERO, |entry| {
            let result = entry.position + entry.subtree.padding();
            if self.in_padding {
                result
            } else {
                result + entry.subtree.size()
            }
        })
    }

    fn alias_at(&self, index: usize) -> Symbol {
        match (index.checked_sub(1).and_then(|i| self.stack.get(i)), self.stack.get(index)) {
            (Some(parent), Some(entry)) => self
                .language
                .alias_at(parent.subtree.production_id(), entry.structural_child_index),
            _ => 0,
        }
    }

    fn tree_is_visible(&self) -> bool {
        let Some(entry) = self.top() else {
            return false;
        };
        entry.subtree.visible() || self.alias_at(self.stack.len() - 1) != 0
    }

    /// The nearest visible node at or above the current one, with its alias
    /// and start byte.
    fn visible_state(&self) -> Option<(&'a Subtree, Symbol, u32)> {
        let mut index = self.stack.len().checked_sub(1)?;
        if self.in_padding {
            index = index.checked_sub(1)?;
        }

        loop {
            let entry = self.stack[index];
            let alias_symbol = self.alias_at(index);
            if entry.subtree.visible() || alias_symbol != 0 {
                return Some((entry.subtree, alias_symbol, entry.position.bytes));
            }
            index = index.checked_sub(1)?;
        }
    }

    fn ascend(&mut self) {
        if self.done() {
            return;
        }
        if self.tree_is_visible() && !self.in_padding {
            self.visible_depth -= 1;
        }
        if self.top().is_some_and(|entry| entry.child_index > 0) {
            self.in_padding = false;
        }
        self.stack.pop();
    }

    /// Move down to the first visible descendant that ends after
    /// `goal_position`.
    fn descend(&mut self, goal_position: u32) -> bool {
        if self.in_padding {
            return false;
        }

        loop {
            let Some(&entry) = self.top() else {
                return false;
            };
            let mut position = entry.position;
            let mut structural_child_index = 0;
            let mut did_descend = false;

            for (child_index, child) in entry.subtree.children().iter().enumerate() {
                let child_left = position + child.padding();
                let child_right = child_left + child.size();

                if child_right.bytes > goal_position {
                    self.stack.push(Entry {
                        subtree: child,
                        position,
                        child_index,
                        structural_child_index,
                    });

                    if self.tree_is_visible() {
                        if child_left.bytes > goal_position {
                            self.in_padding = true;
                        } else {
                            self.visible_depth += 1;
                        }
                        return true;
                    }

                    did_descend = true;
                    break;
                }

                position = child_right;
                if !child.extra() {
                    structural_child_index += 1;
                }
                if let Some(token) = child.last_external_token() {
                    self.prev_external_token = Some(token);
                }
            }

            if !did_descend {
                return false;
            }
        }
    }

    /// Move to the next visible node in document order.
    fn advance(&mut self) {
        if self.in_padding {
            self.in_padding = false;
            if self.tree_is_visible() {
                self.visible_depth += 1;
            } else {
                self.descend(0);
            }
            return;
        }

        loop {
            if self.tree_is_visible() {
                self.visible_depth -= 1;
            }
            let Some(entry) = self.stack.pop() else {
                return;
            };
            let Some(&parent) = self.top() else {
                return;
            };

            if let Some(token) = entry.subtree.last_external_token() {
                self.prev_external_token = Some(token);
            }

            let child_index = entry.child_index + 1;
            if let Some(next_child) = parent.subtree.children().get(child_index) {
                let mut structural_child_index = entry.structural_child_index;
                if !entry.subtree.extra() {
                    structural_child_index += 1;
                }
                self.stack.push(Entry {
                    subtree: next_child,
                    position: entry.position + entry.subtree.total_size(),
                    child_index,
                    structural_child_index,
                });

                if self.tree_is_visible() {
                    if next_child.padding().bytes > 0 {
                        self.in_padding = true;
                    } else {
                        self.visible_depth += 1;
                    }
                } else {
                    self.descend(0);
                }
                return;
            }
        }
    }

    fn compare(&self, new_iter: &Self) -> Comparison {
        let (old_tree, new_tree) = match (self.visible_state(), new_iter.visible_state()) {
            (None, None) => return Comparison::Matches,
            (Some(old), Some(new)) => (old, new),
            _ => return Comparison::Differs,
        };
        let (old_tree, old_alias_symbol, old_start) = old_tree;
        let (new_tree, new_alias_symbol, new_start) = new_tree;

        if old_alias_symbol != new_alias_symbol || old_tree.symbol() != new_tree.symbol() {
            return Comparison::Differs;
        }
        if old_start == new_start && old_tree.ptr_eq(new_tree) && !old_tree.has_changes() {
            return Comparison::Matches;
        }

        let old_state = old_tree.parse_state();
        let new_state = new_tree.parse_state();
        let old_has_external_tokens = old_tree.has_external_tokens();

        if old_start != new_start
            || old_tree.symbol() == BUILTIN_SYM_ERROR
            || old_tree.size().bytes != new_tree.size().bytes
            || old_state == TREE_STATE_NONE
            || new_state == TREE_STATE_NONE
            || (old_state == ERROR_STATE) != (new_state == ERROR_STATE)
            || old_tree.error_cost() != new_tree.error_cost()
            || old_has_external_tokens != new_tree.has_external_tokens()
            || old_tree.has_changes()
            || (old_has_external_tokens
                && !external_scanner_state_eq(self.prev_external_token, new_iter.prev_external_token))
        {
            return Comparison::MayDiffer;
        }

        Comparison::Matches
    }

    /// Whether the current leaves of two iterators that cannot descend any
    /// further hold different content.
    ///
    /// Only a different symbol or size, or an edit to the old leaf's own
    /// bytes, counts: leaves whose lookahead alone was touched are not
    /// reported, even though neither iterator could descend.
    fn leaf_differs(&self, new_iter: &Self) -> bool {
        if self.in_padding || new_iter.in_padding {
            return false;
        }
        match (self.top(), new_iter.top()) {
            (Some(old), Some(new)) => {
                old.subtree.child_count() == 0
                    && new.subtree.child_count() == 0
                    && (old.subtree.symbol() != new.subtree.symbol()
                        || old.subtree.size().bytes != new.subtree.size().bytes
                        || old.subtree.is_edited())
            }
            _ => false,
        }
    }
}

/// Compute the spans where the structure of `new_tree` differs from that of
/// `old_tree`, which must have been edited to match the new text.
///
/// Both trees are walked in parallel. Subtrees that can be proven identical
/// are skipped whole; others are descended into until they can be matched
/// or are found to differ.
pub(crate) fn changed_ranges(
    old_tree: &Subtree,
    new_tree: &Subtree,
    language: &Language,
    included_range_differences: &[Range],
) -> Vec<Range> {
    let mut results = Vec::new();
    let mut old_iter = TreeIterator::new(old_tree, language);
    let mut new_iter = TreeIterator::new(new_tree, language);
    let mut included_range_difference_index = 0;

    let mut position = old_iter.start_position();
    let mut next_position = new_iter.start_position();
    if position.bytes < next_position.bytes {
        add_range(&mut results, position, next_position);
        position = next_position;
    } else if position.bytes > next_position.bytes {
        add_range(&mut results, next_position, position);
        next_position = position;
    }

    loop {
        let mut comparison = old_iter.compare(&new_iter);

        // Identical-looking subtrees may still differ inside if part of
        // their text moved into or out of the included ranges.
        if comparison == Comparison::Matches
            && ranges_intersect(
                included_range_differences,
                included_range_difference_index,
                position.bytes,
                old_iter.end_position().bytes,
            )
        {
            comparison = Comparison::MayDiffer;
        }

        let mut is_changed = false;
        match comparison {
            Comparison::Matches => {
                next_position = old_iter.end_position();
            }
            Comparison::MayDiffer => {
                if old_iter.descend(position.bytes) {
                    if !new_iter.descend(position.bytes) {
                        is_changed = true;
                        next_position = old_iter.end_position();
                    }
                } else if new_iter.descend(position.bytes) {
                    is_changed = true;
                    next_position = new_iter.end_position();
                } else {
                    is_changed = old_iter.leaf_differs(&new_iter);
                    next_position = old_iter.end_position().min(new_iter.end_position());
                }
            }
            Comparison::Differs => {
                is_changed = true;
                next_position = old_iter.end_position().min(new_iter.end_position());
            }
        }

        // Bring both iterators up to the new position, at the same depth.
        while !old_iter.done() && old_iter.end_position().bytes <= next_position.bytes {
            old_iter.advance();
        }
        while !new_iter.done() && new_iter.end_position().bytes <= next_position.bytes {
            new_iter.advance();
        }
        while old_iter.visible_depth > new_iter.visible_depth {
            old_iter.ascend();
        }
        while new_iter.visible_depth > old_iter.visible_depth {
            new_iter.ascend();
        }

        if is_changed {
            if position.bytes == next_position.bytes {
                add_empty_range(&mut results, position);
            } else {
                add_range(&mut results, position, next_position);
            }
        }

        position = next_position;

        while included_range_differences
            .get(included_range_difference_index)
            .is_some_and(|range| range.end_byte <= position.bytes)
        {
            included_range_difference_index += 1;
        }

        if old_iter.done() || new_iter.done() {
            break;
        }
    }

    let old_size = old_tree.total_size();
    let new_size = new_tree.total_size();
    if old_size.bytes < new_size.bytes {
        add_range(&mut results, old_size, new_size);
    } else if new_size.bytes < old_size.bytes {
        add_range(&mut results, new_size, old_size);
    }
    add_empty_differences(old_tree, new_tree, &mut results);

    tracing::trace!(count = results.len(), "computed changed ranges");
    results
}

/// Whether two subtrees differ in kind or field layout. Children are
/// compared separately.
fn node_differs(old_tree: &Subtree, new_tree: &Subtree) -> bool {
    old_tree.symbol() != new_tree.symbol()
        || old_tree.is_missing() != new_tree.is_missing()
        || old_tree.production_id() != new_tree.production_id()
}

/// Report the differences that cover no text.
///
/// The lockstep walk in [`changed_ranges`] only stops at nodes that end
/// after its current position, so nodes that an edit collapsed to zero
/// width, or that were inserted with zero width (such as missing tokens),
/// pass by unseen. This pairs the children of both trees by index and
/// records an empty range wherever a zero-width node has no identical
/// counterpart, or where the two trees disagree about a node's kind or
/// number of children. Aligned subtrees that are shared and unchanged are
/// skipped.
fn add_empty_differences(old_tree: &Subtree, new_tree: &Subtree, ranges: &mut Vec<Range>) {
    let mut stack = vec![(old_tree, new_tree, Length::ZERO, Length::ZERO)];
    while let Some((old, new, old_position, new_position)) = stack.pop() {
        let old_start = old_position + old.padding();
        let new_start = new_position + new.padding();
        let aligned = old_start.bytes == new_start.bytes;
        if aligned && old.ptr_eq(new) && !old.has_changes() {
            continue;
        }

        let old_empty = old.size().bytes == 0;
        let new_empty = new.size().bytes == 0;
        if !aligned || old_empty != new_empty || node_differs(old, new) {
            if old_empty {
                add_empty_range(ranges, old_start);
            }
            if new_empty {
                add_empty_range(ranges, new_start);
            }
            if aligned && !old_empty && !new_empty {
                add_empty_range(ranges, old_start);
            }
        }

        let old_children = old.children();
        let new_children = new.children();
        let paired = old_children.len().min(new_children.len());
        let mut old_child_position = old_position;
        let mut new_child_position = new_position;
        for (old_child, new_child) in old_children.iter().zip(new_children) {
            stack.push((old_child, new_child, old_child_position, new_child_position));
            old_child_position += old_child.total_size();
            new_child_position += new_child.total_size();
        }
        for child in &old_children[paired..] {
            add_unpaired(child, old_child_position, ranges);
            old_child_position += child.total_size();
        }
        for child in &new_children[paired..] {
            add_unpaired(child, new_child_position, ranges);
            new_child_position += child.total_size();
        }
    }
}

/// Report the start of a subtree that exists in only one tree, along with
/// every zero-width node inside it.
fn add_unpaired(tree: &Subtree, position: Length, ranges: &mut Vec<Range>) {
    add_empty_range(ranges, position + tree.padding());
    let mut stack = vec![(tree, position)];
    while let Some((tree, position)) = stack.pop() {
        if tree.size().bytes == 0 {
            add_empty_range(ranges, position + tree.padding());
            continue;
        }
        let mut child_position = position;
        for child in tree.children() {
            stack.push((child, child_position));
            child_position += child.total_size();
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        language::{LanguageBuilder, StateId, SymbolMetadata},
        lexer::Lexer,
        point::{InputEdit, Point},
        subtree::LeafParams,
    };

    fn range(start: u32, end: u32) -> Range {
        Range {
            start_byte: start,
            end_byte: end,
            start_point: Point::new(0, start),
            end_point: Point::new(0, end),
        }
    }

    fn length(bytes: u32) -> Length {
        Length::new(bytes, Point::new(0, bytes))
    }

    #[test]
    fn adjacent_ranges_are_merged() {
        let mut ranges = Vec::new();
        add_range(&mut ranges, length(1), length(3));
        add_range(&mut ranges, length(3), length(5));
        add_range(&mut ranges, length(7), length(7));
        add_range(&mut ranges, length(8), length(9));
        assert_eq!(ranges, vec![range(1, 5), range(8, 9)]);
    }

    #[test]
    fn empty_ranges_are_kept_in_order() {
        let mut ranges = Vec::new();
        add_range(&mut ranges, length(1), length(3));
        add_empty_range(&mut ranges, length(5));
        add_empty_range(&mut ranges, length(2));
        add_empty_range(&mut ranges, length(3));
        add_range(&mut ranges, length(5), length(7));
        add_empty_range(&mut ranges, length(0));
        assert_eq!(ranges, vec![range(0, 0), range(1, 3), range(5, 7)]);
    }

    #[test]
    fn intersection_respects_the_start_index() {
        let ranges = [range(0, 2), range(5, 8)];
        assert!(ranges_intersect(&ranges, 0, 1, 3));
        assert!(!ranges_intersect(&ranges, 1, 1, 3));
        assert!(ranges_intersect(&ranges, 0, 7, 10));
        assert!(!ranges_intersect(&ranges, 0, 2, 5));
    }

    #[test]
    fn differences_between_included_ranges() {
        assert_eq!(
            included_range_differences(&[range(0, 10)], &[range(0, 10)]),
            vec![]
        );
        assert_eq!(
            included_range_differences(&[range(0, 10)], &[range(0, 4), range(6, 12)]),
            vec![range(4, 6), range(10, 12)]
        );
        assert_eq!(
            included_range_differences(&[range(2, 4)], &[range(6, 8)]),
            vec![range(2, 4), range(6, 8)]
        );
    }

    fn lex_nothing(_: &mut Lexer<'_>, _: StateId) -> bool {
        false
    }

    fn language() -> Language {
        LanguageBuilder::new("diff", lex_nothing)
            .token("a", SymbolMetadata::NAMED)
            .token("b", SymbolMetadata::NAMED)
            .non_terminal("list", SymbolMetadata::NAMED)
            .state_count(2)
            .build()
            .unwrap()
    }

    fn leaf(symbol: Symbol, padding: u32, size: u32, language: &Language) -> Subtree {
        Subtree::new_leaf(
            LeafParams {
                symbol,
                padding: length(padding),
                size: length(size),
                parse_state: 1,
                ..LeafParams::default()
            },
            language,
        )
    }

    fn list(children: Vec<Subtree>, language: &Language) -> Subtree {
        let mut node = Subtree::new_node(3, children, 0, language);
        node.set_parse_state(1);
        node
    }

    #[test]
    fn identical_trees_have_no_changes() {
        let language = language();
        let tree = list(vec![leaf(1, 0, 1, &language), leaf(2, 1, 2, &language)], &language);
        assert_eq!(changed_ranges(&tree, &tree.clone(), &language, &[]), vec![]);
    }

    #[test]
    fn a_different_leaf_is_reported() {
        let language = language();
        let mut old = list(vec![leaf(1, 0, 1, &language), leaf(1, 1, 2, &language)], &language);
        old.edit(&InputEdit {
            start_byte: 3,
            old_end_byte: 4,
            new_end_byte: 4,
            start_position: Point::new(0, 3),
            old_end_position: Point::new(0, 4),
            new_end_position: Point::new(0, 4),
        });
        let new = list(vec![leaf(1, 0, 1, &language), leaf(2, 1, 2, &language)], &language);
        assert_eq!(changed_ranges(&old, &new, &language, &[]), vec![range(2, 4)]);
    }

    #[test]
    fn added_text_at_the_end_is_reported() {
        let language = language();
        let old = list(vec![leaf(1, 0, 1, &language)], &language);
        let new = list(vec![leaf(1, 0, 1, &language), leaf(2, 0, 2, &language)], &language);
        assert_eq!(changed_ranges(&old, &new, &language, &[]), vec![range(1, 3)]);
    }

    #[test]
    fn a_leaf_collapsed_to_zero_width_is_reported() {
        let language = language();
        let mut old = list(vec![leaf(1, 0, 1, &language), leaf(2, 1, 2, &language)], &language);
        old.edit(&InputEdit {
            start_byte: 2,
            old_end_byte: 4,
            new_end_byte: 2,
            start_position: Point::new(0, 2),
            old_end_position: Point::new(0, 4),
            new_end_position: Point::new(0, 2),
        });
        let new = list(vec![leaf(1, 0, 1, &language), leaf(1, 1, 0, &language)], &language);
        assert_eq!(changed_ranges(&old, &new, &language, &[]), vec![range(2, 2)]);
    }
}
