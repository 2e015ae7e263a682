mod helpers;

use helpers::{arithmetic_language, parser_for, perform_edit};
use proptest::prelude::*;
use tree_sitter_engine::{changed_ranges, Range, StreamingIterator, Tree};

/// A visible node without visible children: kind, start, end and whether it
/// is missing.
type Leaf = (&'static str, usize, usize, bool);

fn leaves(tree: &Tree) -> Vec<Leaf> {
    let mut leaves = Vec::new();
    let mut nodes = tree.preorder();
    while let Some(node) = nodes.next() {
        if node.child_count() == 0 {
            let span = node.byte_range();
            leaves.push((node.kind(), span.start, span.end, node.is_missing()));
        }
    }
    leaves
}

/// The leaves of `leaves` left over after matching each against an equal
/// leaf of `others`.
fn unmatched(leaves: &[Leaf], others: &[Leaf]) -> Vec<Leaf> {
    let mut others = others.to_vec();
    leaves
        .iter()
        .filter(|leaf| match others.iter().position(|other| other == *leaf) {
            Some(index) => {
                others.swap_remove(index);
                false
            }
            None => true,
        })
        .copied()
        .collect()
}

fn covers(range: &Range, &(_, start, end, _): &Leaf) -> bool {
    let (range_start, range_end) = (range.start_byte as usize, range.end_byte as usize);
    if start == end {
        range_start <= start && start <= range_end
    } else {
        range_start < end && start < range_end
    }
}

/// A well-formed expression, as its tokens.
fn expression_tokens() -> impl Strategy<Value = Vec<String>> {
    (
        1u32..1000,
        prop::collection::vec((prop_oneof![Just("+"), Just("*")], 1u32..1000), 0..12),
    )
        .prop_map(|(first, rest)| {
            let mut tokens = vec![first.to_string()];
            for (operator, operand) in rest {
                tokens.push(operator.to_string());
                tokens.push(operand.to_string());
            }
            tokens
        })
}

fn arbitrary_text() -> impl Strategy<Value = String> {
    prop::collection::vec(
        prop_oneof![
            Just('1'),
            Just('7'),
            Just('+'),
            Just('*'),
            Just(' '),
            Just('\n'),
            Just('#'),
            Just('@'),
            Just('é'),
        ],
        0..40,
    )
    .prop_map(|chars| chars.into_iter().collect())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn the_root_spans_any_input(text in arbitrary_text()) {
        let language = arithmetic_language();
        let mut parser = parser_for(&language);
        let tree = parser.parse(&text, None).unwrap();
        prop_assert_eq!(tree.source_length() as usize, text.len());
        prop_assert!(tree.root_node().end_byte() as usize <= text.len());
    }

    #[test]
    fn well_formed_expressions_parse_without_errors(tokens in expression_tokens()) {
        let language = arithmetic_language();
        let mut parser = parser_for(&language);
        let text = tokens.join(" ");
        let tree = parser.parse(&text, None).unwrap();
        prop_assert!(!tree.root_node().has_error(), "{}", tree.root_node());
        prop_assert_eq!(tree.root_node().byte_range(), 0..text.len());
    }

    #[test]
    fn reparsing_after_an_edit_matches_a_fresh_parse(
        tokens in expression_tokens(),
        operand in any::<prop::sample::Index>(),
        replacement in 0u32..100_000,
    ) {
        let language = arithmetic_language();
        let mut parser = parser_for(&language);
        let mut text = tokens.join(" ");
        let mut tree = parser.parse(&text, None).unwrap();

        // Replace one operand with another number, keeping the text valid.
        let operand = operand.index(tokens.len().div_ceil(2)) * 2;
        let start = tokens[..operand].iter().map(|token| token.len() + 1).sum::<usize>();
        let edit = perform_edit(&mut text, start, tokens[operand].len(), &replacement.to_string());
        tree.edit(&edit);

        let reparsed = parser.parse(&text, Some(&tree)).unwrap();
        let fresh = parser.parse(&text, None).unwrap();
        prop_assert_eq!(reparsed.root_node().to_sexp(), fresh.root_node().to_sexp());
        prop_assert_eq!(reparsed.source_length() as usize, text.len());
    }

    #[test]
    fn reparsing_arbitrary_edits_never_loses_text(
        text in arbitrary_text(),
        inserted in arbitrary_text(),
        start in any::<prop::sample::Index>(),
        deleted in 0usize..8,
    ) {
        let language = arithmetic_language();
        let mut parser = parser_for(&language);
        let mut text = text;
        let mut tree = parser.parse(&text, None).unwrap();

        let boundaries = (0..=text.len()).filter(|&i| text.is_char_boundary(i)).collect::<Vec<_>>();
        let start_index = start.index(boundaries.len());
        let start = boundaries[start_index];
        let end = boundaries[(start_index + deleted).min(boundaries.len() - 1)];
        let edit = perform_edit(&mut text, start, end - start, &inserted);
        tree.edit(&edit);

        let reparsed = parser.parse(&text, Some(&tree)).unwrap();
        prop_assert_eq!(reparsed.source_length() as usize, text.len());
    }

    #[test]
    fn changed_ranges_account_for_every_difference(
        text in arbitrary_text(),
        inserted in arbitrary_text(),
        start in any::<prop::sample::Index>(),
        deleted in 0usize..6,
    ) {
        let language = arithmetic_language();
        let mut parser = parser_for(&language);
        let mut text = text;
        let mut tree = parser.parse(&text, None).unwrap();

        let boundaries = (0..=text.len()).filter(|&i| text.is_char_boundary(i)).collect::<Vec<_>>();
        let start_index = start.index(boundaries.len());
        let start = boundaries[start_index];
        let end = boundaries[(start_index + deleted).min(boundaries.len() - 1)];
        let edit = perform_edit(&mut text, start, end - start, &inserted);
        tree.edit(&edit);
        let new_tree = parser.parse(&text, Some(&tree)).unwrap();
        let ranges = changed_ranges(&tree, &new_tree);

        for range in &ranges {
            prop_assert!(range.start_byte <= range.end_byte, "{:?}", ranges);
        }
        for pair in ranges.windows(2) {
            prop_assert!(pair[0].end_byte < pair[1].start_byte, "{:?}", ranges);
        }

        let old_leaves = leaves(&tree);
        let new_leaves = leaves(&new_tree);
        let mut differing = unmatched(&old_leaves, &new_leaves);
        differing.extend(unmatched(&new_leaves, &old_leaves));
        for leaf in &differing {
            prop_assert!(
                ranges.iter().any(|range| covers(range, leaf)),
                "{:?} not in {:?} for {:?}", leaf, ranges, text
            );
        }

        let old_sexp = tree.root_node().to_sexp();
        let new_sexp = new_tree.root_node().to_sexp();
        if old_sexp != new_sexp {
            prop_assert!(!ranges.is_empty(), "{} -> {} for {:?}", old_sexp, new_sexp, text);
        } else if differing.is_empty()
            && !tree.root_node().has_error()
            && !new_tree.root_node().has_error()
        {
            // Leaves that only had their text rewritten may still be
            // reported, but nothing away from the edit.
            for range in &ranges {
                prop_assert!(
                    range.start_byte <= edit.new_end_byte && range.end_byte >= edit.start_byte,
                    "{:?} for {:?}", ranges, text
                );
            }
        }
    }
}
