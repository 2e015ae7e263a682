//! The live-subtree counter is process-wide, so this binary holds a single
//! test.

mod helpers;

use std::thread;

use helpers::{ambiguous_language, arithmetic_language, parser_for, perform_edit};
use pretty_assertions::assert_eq;
use proptest::{
    prelude::*,
    test_runner::{Config, TestRunner},
};
use tree_sitter_engine::{live_subtree_count, InputEdit, Point};

#[derive(Clone, Copy, Debug)]
enum Operation {
    Retain,
    Release,
    Edit,
}

fn operation() -> impl Strategy<Value = Operation> {
    prop_oneof![
        Just(Operation::Retain),
        Just(Operation::Release),
        Just(Operation::Edit),
    ]
}

/// Appends one digit to the first operand, so every subtree on the left
/// spine has to be copied before it is modified.
fn widen_first_operand() -> InputEdit {
    InputEdit {
        start_byte: 1,
        old_end_byte: 1,
        new_end_byte: 2,
        start_position: Point::new(0, 1),
        old_end_position: Point::new(0, 1),
        new_end_position: Point::new(0, 2),
    }
}

#[test]
fn every_subtree_is_released() {
    let baseline = live_subtree_count();

    {
        let language = arithmetic_language();
        let mut parser = parser_for(&language);
        let mut text = String::from("1 + 2 * 3 # done");
        let mut tree = parser.parse(&text, None).unwrap();
        assert!(live_subtree_count() > baseline);

        let edit = perform_edit(&mut text, 4, 1, "@ 5");
        tree.edit(&edit);
        let new_tree = parser.parse(&text, Some(&tree)).unwrap();
        assert!(new_tree.root_node().has_error());
        let _ = tree.changed_ranges(&new_tree).count();

        let edit = perform_edit(&mut text, 4, 3, "");
        let mut edited = new_tree.clone();
        edited.edit(&edit);
        let repaired = parser.parse(&text, Some(&edited)).unwrap();
        assert!(repaired.root_node().has_error());
    }
    assert_eq!(live_subtree_count(), baseline);

    {
        let language = ambiguous_language();
        let handles = (0..4)
            .map(|n| {
                let language = language.clone();
                thread::spawn(move || {
                    let mut parser = parser_for(&language);
                    let source = (0..=n + 3).map(|i| i.to_string()).collect::<Vec<_>>().join("+");
                    let tree = parser.parse(&source, None).unwrap();
                    tree.root_node().descendant_count()
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            assert!(handle.join().unwrap() > 1);
        }
    }
    assert_eq!(live_subtree_count(), baseline);

    // Interleaved retains, releases and copy-on-write edits.
    let language = arithmetic_language();
    let tree = parser_for(&language).parse("12 * 3 + 4 * 5", None).unwrap();
    let with_tree = live_subtree_count();
    let mut runner = TestRunner::new(Config::with_cases(64));
    runner
        .run(&prop::collection::vec(operation(), 0..48), |operations| {
            let mut retained = vec![tree.clone()];
            for operation in operations {
                match operation {
                    Operation::Retain => {
                        if let Some(last) = retained.last().cloned() {
                            retained.push(last);
                        }
                    }
                    Operation::Release => {
                        retained.pop();
                    }
                    Operation::Edit => {
                        if let Some(last) = retained.last_mut() {
                            last.edit(&widen_first_operand());
                        }
                    }
                }
            }
            drop(retained);
            prop_assert_eq!(live_subtree_count(), with_tree);
            Ok(())
        })
        .unwrap();
    assert!(!tree.root_node().has_changes());

    drop(tree);
    drop(language);
    assert_eq!(live_subtree_count(), baseline);
}
