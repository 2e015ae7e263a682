mod helpers;

use helpers::{ambiguous_language, parser_for};
use pretty_assertions::assert_eq;

const LEFT: &str = "(expression (expression (expression (number)) (expression (number))) (expression (number)))";
const RIGHT: &str = "(expression (expression (number)) (expression (expression (number)) (expression (number))))";

#[test]
fn unambiguous_input_needs_no_fork() {
    let language = ambiguous_language();
    let mut parser = parser_for(&language);
    let tree = parser.parse("1+2", None).unwrap();
    assert_eq!(
        tree.root_node().to_sexp(),
        "(expression (expression (number)) (expression (number)))"
    );
}

#[test]
fn conflicting_actions_are_resolved_by_forking() {
    let language = ambiguous_language();
    let mut parser = parser_for(&language);
    let tree = parser.parse("1+2+3", None).unwrap();
    let sexp = tree.root_node().to_sexp();

    assert!(!tree.root_node().has_error(), "{sexp}");
    assert!(sexp == LEFT || sexp == RIGHT, "{sexp}");

    // The choice between the versions does not depend on anything but the
    // input.
    for _ in 0..3 {
        let again = parser.parse("1+2+3", None).unwrap();
        assert_eq!(again.root_node().to_sexp(), sexp);
    }
}

#[test]
fn long_ambiguous_chains_stay_bounded() {
    let language = ambiguous_language();
    let mut parser = parser_for(&language);
    let source = (1..=12).map(|n| n.to_string()).collect::<Vec<_>>().join("+");
    let tree = parser.parse(&source, None).unwrap();

    assert!(!tree.root_node().has_error());
    assert_eq!(tree.source_length() as usize, source.len());
    assert_eq!(tree.root_node().named_child_count(), 2);
}
