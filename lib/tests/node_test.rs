mod helpers;

use std::thread;

use helpers::{arithmetic, arithmetic_language, parser_for};
use pretty_assertions::assert_eq;
use tree_sitter_engine::{Point, Range, StreamingIterator};

const SOURCE: &str = "1 + 2 * 3";

#[test]
fn children_and_fields() {
    let language = arithmetic_language();
    let tree = parser_for(&language).parse(SOURCE, None).unwrap();
    let root = tree.root_node();

    assert_eq!(root.child_count(), 3);
    assert_eq!(root.named_child_count(), 2);
    assert_eq!(root.child(1).unwrap().kind(), "+");
    assert!(!root.child(1).unwrap().is_named());
    assert!(root.child(3).is_none());

    let left = root.child_by_field_name("left").unwrap();
    let right = root.child_by_field_id(arithmetic::FIELD_RIGHT).unwrap();
    assert_eq!(left, root.child(0).unwrap());
    assert_eq!(right, root.named_child(1).unwrap());
    assert_eq!(right.range(), Range {
        start_byte: 4,
        end_byte: 9,
        start_point: Point::new(0, 4),
        end_point: Point::new(0, 9),
    });
    assert!(root.child_by_field_name("middle").is_none());

    assert_eq!(root.field_name_for_child(0), Some("left"));
    assert_eq!(root.field_name_for_child(1), None);
    assert_eq!(root.field_name_for_child(2), Some("right"));

    let mut cursor = tree.walk();
    let kinds = root.children(&mut cursor).map(|node| node.kind()).collect::<Vec<_>>();
    assert_eq!(kinds, ["expression", "+", "term"]);
    let named = root
        .named_children(&mut cursor)
        .map(|node| node.kind())
        .collect::<Vec<_>>();
    assert_eq!(named, ["expression", "term"]);
}

#[test]
fn parents_and_siblings() {
    let language = arithmetic_language();
    let tree = parser_for(&language).parse(SOURCE, None).unwrap();
    let root = tree.root_node();
    let left = root.child(0).unwrap();
    let plus = root.child(1).unwrap();
    let right = root.child(2).unwrap();

    assert_eq!(right.parent(), Some(root));
    assert_eq!(right.child(0).unwrap().parent(), Some(right));
    assert!(root.parent().is_none());

    assert_eq!(left.next_sibling(), Some(plus));
    assert_eq!(left.next_named_sibling(), Some(right));
    assert_eq!(right.prev_sibling(), Some(plus));
    assert_eq!(right.prev_named_sibling(), Some(left));
    // The end-of-input token is hidden.
    assert!(right.next_sibling().is_none());
    assert!(left.prev_sibling().is_none());

    let two = root.descendant_for_byte_range(4, 5).unwrap();
    assert_eq!(two.kind(), "number");
    assert_eq!(two.utf8_text(SOURCE.as_bytes()).unwrap(), "2");
    assert_eq!(root.child_with_descendant(two), Some(right));
    assert_eq!(
        root.named_descendant_for_byte_range(2, 3),
        Some(root),
        "the operator is anonymous"
    );
    assert_eq!(root.descendant_for_byte_range(2, 3), Some(plus));
}

#[test]
fn descendant_counts_match_a_preorder_walk() {
    let language = arithmetic_language();
    let tree = parser_for(&language).parse(SOURCE, None).unwrap();

    let mut kinds = Vec::new();
    let mut nodes = tree.preorder();
    while let Some(node) = nodes.next() {
        kinds.push(node.kind());
    }
    assert_eq!(
        kinds,
        [
            "expression",
            "expression",
            "term",
            "number",
            "+",
            "term",
            "term",
            "number",
            "*",
            "number",
        ]
    );
    assert_eq!(tree.root_node().descendant_count(), kinds.len());
}

#[test]
fn cursor_navigation() {
    let language = arithmetic_language();
    let tree = parser_for(&language).parse(SOURCE, None).unwrap();
    let mut cursor = tree.walk();

    assert_eq!(cursor.node(), tree.root_node());
    assert_eq!(cursor.depth(), 0);
    assert!(!cursor.goto_parent());
    assert!(!cursor.goto_next_sibling());

    assert!(cursor.goto_first_child());
    assert_eq!(cursor.node().kind(), "expression");
    assert_eq!(cursor.field_name(), Some("left"));
    assert_eq!(cursor.depth(), 1);

    assert!(cursor.goto_next_sibling());
    assert_eq!(cursor.node().kind(), "+");
    assert_eq!(cursor.field_id(), None);

    assert!(cursor.goto_next_sibling());
    assert_eq!(cursor.node().kind(), "term");
    assert_eq!(cursor.field_id(), Some(arithmetic::FIELD_RIGHT));
    assert!(!cursor.goto_next_sibling());
    assert_eq!(cursor.node().kind(), "term");

    assert!(cursor.goto_first_child());
    assert_eq!(cursor.node().byte_range(), 4..5);
    assert_eq!(cursor.depth(), 2);
    assert!(cursor.goto_parent());
    assert_eq!(cursor.node().byte_range(), 4..9);
    assert!(cursor.goto_parent());
    assert_eq!(cursor.node(), tree.root_node());

    assert!(cursor.goto_last_child());
    assert_eq!(cursor.node().kind(), "term");

    cursor.reset(tree.root_node());
    assert_eq!(cursor.goto_first_child_for_byte(3), Some(2));
    assert_eq!(cursor.node().kind(), "term");

    cursor.reset(tree.root_node());
    assert_eq!(cursor.goto_first_child_for_point(Point::new(0, 1)), Some(1));
    assert_eq!(cursor.node().kind(), "+");

    cursor.reset(tree.root_node());
    assert_eq!(cursor.goto_first_child_for_byte(9), None);
    assert_eq!(cursor.node(), tree.root_node());
}

#[test]
fn nodes_render_as_s_expressions() {
    let language = arithmetic_language();
    let tree = parser_for(&language).parse("4 * 5", None).unwrap();
    let root = tree.root_node();
    assert_eq!(root.to_string(), "(expression (term (term (number)) (number)))");
    assert_eq!(root.language().name(), "arithmetic");
    assert_eq!(root.kind_id(), arithmetic::EXPRESSION);
}

#[test]
fn trees_can_be_shared_across_threads() {
    let language = arithmetic_language();
    let tree = parser_for(&language).parse(SOURCE, None).unwrap();
    let expected = tree.root_node().to_sexp();

    let handles = (0..4)
        .map(|_| {
            let tree = tree.clone();
            thread::spawn(move || tree.root_node().to_sexp())
        })
        .collect::<Vec<_>>();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), expected);
    }
}
