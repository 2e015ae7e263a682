mod helpers;

use std::{
    io,
    sync::{Arc, Mutex},
};

use helpers::{arithmetic, arithmetic_language, parser_for};
use pretty_assertions::assert_eq;
use tree_sitter_engine::{
    ChunkedInput, InputEncoding, LogType, ParseError, Parser, Point, Range, StreamingIterator,
};

#[test]
fn parses_with_precedence_and_fields() {
    let language = arithmetic_language();
    let mut parser = parser_for(&language);
    let tree = parser.parse("1 + 2 * 3", None).unwrap();
    let root = tree.root_node();

    assert_eq!(
        root.to_sexp(),
        "(expression left: (expression (term (number))) right: (term (term (number)) (number)))"
    );
    assert_eq!(root.kind(), "expression");
    assert_eq!(root.kind_id(), arithmetic::EXPRESSION);
    assert_eq!(root.start_byte(), 0);
    assert_eq!(root.end_byte(), 9);
    assert_eq!(root.end_position(), Point::new(0, 9));
    assert!(!root.has_error());
}

#[test]
fn a_single_token_is_a_complete_document() {
    let language = arithmetic_language();
    let mut parser = parser_for(&language);
    let tree = parser.parse("42", None).unwrap();
    assert_eq!(tree.root_node().to_sexp(), "(expression (term (number)))");
    assert_eq!(tree.source_length(), 2);
}

#[test]
fn whitespace_becomes_padding() {
    let language = arithmetic_language();
    let mut parser = parser_for(&language);
    let tree = parser.parse("  7\n*\n 8 ", None).unwrap();
    let root = tree.root_node();

    assert_eq!(root.start_byte(), 2);
    assert_eq!(root.start_position(), Point::new(0, 2));
    assert_eq!(root.end_byte(), 9);
    assert_eq!(root.end_position(), Point::new(2, 3));

    let number = root.descendant_for_byte_range(7, 7).unwrap();
    assert_eq!(number.kind(), "number");
    assert_eq!(number.start_position(), Point::new(2, 1));
    assert_eq!(number.utf8_text(b"  7\n*\n 8 ").unwrap(), "8");
}

#[test]
fn comments_are_extras() {
    let language = arithmetic_language();
    let mut parser = parser_for(&language);
    let tree = parser.parse("1 + # two\n2", None).unwrap();
    let root = tree.root_node();

    assert_eq!(
        root.to_sexp(),
        "(expression left: (expression (term (number))) (comment) right: (term (number)))"
    );
    let comment = root.named_child(1).unwrap();
    assert!(comment.is_extra());
    assert_eq!(comment.byte_range(), 4..9);
}

#[test]
fn unexpected_characters_become_errors() {
    let language = arithmetic_language();
    let mut parser = parser_for(&language);
    let source = "1 + @ 2";
    let tree = parser.parse(source, None).unwrap();
    let root = tree.root_node();

    assert!(root.has_error());
    assert!(root.to_sexp().contains("(UNEXPECTED '@')"), "{}", root.to_sexp());
    assert_eq!(root.end_byte() as usize, source.len());
}

#[test]
fn incomplete_input_gets_a_missing_node() {
    let language = arithmetic_language();
    let mut parser = parser_for(&language);
    let tree = parser.parse("1 +", None).unwrap();
    let root = tree.root_node();

    assert!(root.has_error());
    assert!(root.to_sexp().contains("(MISSING number)"), "{}", root.to_sexp());

    let mut missing = None;
    let mut nodes = tree.preorder();
    while let Some(node) = nodes.next() {
        if node.is_missing() {
            missing = Some(*node);
        }
    }
    let missing = missing.unwrap();
    assert_eq!(missing.kind(), "number");
    assert_eq!(missing.start_byte(), missing.end_byte());
}

#[test]
fn empty_input_still_produces_a_tree() {
    let language = arithmetic_language();
    let mut parser = parser_for(&language);
    let tree = parser.parse("", None).unwrap();
    assert_eq!(tree.source_length(), 0);
    assert!(tree.root_node().has_error() || tree.root_node().child_count() == 0);
}

#[test]
fn chunked_input_matches_contiguous_input() {
    let language = arithmetic_language();
    let mut parser = parser_for(&language);
    let source = b"12 * 34 + 5 * 6";
    let expected = parser.parse(source, None).unwrap().root_node().to_sexp();

    // Hand out at most three bytes per read.
    let mut input = ChunkedInput::new(|offset: u32, _: Point| {
        let start = (offset as usize).min(source.len());
        &source[start..(start + 3).min(source.len())]
    });
    let tree = parser.parse_with(&mut input, None).unwrap();
    assert_eq!(tree.root_node().to_sexp(), expected);
    assert_eq!(tree.source_length() as usize, source.len());
}

#[test]
fn utf16_input_is_decoded() {
    let language = arithmetic_language();
    let mut parser = parser_for(&language);
    parser.set_encoding(InputEncoding::Utf16Le);
    let source = "3 * 4"
        .encode_utf16()
        .flat_map(u16::to_le_bytes)
        .collect::<Vec<u8>>();
    let tree = parser.parse(&source, None).unwrap();
    assert_eq!(
        tree.root_node().to_sexp(),
        "(expression (term (term (number)) (number)))"
    );
    assert_eq!(tree.source_length(), 10);
}

#[test]
fn included_ranges_hide_the_rest_of_the_document() {
    let language = arithmetic_language();
    let mut parser = parser_for(&language);
    let source = "xx 1 + 2 yy";
    let range = Range {
        start_byte: 3,
        end_byte: 8,
        start_point: Point::new(0, 3),
        end_point: Point::new(0, 8),
    };
    parser.set_included_ranges(&[range]).unwrap();
    let tree = parser.parse(source, None).unwrap();
    let root = tree.root_node();

    assert!(!root.has_error(), "{}", root.to_sexp());
    assert_eq!(root.start_byte(), 3);
    assert_eq!(tree.included_ranges(), &[range]);
}

#[test]
fn the_free_function_parses_with_a_fresh_parser() {
    let language = arithmetic_language();
    let mut source = "2 * 2";
    let tree = tree_sitter_engine::parse(&language, None, &mut source, None).unwrap();
    assert_eq!(
        tree.root_node().to_sexp(),
        "(expression (term (term (number)) (number)))"
    );
}

#[test]
fn parsing_requires_a_language() {
    let mut parser = Parser::new();
    assert_eq!(parser.parse("1", None).unwrap_err(), ParseError::NoLanguage);
    assert!(parser.language().is_none());
}

#[test]
fn stats_count_lexed_tokens() {
    let language = arithmetic_language();
    let mut parser = parser_for(&language);
    parser.parse("1 + 2", None).unwrap();
    let stats = parser.stats();
    // Three tokens and the end of input.
    assert_eq!(stats.lexed_tokens, 4);
    assert_eq!(stats.reused_subtrees, 0);
}

#[test]
fn the_logger_receives_parse_and_lex_messages() {
    let language = arithmetic_language();
    let mut parser = parser_for(&language);
    let messages = Arc::new(Mutex::new(Vec::<(LogType, String)>::new()));
    let sink = messages.clone();
    parser.set_logger(Some(Box::new(move |log_type: LogType, message: &str| {
        sink.lock().unwrap().push((log_type, message.to_string()));
    })));
    parser.parse("1 * 2", None).unwrap();
    parser.set_logger(None);

    let messages = messages.lock().unwrap();
    let parse_messages = messages
        .iter()
        .filter(|(log_type, _)| *log_type == LogType::Parse)
        .map(|(_, message)| message.as_str())
        .collect::<Vec<_>>();
    assert_eq!(parse_messages.first(), Some(&"new_parse"));
    assert!(parse_messages.contains(&"accept"));
    assert!(parse_messages.contains(&"reduce sym:term, child_count:3"));
    assert!(parse_messages.iter().any(|message| message.starts_with("shift state:")));
    assert!(messages
        .iter()
        .any(|(log_type, message)| *log_type == LogType::Lex && message == "consume character:'1'"));
}

#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl io::Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn dot_graphs_are_written_for_each_step() {
    let language = arithmetic_language();
    let mut parser = parser_for(&language);
    let buffer = SharedBuffer::default();
    parser.print_dot_graphs(buffer.clone());
    parser.parse("1", None).unwrap();
    parser.stop_printing_dot_graphs();

    let output = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
    assert!(output.contains("digraph stack {"));
    assert!(output.contains("digraph tree {"));

    let tree = parser.parse("1", None).unwrap();
    let mut graph = Vec::new();
    tree.print_dot_graph(&mut graph).unwrap();
    assert!(String::from_utf8(graph).unwrap().starts_with("digraph tree {"));
}
